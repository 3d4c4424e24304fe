//! OAuth 2.0 authorization code flow against accounting providers.
//!
//! The engine side of the flow:
//! 1. `authorization_url`: caller redirects the user to the provider
//! 2. Provider redirects back; the (external) callback handler decodes the
//!    `state`, then calls `exchange_code` and `store_tokens`
//! 3. `refresh_access_token` keeps the connection alive thereafter
//!
//! Token responses are persisted into the vault immediately; raw tokens are
//! never retained elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::{EngineConfig, ProviderConfig};
use crate::error::{SyncError, SyncResult};
use crate::vault::{SecretRef, TokenVault};

mod state;

pub use state::AuthState;

/// Wall-clock bound on a single token-endpoint call.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Ephemeral token set produced by a code exchange or refresh.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Vault references returned by [`OAuthManager::store_tokens`]; these are
/// what the Integration record persists.
#[derive(Clone, Debug)]
pub struct TokenRefs {
    pub access_token_ref: SecretRef,
    pub refresh_token_ref: Option<SecretRef>,
}

/// Refresh-token input. Callers hold either the raw token (fresh from an
/// exchange) or a vault reference (from an Integration record); the sum
/// type makes it impossible to pass an ambiguous value.
#[derive(Clone, Debug)]
pub enum RefreshInput {
    Token(String),
    VaultRef(SecretRef),
}

/// Manages the OAuth lifecycle for all configured providers.
pub struct OAuthManager {
    providers: HashMap<String, ProviderConfig>,
    vault: Arc<TokenVault>,
    http: reqwest::Client,
    state_max_age_secs: i64,
}

impl OAuthManager {
    pub fn new(
        providers: HashMap<String, ProviderConfig>,
        vault: Arc<TokenVault>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            providers,
            vault,
            http: reqwest::Client::new(),
            state_max_age_secs: config.state_max_age_secs,
        }
    }

    pub fn provider(&self, name: &str) -> SyncResult<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| SyncError::NotFound(format!("provider '{}'", name)))
    }

    /// Build the provider authorize URL with an embedded self-validating
    /// `state`. `redirect_override` substitutes the configured redirect URI
    /// (it must then also be passed to `exchange_code`).
    pub fn authorization_url(
        &self,
        provider: &str,
        tenant_id: &str,
        redirect_override: Option<&str>,
    ) -> SyncResult<String> {
        let config = self.provider(provider)?;
        let redirect_uri = redirect_override.unwrap_or(&config.redirect_uri);
        let state = AuthState::new(tenant_id, provider, redirect_uri).encode()?;

        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            config.authorize_url,
            urlencoding::encode(&config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&config.scope),
            urlencoding::encode(&state),
        ))
    }

    /// Decode and validate a callback `state` parameter.
    pub fn decode_state(&self, state: &str) -> SyncResult<AuthState> {
        AuthState::decode(state, self.state_max_age_secs)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// `redirect_override` must exactly match the URI used at authorization
    /// time; providers enforce this.
    pub async fn exchange_code(
        &self,
        provider: &str,
        code: &str,
        redirect_override: Option<&str>,
    ) -> SyncResult<OAuthTokens> {
        let config = self.provider(provider)?;
        let redirect_uri = redirect_override.unwrap_or(&config.redirect_uri);

        debug!(provider = %provider, "Exchanging authorization code for tokens");

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ];
        self.token_request(&config.token_url, &form).await
    }

    /// Obtain a fresh access token from a refresh token.
    pub async fn refresh_access_token(
        &self,
        provider: &str,
        input: RefreshInput,
    ) -> SyncResult<OAuthTokens> {
        let config = self.provider(provider)?;

        let refresh_token = match input {
            RefreshInput::Token(token) => token,
            RefreshInput::VaultRef(secret_ref) => self.vault.get_refresh_token(&secret_ref)?,
        };

        debug!(provider = %provider, "Refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ];
        self.token_request(&config.token_url, &form).await
    }

    /// Persist a token set into the vault, returning the references to store
    /// on the Integration record.
    pub fn store_tokens(
        &self,
        tenant_id: &str,
        provider: &str,
        tokens: &OAuthTokens,
    ) -> SyncResult<TokenRefs> {
        let access_token_ref =
            self.vault
                .store_access_token(tenant_id, provider, &tokens.access_token)?;
        let refresh_token_ref = tokens
            .refresh_token
            .as_deref()
            .map(|token| self.vault.store_refresh_token(tenant_id, provider, token))
            .transpose()?;

        debug!(
            provider = %provider,
            tenant_id = %tenant_id,
            has_refresh_token = refresh_token_ref.is_some(),
            "Stored tokens in vault"
        );

        Ok(TokenRefs {
            access_token_ref,
            refresh_token_ref,
        })
    }

    /// POST a grant to the token endpoint and parse the standard response.
    ///
    /// Non-2xx surfaces classified with the provider's raw error body;
    /// network failures propagate as `Network` for the caller's retry policy.
    async fn token_request(&self, token_url: &str, form: &[(&str, &str)]) -> SyncResult<OAuthTokens> {
        let response = self
            .http
            .post(token_url)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::classify_status(status.as_u16(), body, None));
        }

        let tokens: OAuthTokens = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("invalid token response: {}", e)))?;

        debug!(
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Token grant successful"
        );

        Ok(tokens)
    }
}
