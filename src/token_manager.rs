//! Access-token lifecycle with single-flight refresh.
//!
//! Callers ask for a valid access token; proactive refresh happens here when
//! the vaulted token is within the expiry margin. Refreshes for the same
//! tenant/provider pair are serialized through a keyed mutex so concurrent
//! operations perform exactly one provider round trip, and the integration
//! row is re-read after acquiring the lock in case another task already
//! refreshed.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::oauth::{OAuthManager, RefreshInput};
use crate::store::{DataStore, Integration, IntegrationStatus};
use crate::vault::{SecretRef, TokenVault};

pub struct TokenManager {
    store: Arc<dyn DataStore>,
    oauth: Arc<OAuthManager>,
    vault: Arc<TokenVault>,
    refresh_margin_secs: i64,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn DataStore>,
        oauth: Arc<OAuthManager>,
        vault: Arc<TokenVault>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            oauth,
            vault,
            refresh_margin_secs: config.refresh_margin_secs,
            refresh_locks: DashMap::new(),
        }
    }

    /// Return a currently valid access token for the tenant's integration,
    /// refreshing it first if it expires within the margin.
    pub async fn get_valid_access_token(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> SyncResult<String> {
        let integration = self.active_integration(tenant_id, provider).await?;

        if self.is_fresh(&integration) {
            return Ok(self.vault.get_access_token(&integration.access_token_ref)?);
        }

        self.refresh_serialized(tenant_id, provider, &integration.access_token_ref)
            .await
    }

    /// Refresh unconditionally, regardless of recorded expiry. Used after a
    /// provider rejects a token that looked valid locally.
    ///
    /// `stale_ref` is the access-token reference the caller just failed
    /// with; if another task already rotated it the fresh token is returned
    /// without a second provider round trip.
    pub async fn force_refresh(
        &self,
        tenant_id: &str,
        provider: &str,
        stale_ref: &SecretRef,
    ) -> SyncResult<String> {
        self.refresh_serialized(tenant_id, provider, stale_ref).await
    }

    /// Current access-token reference, for callers that need to report a
    /// stale token back via [`force_refresh`].
    pub async fn current_access_ref(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> SyncResult<SecretRef> {
        let integration = self.active_integration(tenant_id, provider).await?;
        Ok(integration.access_token_ref)
    }

    async fn active_integration(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> SyncResult<Integration> {
        let integration = self
            .store
            .get_integration(tenant_id, provider)
            .await?
            .ok_or(SyncError::IntegrationInactive)?;
        if integration.status != IntegrationStatus::Active {
            return Err(SyncError::IntegrationInactive);
        }
        Ok(integration)
    }

    /// Token is fresh when its recorded expiry is further out than the
    /// margin. Tokens with no recorded expiry never refresh proactively.
    fn is_fresh(&self, integration: &Integration) -> bool {
        match integration.expires_at {
            Some(expires_at) => {
                expires_at - Utc::now() > Duration::seconds(self.refresh_margin_secs)
            }
            None => true,
        }
    }

    async fn refresh_serialized(
        &self,
        tenant_id: &str,
        provider: &str,
        observed_ref: &SecretRef,
    ) -> SyncResult<String> {
        let lock = self
            .refresh_locks
            .entry(format!("{}:{}", tenant_id, provider))
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while this one waited for the
        // lock; a rotated reference means the stored token is already new.
        let integration = self.active_integration(tenant_id, provider).await?;
        if integration.access_token_ref != *observed_ref {
            debug!(
                tenant_id = %tenant_id,
                provider = %provider,
                "Token already refreshed by concurrent task"
            );
            return Ok(self.vault.get_access_token(&integration.access_token_ref)?);
        }

        self.refresh(tenant_id, provider, integration).await
    }

    async fn refresh(
        &self,
        tenant_id: &str,
        provider: &str,
        integration: Integration,
    ) -> SyncResult<String> {
        let refresh_ref = integration.refresh_token_ref.clone().ok_or_else(|| {
            SyncError::Auth {
                status: 401,
                body: "no refresh token on file".to_string(),
            }
        })?;

        let tokens = self
            .oauth
            .refresh_access_token(provider, RefreshInput::VaultRef(refresh_ref.clone()))
            .await?;

        let refs = self.oauth.store_tokens(tenant_id, provider, &tokens)?;
        // Providers that do not rotate the refresh token keep the old one.
        let rotated = refs.refresh_token_ref.is_some();
        let new_refresh_ref = refs.refresh_token_ref.unwrap_or_else(|| refresh_ref.clone());
        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        self.store
            .update_integration_tokens(
                &integration.id,
                &refs.access_token_ref,
                Some(&new_refresh_ref),
                expires_at,
            )
            .await?;

        // Old secrets are unreachable once the row points at the new refs.
        self.vault.delete_ref(&integration.access_token_ref);
        if rotated {
            self.vault.delete_ref(&refresh_ref);
        }

        info!(
            tenant_id = %tenant_id,
            provider = %provider,
            expires_at = ?expires_at,
            refresh_token_rotated = rotated,
            "Access token refreshed"
        );

        Ok(tokens.access_token)
    }
}
