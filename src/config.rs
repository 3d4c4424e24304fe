//! Provider and engine configuration.
//!
//! Providers are configured with fixed endpoint/scope tables and client
//! credentials from environment variables. Test code injects fully custom
//! `ProviderConfig` values instead (mock server base URLs).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// OAuth2 + API configuration for one accounting provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// OAuth authorization endpoint.
    pub authorize_url: String,

    /// OAuth token endpoint (exchange and refresh).
    pub token_url: String,

    /// Base URL for business API calls.
    pub api_base_url: String,

    pub client_id: String,
    pub client_secret: String,

    /// Callback URL registered with the provider. Must match exactly between
    /// authorization and code exchange (provider-enforced).
    pub redirect_uri: String,

    /// Space-separated OAuth scopes.
    pub scope: String,

    /// Provider's documented request budget; sizes the client's rate limiter.
    pub requests_per_minute: u32,

    /// Header carrying the idempotency key on create calls, when the
    /// provider supports one. Whether providers actually honor it is
    /// unverified; the local ledger remains the safety net either way.
    pub idempotency_header: Option<String>,
}

/// Look up the built-in configuration for a provider, reading client
/// credentials from `LEDGERSYNC_OAUTH_<PROVIDER>_CLIENT_ID` /
/// `_CLIENT_SECRET`. Returns `None` for unknown providers or missing
/// credentials.
pub fn provider_config(name: &str, redirect_uri: &str) -> Option<ProviderConfig> {
    let env_prefix = name.to_uppercase();
    let client_id = std::env::var(format!("LEDGERSYNC_OAUTH_{}_CLIENT_ID", env_prefix)).ok()?;
    let client_secret =
        std::env::var(format!("LEDGERSYNC_OAUTH_{}_CLIENT_SECRET", env_prefix)).ok()?;

    let (authorize_url, token_url, api_base_url, scope, rpm, idempotency_header) = match name {
        "quickbooks" => (
            "https://appcenter.intuit.com/connect/oauth2",
            "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer",
            "https://quickbooks.api.intuit.com/v3",
            "com.intuit.quickbooks.accounting",
            500,
            Some("Request-Id"),
        ),
        "xero" => (
            "https://login.xero.com/identity/connect/authorize",
            "https://identity.xero.com/connect/token",
            "https://api.xero.com/api.xro/2.0",
            "accounting.transactions accounting.contacts offline_access",
            60,
            Some("Idempotency-Key"),
        ),
        _ => return None,
    };

    Some(ProviderConfig {
        name: name.to_string(),
        authorize_url: authorize_url.to_string(),
        token_url: token_url.to_string(),
        api_base_url: api_base_url.to_string(),
        client_id,
        client_secret,
        redirect_uri: redirect_uri.to_string(),
        scope: scope.to_string(),
        requests_per_minute: rpm,
        idempotency_header: idempotency_header.map(str::to_string),
    })
}

/// Check if a provider name is supported.
pub fn is_supported_provider(name: &str) -> bool {
    matches!(name, "quickbooks" | "xero")
}

/// Engine-wide tunables. Defaults mirror the documented behavior; only the
/// idempotency failure mode is expected to be changed in practice.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Proactive refresh margin before access-token expiry (seconds).
    pub refresh_margin_secs: i64,

    /// Maximum accepted age of an OAuth `state` parameter (seconds).
    pub state_max_age_secs: i64,

    /// Window within which a successful sync suppresses duplicates (hours).
    pub dedup_success_hours: i64,

    /// Window within which a failed sync still suppresses re-execution
    /// (minutes); older errors allow retry.
    pub dedup_error_minutes: i64,

    /// Timestamp skew tolerated before a field difference counts as a
    /// conflict (seconds).
    pub conflict_tolerance_secs: i64,

    /// Fail-open (default) or fail-closed idempotency lookups.
    pub idempotency_fail_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 300,
            state_max_age_secs: 600,
            dedup_success_hours: 24,
            dedup_error_minutes: 5,
            conflict_tolerance_secs: 10,
            idempotency_fail_open: true,
        }
    }
}

/// Build a provider registry for the given names, skipping providers with
/// missing credentials.
pub fn load_providers(names: &[&str], redirect_uri: &str) -> HashMap<String, ProviderConfig> {
    names
        .iter()
        .filter_map(|name| provider_config(name, redirect_uri))
        .map(|config| (config.name.clone(), config))
        .collect()
}
