//! Self-validating OAuth `state` parameter.
//!
//! The state embeds everything the callback needs (tenant, provider, the
//! redirect URI used at authorization time, and a timestamp) so the
//! callback can validate against tampering and staleness without any
//! server-side session storage.

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Payload embedded in the `state` query parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub tenant_id: String,
    pub provider: String,
    pub redirect_uri: String,
    /// Unix timestamp (seconds) at which the state was minted.
    pub timestamp: i64,
}

impl AuthState {
    pub fn new(tenant_id: &str, provider: &str, redirect_uri: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            redirect_uri: redirect_uri.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Encode as base64url(JSON) for the query string.
    pub fn encode(&self) -> SyncResult<String> {
        let json = serde_json::to_vec(self).context("Failed to serialize auth state")?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode and validate a state parameter received on the callback.
    ///
    /// Rejects undecodable or malformed values and states older than
    /// `max_age_secs` (stale authorization attempts).
    pub fn decode(state: &str, max_age_secs: i64) -> SyncResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(state)
            .map_err(|_| SyncError::Validation {
                status: 400,
                body: "Invalid OAuth state encoding".to_string(),
            })?;
        let decoded: AuthState =
            serde_json::from_slice(&bytes).map_err(|_| SyncError::Validation {
                status: 400,
                body: "Malformed OAuth state".to_string(),
            })?;

        let age = Utc::now().timestamp() - decoded.timestamp;
        if age > max_age_secs || age < -Duration::minutes(1).num_seconds() {
            return Err(SyncError::Validation {
                status: 400,
                body: "Expired OAuth state".to_string(),
            });
        }

        Ok(decoded)
    }
}
