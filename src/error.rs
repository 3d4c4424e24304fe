//! Error taxonomy for sync operations.
//!
//! Every provider-facing failure is classified into a variant that carries
//! its retryability and a stable machine code. The retry executor and the
//! orchestrator both branch on this classification.

use thiserror::Error;

/// Error that can occur during a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Provider rejected the credentials (401/403). Retryable exactly once
    /// after a forced token refresh; a second occurrence means
    /// re-authorization is required.
    #[error("authentication failed ({status}): re-authorization may be required")]
    Auth { status: u16, body: String },

    /// Provider rate limit hit (429). Always retried under backoff.
    #[error("provider rate limit exceeded")]
    RateLimit {
        /// Parsed Retry-After header, seconds, when the provider sent one.
        retry_after: Option<u64>,
        body: String,
    },

    /// Transient provider-side failure (5xx, 408, 409). Retried under backoff.
    #[error("transient provider error ({status})")]
    TransientServer { status: u16, body: String },

    /// Terminal client error (other 4xx). The raw provider payload is kept
    /// for diagnostics; never retried.
    #[error("provider rejected request ({status}): {body}")]
    Validation { status: u16, body: String },

    /// No response from the provider (DNS, connect, timeout). Retried by default.
    #[error("network error: {0}")]
    Network(String),

    /// The caller's cancellation token fired. Remaining retries are abandoned.
    #[error("operation cancelled")]
    Cancelled,

    /// Integration record missing or deactivated for this tenant/provider.
    #[error("Integration not found or inactive")]
    IntegrationInactive,

    /// A record the operation depends on does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Divergent record versions could not be auto-resolved; the job is
    /// parked awaiting manual resolution. A terminal state, not a failure
    /// of the engine itself.
    #[error("conflict requires manual resolution")]
    ConflictUnresolved,

    /// Storage, vault, or other internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Classify an HTTP response status into an error variant.
    ///
    /// 401/403 → `Auth`, 429 → `RateLimit`, 408/409/5xx → `TransientServer`,
    /// any other non-2xx → `Validation` with the raw body attached.
    pub fn classify_status(status: u16, body: String, retry_after: Option<u64>) -> Self {
        match status {
            401 | 403 => SyncError::Auth { status, body },
            429 => SyncError::RateLimit { retry_after, body },
            408 | 409 => SyncError::TransientServer { status, body },
            s if s >= 500 => SyncError::TransientServer { status, body },
            _ => SyncError::Validation { status, body },
        }
    }

    /// Default retry predicate.
    ///
    /// `attempt` is the zero-based index of the attempt that produced this
    /// error. Rate-limit, transient-server, and network errors are always
    /// retryable; auth errors are retryable exactly once (the first attempt
    /// forces a token refresh); everything else is terminal.
    pub fn is_retryable(&self, attempt: u32) -> bool {
        match self {
            SyncError::RateLimit { .. }
            | SyncError::TransientServer { .. }
            | SyncError::Network(_) => true,
            SyncError::Auth { .. } => attempt == 0,
            _ => false,
        }
    }

    /// Stable machine code for UI rendering and log rows.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Auth { .. } => "auth_failed",
            SyncError::RateLimit { .. } => "rate_limited",
            SyncError::TransientServer { .. } => "transient_server_error",
            SyncError::Validation { .. } => "validation_error",
            SyncError::Network(_) => "network_error",
            SyncError::Cancelled => "cancelled",
            SyncError::IntegrationInactive => "integration_inactive",
            SyncError::NotFound(_) => "not_found",
            SyncError::ConflictUnresolved => "requires_manual_resolution",
            SyncError::Internal(_) => "internal_error",
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
