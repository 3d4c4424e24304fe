//! Duplicate-operation suppression backed by the sync log.
//!
//! Keys are deterministic per logical operation, so every attempt at the
//! same operation looks up the same ledger rows. A recent terminal entry or
//! an in-flight `pending` entry suppresses re-execution; errors older than
//! the error window allow a retry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::{DataStore, ResourceType, SyncDirection, SyncLogEntry, SyncStatus};

/// Deterministic key for one logical sync operation.
pub fn generate_key(
    operation: &str,
    resource_type: ResourceType,
    resource_id: &str,
    direction: SyncDirection,
) -> String {
    format!(
        "{}:{}:{}:{}",
        operation,
        resource_type.as_str(),
        resource_id,
        direction.as_str()
    )
}

/// Outcome of a ledger lookup.
#[derive(Clone, Debug)]
pub enum DedupDecision {
    /// No suppressing entry; the operation should execute.
    New,
    /// A suppressing entry exists; its prior outcome is echoed back.
    Duplicate(SyncLogEntry),
}

impl DedupDecision {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupDecision::Duplicate(_))
    }
}

pub struct IdempotencyChecker {
    store: Arc<dyn DataStore>,
    success_window: Duration,
    error_window: Duration,
    /// Fail-open treats a ledger lookup failure as "not a duplicate"
    /// (risking a duplicate execution); fail-closed propagates the error
    /// (risking a false rejection).
    fail_open: bool,
}

impl IdempotencyChecker {
    pub fn new(store: Arc<dyn DataStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            success_window: Duration::hours(config.dedup_success_hours),
            error_window: Duration::minutes(config.dedup_error_minutes),
            fail_open: config.idempotency_fail_open,
        }
    }

    /// Decide whether an operation with this key may execute.
    pub async fn check(
        &self,
        tenant_id: &str,
        integration_id: &str,
        key: &str,
    ) -> SyncResult<DedupDecision> {
        let lookup = self
            .store
            .latest_log_for_key(tenant_id, integration_id, key)
            .await;

        let entry = match lookup {
            Ok(entry) => entry,
            Err(e) if self.fail_open => {
                warn!(
                    tenant_id = %tenant_id,
                    idempotency_key = %key,
                    error = %e,
                    "Idempotency lookup failed, proceeding (fail-open)"
                );
                return Ok(DedupDecision::New);
            }
            Err(e) => return Err(SyncError::Internal(e)),
        };

        let Some(entry) = entry else {
            return Ok(DedupDecision::New);
        };

        let age = Utc::now() - entry.created_at;
        let suppresses = match entry.status {
            // In-flight work always suppresses a concurrent duplicate
            SyncStatus::Pending => true,
            SyncStatus::Success => age < self.success_window,
            SyncStatus::Error => age <= self.error_window,
        };

        if suppresses {
            Ok(DedupDecision::Duplicate(entry))
        } else {
            Ok(DedupDecision::New)
        }
    }
}
