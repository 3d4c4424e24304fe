//! Durable audit trail of sync attempts.
//!
//! Both operations swallow store failures with a `warn!`: a logging outage
//! must never fail an otherwise-successful sync. Callers treat a `None`
//! from `start` as "no ledger row to finalize" and carry on.

use std::sync::Arc;

use tracing::warn;

use crate::store::{DataStore, SyncLogEntry, SyncStatus};

pub struct SyncLogger {
    store: Arc<dyn DataStore>,
}

impl SyncLogger {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Insert a `pending` row for an attempt that is about to execute.
    /// Returns the row id, or `None` if the insert failed.
    pub async fn start(&self, entry: &SyncLogEntry) -> Option<String> {
        match self.store.insert_sync_log(entry).await {
            Ok(()) => Some(entry.id.clone()),
            Err(e) => {
                warn!(
                    tenant_id = %entry.tenant_id,
                    resource_id = %entry.resource_id,
                    error = %e,
                    "Failed to start sync log entry (non-critical)"
                );
                None
            }
        }
    }

    /// Finalize a pending row exactly once.
    pub async fn complete(
        &self,
        id: &str,
        status: SyncStatus,
        duration_ms: i64,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .finalize_sync_log(id, status, duration_ms, error_code, error_message)
            .await
        {
            warn!(
                log_id = %id,
                status = status.as_str(),
                error = %e,
                "Failed to finalize sync log entry (non-critical)"
            );
        }
    }
}
