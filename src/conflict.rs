//! Conflict detection and resolution between local and remote records.
//!
//! Detection diffs only an allow-list of fields per resource type and
//! ignores differences when both sides were touched within a small timestamp
//! tolerance, so clock skew between the system of record and the provider
//! does not produce phantom conflicts.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::store::{DataStore, ResourceType, SyncConflictRecord};

/// Policy picking the authoritative side of a divergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    /// Later `updated_at` wins; ties prefer local.
    NewestWins,
    /// Never auto-resolves; every conflict defers to a human.
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionAction {
    UseLocal,
    UseRemote,
    Defer,
}

/// Outcome of [`ConflictResolver::resolve`].
#[derive(Clone, Debug)]
pub struct Resolution {
    pub action: ResolutionAction,
    /// Payload of the winning side, absent when deferred.
    pub data: Option<Value>,
    pub reason: String,
}

/// One side of a comparison: payload plus its last-modified timestamp.
#[derive(Clone, Debug)]
pub struct VersionedRecord {
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// A single diverging field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldConflict {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
}

/// Fields whose divergence counts as a conflict in the coarse check.
const CRITICAL_FIELDS: &[&str] = &["name", "amount", "status", "date"];

/// Per-resource-type field allow-list for the detailed diff.
fn comparable_fields(resource_type: ResourceType) -> &'static [&'static str] {
    match resource_type {
        ResourceType::Customer => &["name", "email", "phone", "status"],
        ResourceType::Invoice => &["amount", "status", "due_date", "currency"],
    }
}

pub struct ConflictResolver {
    strategy: ConflictStrategy,
    tolerance: Duration,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, config: &EngineConfig) -> Self {
        Self {
            strategy,
            tolerance: Duration::seconds(config.conflict_tolerance_secs),
        }
    }

    /// Pick the authoritative side. One-sided presence short-circuits
    /// without consulting the strategy.
    pub fn resolve(
        &self,
        local: Option<&VersionedRecord>,
        remote: Option<&VersionedRecord>,
    ) -> Resolution {
        match (local, remote) {
            (Some(local), None) => Resolution {
                action: ResolutionAction::UseLocal,
                data: Some(local.data.clone()),
                reason: "only local version exists".to_string(),
            },
            (None, Some(remote)) => Resolution {
                action: ResolutionAction::UseRemote,
                data: Some(remote.data.clone()),
                reason: "only remote version exists".to_string(),
            },
            (None, None) => Resolution {
                action: ResolutionAction::Defer,
                data: None,
                reason: "neither version exists".to_string(),
            },
            (Some(local), Some(remote)) => self.resolve_both(local, remote),
        }
    }

    fn resolve_both(&self, local: &VersionedRecord, remote: &VersionedRecord) -> Resolution {
        match self.strategy {
            ConflictStrategy::LocalWins => Resolution {
                action: ResolutionAction::UseLocal,
                data: Some(local.data.clone()),
                reason: "strategy local_wins".to_string(),
            },
            ConflictStrategy::RemoteWins => Resolution {
                action: ResolutionAction::UseRemote,
                data: Some(remote.data.clone()),
                reason: "strategy remote_wins".to_string(),
            },
            ConflictStrategy::NewestWins => {
                if remote.updated_at > local.updated_at {
                    Resolution {
                        action: ResolutionAction::UseRemote,
                        data: Some(remote.data.clone()),
                        reason: format!(
                            "remote newer ({} > {})",
                            remote.updated_at, local.updated_at
                        ),
                    }
                } else {
                    // Equal timestamps prefer local
                    Resolution {
                        action: ResolutionAction::UseLocal,
                        data: Some(local.data.clone()),
                        reason: format!(
                            "local newer or tied ({} >= {})",
                            local.updated_at, remote.updated_at
                        ),
                    }
                }
            }
            ConflictStrategy::Manual => Resolution {
                action: ResolutionAction::Defer,
                data: None,
                reason: "strategy manual".to_string(),
            },
        }
    }

    /// Coarse check over the fixed critical-field set.
    pub fn has_conflict(&self, local: &Value, remote: &Value) -> bool {
        CRITICAL_FIELDS.iter().any(|field| {
            let l = local.get(field);
            let r = remote.get(field);
            match (l, r) {
                (Some(l), Some(r)) => l != r,
                _ => false,
            }
        })
    }

    /// Field-by-field diff over the resource type's allow-list.
    ///
    /// A field is flagged only when the values differ and the two sides'
    /// timestamps disagree by more than the tolerance.
    pub fn detect_conflicts(
        &self,
        local: &VersionedRecord,
        remote: &VersionedRecord,
        resource_type: ResourceType,
    ) -> Vec<FieldConflict> {
        let skew = (local.updated_at - remote.updated_at).abs();
        if skew <= self.tolerance {
            return Vec::new();
        }

        comparable_fields(resource_type)
            .iter()
            .filter_map(|field| {
                let local_value = local.data.get(field).cloned().unwrap_or(Value::Null);
                let remote_value = remote.data.get(field).cloned().unwrap_or(Value::Null);
                if local_value != remote_value {
                    Some(FieldConflict {
                        field: (*field).to_string(),
                        local_value,
                        remote_value,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Split conflicts into (auto-resolved, unresolved). Automatic
    /// strategies resolve everything; `Manual` resolves nothing.
    pub fn auto_resolve(
        &self,
        conflicts: Vec<FieldConflict>,
    ) -> (Vec<FieldConflict>, Vec<FieldConflict>) {
        match self.strategy {
            ConflictStrategy::Manual => (Vec::new(), conflicts),
            _ => (conflicts, Vec::new()),
        }
    }

    /// Persist unresolved conflicts as `pending` rows tied to the sync log
    /// entry ("job") that detected them.
    pub async fn request_manual_resolution(
        &self,
        store: &dyn DataStore,
        job_id: &str,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        conflicts: &[FieldConflict],
    ) -> SyncResult<()> {
        let records: Vec<SyncConflictRecord> = conflicts
            .iter()
            .map(|c| SyncConflictRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.to_string(),
                tenant_id: tenant_id.to_string(),
                resource_type,
                resource_id: resource_id.to_string(),
                status: "pending".to_string(),
                details: json!({
                    "field": c.field,
                    "local_value": c.local_value,
                    "remote_value": c.remote_value,
                }),
                created_at: Utc::now(),
            })
            .collect();

        store.insert_conflicts(&records).await?;

        info!(
            tenant_id = %tenant_id,
            resource_id = %resource_id,
            job_id = %job_id,
            conflicts = records.len(),
            "Conflicts parked for manual resolution"
        );
        Ok(())
    }
}
