//! Data Store collaborator boundary.
//!
//! The relational store itself is an external collaborator; this module
//! defines the records the engine owns (Integration, SyncLogEntry,
//! SyncConflict) plus the trait the engine consumes. [`SqliteStore`] is a
//! reference implementation used by tests and small deployments.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vault::SecretRef;

mod sqlite;

pub use sqlite::SqliteStore;

/// Lifecycle state of a provider connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Active,
    Inactive,
}

impl IntegrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationStatus::Active => "active",
            IntegrationStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(IntegrationStatus::Active),
            "inactive" => Some(IntegrationStatus::Inactive),
            _ => None,
        }
    }
}

/// A tenant's connection to one accounting provider.
///
/// Created on a completed OAuth exchange. Every successful refresh rewrites
/// the token references and `expires_at` together, so `expires_at` always
/// describes the currently vaulted access token.
#[derive(Clone, Debug)]
pub struct Integration {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    pub status: IntegrationStatus,
    pub access_token_ref: SecretRef,
    pub refresh_token_ref: Option<SecretRef>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

/// Direction of a sync operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

/// Terminal and non-terminal states of a sync attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Resource kinds the engine synchronizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Customer,
    Invoice,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Customer => "customer",
            ResourceType::Invoice => "invoice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(ResourceType::Customer),
            "invoice" => Some(ResourceType::Invoice),
            _ => None,
        }
    }
}

/// Durable record of one sync attempt. Doubles as the idempotency ledger:
/// created `pending`, finalized exactly once to `success` or `error`,
/// immutable thereafter.
#[derive(Clone, Debug)]
pub struct SyncLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub integration_id: String,
    pub operation: String,
    pub direction: SyncDirection,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub status: SyncStatus,
    pub duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A conflict parked for manual resolution, keyed by the sync log entry
/// ("job") that detected it.
#[derive(Clone, Debug)]
pub struct SyncConflictRecord {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub status: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// A domain record in the system of record, as the engine sees it.
/// `data` is the already-mapped payload; field mapping happens upstream.
#[derive(Clone, Debug)]
pub struct LocalResource {
    pub id: String,
    pub tenant_id: String,
    pub resource_type: ResourceType,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// Storage operations the engine consumes.
///
/// Implementations must make `link_external_id` atomic: the first writer
/// wins and later writers observe `false` ("at most one externalId
/// assignment wins").
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_integration(&self, tenant_id: &str, provider: &str)
        -> Result<Option<Integration>>;

    async fn insert_integration(&self, integration: &Integration) -> Result<()>;

    /// Atomically rewrite token references and expiry together.
    async fn update_integration_tokens(
        &self,
        integration_id: &str,
        access_ref: &SecretRef,
        refresh_ref: Option<&SecretRef>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn deactivate_integration(&self, integration_id: &str) -> Result<()>;

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<()>;

    /// Single finalizing update of a pending row.
    async fn finalize_sync_log(
        &self,
        id: &str,
        status: SyncStatus,
        duration_ms: i64,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Most recent log entry carrying the given idempotency key.
    async fn latest_log_for_key(
        &self,
        tenant_id: &str,
        integration_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<SyncLogEntry>>;

    async fn insert_conflicts(&self, conflicts: &[SyncConflictRecord]) -> Result<()>;

    async fn get_resource(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Option<LocalResource>>;

    async fn upsert_resource(&self, resource: &LocalResource) -> Result<()>;

    async fn get_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
    ) -> Result<Option<String>>;

    /// Set-once link of a local resource to its provider-side id. Returns
    /// `true` if this call created the link, `false` if one already existed.
    async fn link_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Result<bool>;

    /// Replace an existing link (explicit re-sync only).
    async fn relink_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Result<()>;
}
