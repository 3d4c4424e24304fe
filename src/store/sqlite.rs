//! SQLite reference implementation of [`DataStore`].

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{
    DataStore, Integration, IntegrationStatus, LocalResource, ResourceType, SyncConflictRecord,
    SyncDirection, SyncLogEntry, SyncStatus,
};
use crate::vault::SecretRef;

/// `DataStore` backed by a single SQLite file.
///
/// Connection is wrapped in a `Mutex`; statements run serialized, which is
/// enough for the engine's access pattern (short point reads and writes).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open data store")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                access_token_ref TEXT NOT NULL,
                refresh_token_ref TEXT,
                expires_at TEXT,
                metadata TEXT NOT NULL,
                UNIQUE(tenant_id, provider)
            );

            CREATE TABLE IF NOT EXISTS sync_logs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                integration_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                direction TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER,
                error_code TEXT,
                error_message TEXT,
                idempotency_key TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_key
                ON sync_logs(tenant_id, integration_id, idempotency_key, created_at);

            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resources (
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, resource_type, id)
            );

            CREATE TABLE IF NOT EXISTS resource_links (
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, resource_type, resource_id, provider)
            );
            "#,
        )
        .context("Failed to create data store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    /// Conflict rows recorded for one sync log entry.
    pub fn conflicts_for_job(&self, job_id: &str) -> Result<Vec<SyncConflictRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, job_id, tenant_id, resource_type, resource_id, status,
                       details, created_at
                FROM sync_conflicts WHERE job_id = ?1 ORDER BY created_at
                "#,
            )
            .context("Failed to prepare conflict query")?;

        let raw: Vec<(String, String, String, String, String, String, String, String)> = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })
            .context("Failed to query conflicts")?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to read conflict rows")?;

        raw.into_iter()
            .map(
                |(id, job_id, tenant_id, resource_type, resource_id, status, details, created_at)| {
                    Ok(SyncConflictRecord {
                        resource_type: ResourceType::parse(&resource_type)
                            .with_context(|| format!("Unknown resource type '{}'", resource_type))?,
                        details: serde_json::from_str(&details)
                            .context("Failed to parse conflict details")?,
                        created_at: parse_timestamp(&created_at)?,
                        id,
                        job_id,
                        tenant_id,
                        resource_id,
                        status,
                    })
                },
            )
            .collect()
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse stored timestamp")
}

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<(Integration, Option<String>)> {
    let status: String = row.get(3)?;
    let refresh_ref: Option<String> = row.get(5)?;
    let expires_at: Option<String> = row.get(6)?;
    let metadata: String = row.get(7)?;
    Ok((
        Integration {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            provider: row.get(2)?,
            status: IntegrationStatus::parse(&status).unwrap_or(IntegrationStatus::Inactive),
            access_token_ref: SecretRef::from_string(row.get(4)?),
            refresh_token_ref: refresh_ref.map(SecretRef::from_string),
            expires_at: None,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        },
        expires_at,
    ))
}

/// Raw sync_logs row, converted to [`SyncLogEntry`] outside the rusqlite
/// closure where anyhow context is available.
struct RawLog {
    id: String,
    tenant_id: String,
    integration_id: String,
    operation: String,
    direction: String,
    resource_type: String,
    resource_id: String,
    status: String,
    duration_ms: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
    idempotency_key: Option<String>,
    created_at: String,
}

fn raw_log_from_row(row: &Row<'_>) -> rusqlite::Result<RawLog> {
    Ok(RawLog {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        integration_id: row.get(2)?,
        operation: row.get(3)?,
        direction: row.get(4)?,
        resource_type: row.get(5)?,
        resource_id: row.get(6)?,
        status: row.get(7)?,
        duration_ms: row.get(8)?,
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        idempotency_key: row.get(11)?,
        created_at: row.get(12)?,
    })
}

impl RawLog {
    fn into_entry(self) -> Result<SyncLogEntry> {
        Ok(SyncLogEntry {
            direction: match self.direction.as_str() {
                "pull" => SyncDirection::Pull,
                "bidirectional" => SyncDirection::Bidirectional,
                _ => SyncDirection::Push,
            },
            resource_type: ResourceType::parse(&self.resource_type)
                .with_context(|| format!("Unknown resource type '{}'", self.resource_type))?,
            status: SyncStatus::parse(&self.status)
                .with_context(|| format!("Unknown sync status '{}'", self.status))?,
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            tenant_id: self.tenant_id,
            integration_id: self.integration_id,
            operation: self.operation,
            resource_id: self.resource_id,
            duration_ms: self.duration_ms,
            error_code: self.error_code,
            error_message: self.error_message,
            idempotency_key: self.idempotency_key,
        })
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn get_integration(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> Result<Option<Integration>> {
        let row = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                r#"
                SELECT id, tenant_id, provider, status, access_token_ref,
                       refresh_token_ref, expires_at, metadata
                FROM integrations WHERE tenant_id = ?1 AND provider = ?2
                "#,
                params![tenant_id, provider],
                integration_from_row,
            )
            .optional()
            .context("Failed to query integration")?;

        match row {
            None => Ok(None),
            Some((mut integration, expires_at)) => {
                integration.expires_at = expires_at.as_deref().map(parse_timestamp).transpose()?;
                Ok(Some(integration))
            }
        }
    }

    async fn insert_integration(&self, integration: &Integration) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO integrations
                    (id, tenant_id, provider, status, access_token_ref,
                     refresh_token_ref, expires_at, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(tenant_id, provider) DO UPDATE SET
                    status = excluded.status,
                    access_token_ref = excluded.access_token_ref,
                    refresh_token_ref = excluded.refresh_token_ref,
                    expires_at = excluded.expires_at,
                    metadata = excluded.metadata
                "#,
                params![
                    integration.id,
                    integration.tenant_id,
                    integration.provider,
                    integration.status.as_str(),
                    integration.access_token_ref.as_str(),
                    integration.refresh_token_ref.as_ref().map(|r| r.as_str()),
                    integration.expires_at.map(|t| t.to_rfc3339()),
                    integration.metadata.to_string(),
                ],
            )
            .context("Failed to insert integration")?;
        Ok(())
    }

    async fn update_integration_tokens(
        &self,
        integration_id: &str,
        access_ref: &SecretRef,
        refresh_ref: Option<&SecretRef>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE integrations
                SET access_token_ref = ?2, refresh_token_ref = ?3, expires_at = ?4
                WHERE id = ?1
                "#,
                params![
                    integration_id,
                    access_ref.as_str(),
                    refresh_ref.map(|r| r.as_str()),
                    expires_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to update integration tokens")?;
        anyhow::ensure!(updated == 1, "integration {} not found", integration_id);
        Ok(())
    }

    async fn deactivate_integration(&self, integration_id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET status = 'inactive' WHERE id = ?1",
                params![integration_id],
            )
            .context("Failed to deactivate integration")?;
        Ok(())
    }

    async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO sync_logs
                    (id, tenant_id, integration_id, operation, direction, resource_type,
                     resource_id, status, duration_ms, error_code, error_message,
                     idempotency_key, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    entry.id,
                    entry.tenant_id,
                    entry.integration_id,
                    entry.operation,
                    entry.direction.as_str(),
                    entry.resource_type.as_str(),
                    entry.resource_id,
                    entry.status.as_str(),
                    entry.duration_ms,
                    entry.error_code,
                    entry.error_message,
                    entry.idempotency_key,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert sync log entry")?;
        Ok(())
    }

    async fn finalize_sync_log(
        &self,
        id: &str,
        status: SyncStatus,
        duration_ms: i64,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        // Finalization only ever moves a pending row; terminal rows are immutable
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE sync_logs
                SET status = ?2, duration_ms = ?3, error_code = ?4, error_message = ?5
                WHERE id = ?1 AND status = 'pending'
                "#,
                params![id, status.as_str(), duration_ms, error_code, error_message],
            )
            .context("Failed to finalize sync log entry")?;
        anyhow::ensure!(updated == 1, "sync log entry {} not pending", id);
        Ok(())
    }

    async fn latest_log_for_key(
        &self,
        tenant_id: &str,
        integration_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<SyncLogEntry>> {
        let row = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                r#"
                SELECT id, tenant_id, integration_id, operation, direction, resource_type,
                       resource_id, status, duration_ms, error_code, error_message,
                       idempotency_key, created_at
                FROM sync_logs
                WHERE tenant_id = ?1 AND integration_id = ?2 AND idempotency_key = ?3
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                params![tenant_id, integration_id, idempotency_key],
                raw_log_from_row,
            )
            .optional()
            .context("Failed to query sync log by idempotency key")?;

        row.map(RawLog::into_entry).transpose()
    }

    async fn insert_conflicts(&self, conflicts: &[SyncConflictRecord]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for conflict in conflicts {
            conn.execute(
                r#"
                INSERT INTO sync_conflicts
                    (id, job_id, tenant_id, resource_type, resource_id, status, details, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    conflict.id,
                    conflict.job_id,
                    conflict.tenant_id,
                    conflict.resource_type.as_str(),
                    conflict.resource_id,
                    conflict.status,
                    conflict.details.to_string(),
                    conflict.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert sync conflict")?;
        }
        Ok(())
    }

    async fn get_resource(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Option<LocalResource>> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                r#"
                SELECT data, updated_at FROM resources
                WHERE tenant_id = ?1 AND resource_type = ?2 AND id = ?3
                "#,
                params![tenant_id, resource_type.as_str(), resource_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query resource")?;

        match row {
            None => Ok(None),
            Some((data, updated_at)) => Ok(Some(LocalResource {
                id: resource_id.to_string(),
                tenant_id: tenant_id.to_string(),
                resource_type,
                data: serde_json::from_str(&data).context("Failed to parse resource data")?,
                updated_at: parse_timestamp(&updated_at)?,
            })),
        }
    }

    async fn upsert_resource(&self, resource: &LocalResource) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO resources (tenant_id, resource_type, id, data, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(tenant_id, resource_type, id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
                params![
                    resource.tenant_id,
                    resource.resource_type.as_str(),
                    resource.id,
                    resource.data.to_string(),
                    resource.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert resource")?;
        Ok(())
    }

    async fn get_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
    ) -> Result<Option<String>> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                r#"
                SELECT external_id FROM resource_links
                WHERE tenant_id = ?1 AND resource_type = ?2 AND resource_id = ?3 AND provider = ?4
                "#,
                params![tenant_id, resource_type.as_str(), resource_id, provider],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query external id")
    }

    async fn link_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Result<bool> {
        // INSERT OR IGNORE makes the first writer win atomically
        let inserted = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT OR IGNORE INTO resource_links
                    (tenant_id, resource_type, resource_id, provider, external_id)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    tenant_id,
                    resource_type.as_str(),
                    resource_id,
                    provider,
                    external_id
                ],
            )
            .context("Failed to link external id")?;
        Ok(inserted == 1)
    }

    async fn relink_external_id(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT OR REPLACE INTO resource_links
                    (tenant_id, resource_type, resource_id, provider, external_id)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    tenant_id,
                    resource_type.as_str(),
                    resource_id,
                    provider,
                    external_id
                ],
            )
            .context("Failed to relink external id")?;
        Ok(())
    }
}
