//! Token vault: encrypted secret storage behind opaque references.
//!
//! OAuth access and refresh tokens are stored AES-256-GCM encrypted in
//! SQLite and addressed by random [`SecretRef`] handles. Integration records
//! persist only the references; raw tokens never leave this module except
//! through `get_*_token`. Deletion is best-effort: a failed cleanup is
//! logged and swallowed because it is never on the critical path.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

mod encryption;

/// Opaque handle to a vaulted secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a reference previously persisted on an Integration record.
    pub fn from_string(id: String) -> Self {
        SecretRef(id)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which token a vault row holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// Encrypted token store backed by SQLite.
///
/// Connection is wrapped in a `Mutex`; SQLite's serialized mode plus ACID
/// guarantees prevent partial writes.
pub struct TokenVault {
    conn: Mutex<Connection>,
    master_key: Vec<u8>,
}

impl TokenVault {
    /// Open or create a vault at `db_path` with a base64-encoded 32-byte
    /// master key.
    pub fn new<P: AsRef<Path>>(db_path: P, master_key_base64: &str) -> Result<Self> {
        let master_key =
            encryption::validate_key(master_key_base64).context("Invalid vault master key")?;

        let conn = Connection::open(db_path).context("Failed to open vault database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                ref_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                kind TEXT NOT NULL,
                token TEXT NOT NULL,
                token_nonce TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create secrets table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_secrets_tenant_provider
             ON secrets(tenant_id, provider)",
            [],
        )
        .context("Failed to create vault index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// Store an access token, returning its reference.
    pub fn store_access_token(
        &self,
        tenant_id: &str,
        provider: &str,
        token: &str,
    ) -> SyncResult<SecretRef> {
        self.store(tenant_id, provider, TokenKind::Access, token)
    }

    /// Store a refresh token, returning its reference.
    pub fn store_refresh_token(
        &self,
        tenant_id: &str,
        provider: &str,
        token: &str,
    ) -> SyncResult<SecretRef> {
        self.store(tenant_id, provider, TokenKind::Refresh, token)
    }

    /// Retrieve and decrypt an access token. `NotFound` if the reference
    /// does not resolve.
    pub fn get_access_token(&self, secret_ref: &SecretRef) -> SyncResult<String> {
        self.get(secret_ref, TokenKind::Access)
    }

    /// Retrieve and decrypt a refresh token. `NotFound` if the reference
    /// does not resolve.
    pub fn get_refresh_token(&self, secret_ref: &SecretRef) -> SyncResult<String> {
        self.get(secret_ref, TokenKind::Refresh)
    }

    /// Delete a single secret by reference. Best-effort: errors are logged
    /// and swallowed.
    pub fn delete_ref(&self, secret_ref: &SecretRef) {
        let result = self.conn.lock().unwrap().execute(
            "DELETE FROM secrets WHERE ref_id = ?1",
            params![secret_ref.as_str()],
        );
        if let Err(e) = result {
            warn!(
                ref_id = %secret_ref,
                error = %e,
                "Vault cleanup failed (non-critical)"
            );
        }
    }

    /// Delete every secret for a tenant/provider pair. Best-effort: errors
    /// are logged and swallowed.
    pub fn delete_tokens(&self, tenant_id: &str, provider: &str) {
        let result = self.conn.lock().unwrap().execute(
            "DELETE FROM secrets WHERE tenant_id = ?1 AND provider = ?2",
            params![tenant_id, provider],
        );
        if let Err(e) = result {
            warn!(
                tenant_id = %tenant_id,
                provider = %provider,
                error = %e,
                "Vault cleanup failed (non-critical)"
            );
        }
    }

    fn store(
        &self,
        tenant_id: &str,
        provider: &str,
        kind: TokenKind,
        token: &str,
    ) -> SyncResult<SecretRef> {
        let (ciphertext, nonce) =
            encryption::encrypt(token, &self.master_key).context("Failed to encrypt token")?;

        let ref_id = Uuid::new_v4().to_string();
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO secrets (ref_id, tenant_id, provider, kind, token, token_nonce, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    ref_id,
                    tenant_id,
                    provider,
                    kind.as_str(),
                    ciphertext,
                    nonce,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store secret")?;

        Ok(SecretRef(ref_id))
    }

    fn get(&self, secret_ref: &SecretRef, kind: TokenKind) -> SyncResult<String> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT token, token_nonce FROM secrets WHERE ref_id = ?1 AND kind = ?2",
                params![secret_ref.as_str(), kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query secret")?;

        let (ciphertext, nonce) = row.ok_or_else(|| {
            SyncError::NotFound(format!("{} token {}", kind.as_str(), secret_ref))
        })?;

        let token = encryption::decrypt(&ciphertext, &nonce, &self.master_key)
            .context("Failed to decrypt token")?;
        Ok(token)
    }
}
