//! Sync orchestration: the linear state machine tying everything together.
//!
//! Push: LoadIntegration, CheckIdempotency, StartLog, FetchLocalResource,
//! conflict detection when an external link exists, PushToProvider,
//! PersistExternalId, CompleteLog. Every error path finalizes the log entry
//! with its classified code before the structured outcome is returned; no
//! error escapes unlogged.
//!
//! Concurrent calls for distinct resources are safe. For the same
//! resource and direction the idempotency ledger is the only duplicate
//! guard; there is no per-resource lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{ApiResponse, ProviderClient};
use crate::config::{EngineConfig, ProviderConfig};
use crate::conflict::{ConflictResolver, ConflictStrategy, ResolutionAction, VersionedRecord};
use crate::error::{SyncError, SyncResult};
use crate::idempotency::{generate_key, DedupDecision, IdempotencyChecker};
use crate::oauth::OAuthManager;
use crate::retry::RetryPolicy;
use crate::store::{
    DataStore, Integration, IntegrationStatus, LocalResource, ResourceType, SyncDirection,
    SyncLogEntry, SyncStatus,
};
use crate::sync_log::SyncLogger;
use crate::token_manager::TokenManager;
use crate::vault::TokenVault;

/// Structured result of one sync operation.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub success: bool,
    pub external_id: Option<String>,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            error_code: None,
            error: None,
        }
    }

    fn failed(err: &SyncError) -> Self {
        Self {
            success: false,
            external_id: None,
            error_code: Some(err.error_code().to_string()),
            error: Some(err.to_string()),
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn DataStore>,
    vault: Arc<TokenVault>,
    oauth: Arc<OAuthManager>,
    tokens: Arc<TokenManager>,
    providers: HashMap<String, ProviderConfig>,
    idempotency: IdempotencyChecker,
    logger: SyncLogger,
    resolver: ConflictResolver,
    clients: DashMap<String, Arc<ProviderClient>>,
    retry: Option<RetryPolicy>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn DataStore>,
        vault: Arc<TokenVault>,
        providers: HashMap<String, ProviderConfig>,
        strategy: ConflictStrategy,
        config: EngineConfig,
    ) -> Self {
        let oauth = Arc::new(OAuthManager::new(providers.clone(), vault.clone(), &config));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            oauth.clone(),
            vault.clone(),
            &config,
        ));
        Self {
            idempotency: IdempotencyChecker::new(store.clone(), &config),
            logger: SyncLogger::new(store.clone()),
            resolver: ConflictResolver::new(strategy, &config),
            store,
            vault,
            oauth,
            tokens,
            providers,
            clients: DashMap::new(),
            retry: None,
        }
    }

    /// Override the backoff policy used by provider clients.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The OAuth manager, for callback handlers driving the connect flow.
    pub fn oauth(&self) -> &OAuthManager {
        &self.oauth
    }

    /// Complete a provider connection from an exchanged authorization code:
    /// vault the tokens and activate the Integration record.
    pub async fn connect(
        &self,
        tenant_id: &str,
        provider: &str,
        code: &str,
        redirect_override: Option<&str>,
    ) -> SyncResult<Integration> {
        let tokens = self
            .oauth
            .exchange_code(provider, code, redirect_override)
            .await?;
        let refs = self.oauth.store_tokens(tenant_id, provider, &tokens)?;

        let integration = Integration {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            status: IntegrationStatus::Active,
            access_token_ref: refs.access_token_ref,
            refresh_token_ref: refs.refresh_token_ref,
            expires_at: tokens
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
            metadata: Value::Object(Default::default()),
        };
        self.store.insert_integration(&integration).await?;

        info!(
            tenant_id = %tenant_id,
            provider = %provider,
            integration_id = %integration.id,
            "Provider connected"
        );
        Ok(integration)
    }

    /// Deactivate the integration and best-effort delete its vaulted tokens.
    pub async fn disconnect(&self, tenant_id: &str, provider: &str) -> SyncResult<()> {
        let integration = self
            .store
            .get_integration(tenant_id, provider)
            .await?
            .ok_or(SyncError::IntegrationInactive)?;

        self.store.deactivate_integration(&integration.id).await?;
        self.vault.delete_tokens(tenant_id, provider);

        info!(
            tenant_id = %tenant_id,
            provider = %provider,
            integration_id = %integration.id,
            "Provider disconnected"
        );
        Ok(())
    }

    /// Rebind a local resource to a different provider-side record.
    ///
    /// Escape hatch for operators repairing a bad link (wrong match, remote
    /// record recreated). Normal syncs never rebind: `link_external_id` is
    /// set-once and the first writer wins.
    pub async fn relink_resource(
        &self,
        tenant_id: &str,
        provider: &str,
        resource_type: ResourceType,
        resource_id: &str,
        external_id: &str,
    ) -> SyncResult<()> {
        let integration = self.active_integration(tenant_id, provider).await?;
        self.store
            .relink_external_id(tenant_id, resource_type, resource_id, provider, external_id)
            .await?;

        info!(
            tenant_id = %tenant_id,
            provider = %provider,
            integration_id = %integration.id,
            resource_id = %resource_id,
            external_id = %external_id,
            "External id relinked"
        );
        Ok(())
    }

    pub async fn sync_customer_to_accounting(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_id: &str,
    ) -> SyncOutcome {
        self.push(cancel, tenant_id, provider, ResourceType::Customer, resource_id)
            .await
    }

    pub async fn sync_invoice_to_accounting(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_id: &str,
    ) -> SyncOutcome {
        self.push(cancel, tenant_id, provider, ResourceType::Invoice, resource_id)
            .await
    }

    pub async fn pull_customer_from_accounting(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_id: &str,
    ) -> SyncOutcome {
        self.pull(cancel, tenant_id, provider, ResourceType::Customer, resource_id)
            .await
    }

    pub async fn pull_invoice_from_accounting(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_id: &str,
    ) -> SyncOutcome {
        self.pull(cancel, tenant_id, provider, ResourceType::Invoice, resource_id)
            .await
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> SyncOutcome {
        let integration = match self.active_integration(tenant_id, provider).await {
            Ok(i) => i,
            Err(e) => return SyncOutcome::failed(&e),
        };

        let key = generate_key("sync", resource_type, resource_id, SyncDirection::Push);
        match self.idempotency.check(tenant_id, &integration.id, &key).await {
            Ok(DedupDecision::New) => {}
            Ok(DedupDecision::Duplicate(prior)) => {
                return self
                    .echo_prior(tenant_id, provider, resource_type, resource_id, prior)
                    .await;
            }
            Err(e) => return SyncOutcome::failed(&e),
        }

        let entry = self.pending_entry(
            &integration,
            resource_type,
            resource_id,
            SyncDirection::Push,
            &key,
        );
        let log_id = self.logger.start(&entry).await;
        let started = Instant::now();

        let result = self
            .push_inner(cancel, &integration, resource_type, resource_id, &entry.id, &key)
            .await;
        self.finalize(log_id, started, &result).await;

        match result {
            Ok(external_id) => SyncOutcome::ok(Some(external_id)),
            Err(e) => SyncOutcome::failed(&e),
        }
    }

    async fn push_inner(
        &self,
        cancel: &CancellationToken,
        integration: &Integration,
        resource_type: ResourceType,
        resource_id: &str,
        job_id: &str,
        idempotency_key: &str,
    ) -> SyncResult<String> {
        let tenant_id = &integration.tenant_id;
        let provider = &integration.provider;
        let client = self.client(tenant_id, provider)?;

        let resource = self
            .store
            .get_resource(tenant_id, resource_type, resource_id)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!("{} {}", resource_type.as_str(), resource_id))
            })?;

        let existing = self
            .store
            .get_external_id(tenant_id, resource_type, resource_id, provider)
            .await?;

        match existing {
            Some(external_id) => {
                self.push_update(cancel, &client, integration, &resource, &external_id, job_id)
                    .await
            }
            None => {
                self.push_create(cancel, &client, integration, &resource, idempotency_key)
                    .await
            }
        }
    }

    /// Create the resource remotely and link its external id, first writer
    /// wins.
    async fn push_create(
        &self,
        cancel: &CancellationToken,
        client: &ProviderClient,
        integration: &Integration,
        resource: &LocalResource,
        idempotency_key: &str,
    ) -> SyncResult<String> {
        let response = match resource.resource_type {
            ResourceType::Customer => {
                client
                    .create_customer(cancel, &resource.data, idempotency_key)
                    .await?
            }
            ResourceType::Invoice => {
                client
                    .create_invoice(cancel, &resource.data, idempotency_key)
                    .await?
            }
        };
        let external_id = extract_external_id(&response)?;

        let won = self
            .store
            .link_external_id(
                &integration.tenant_id,
                resource.resource_type,
                &resource.id,
                &integration.provider,
                &external_id,
            )
            .await?;

        if won {
            return Ok(external_id);
        }

        // Lost the link race; the canonical link wins and the record this
        // call created remotely is orphaned.
        warn!(
            tenant_id = %integration.tenant_id,
            resource_id = %resource.id,
            orphaned_external_id = %external_id,
            "External id already linked by a concurrent sync"
        );
        let canonical = self
            .store
            .get_external_id(
                &integration.tenant_id,
                resource.resource_type,
                &resource.id,
                &integration.provider,
            )
            .await?;
        canonical.ok_or_else(|| SyncError::NotFound("external id link".to_string()))
    }

    /// Update a linked resource, resolving divergence first.
    async fn push_update(
        &self,
        cancel: &CancellationToken,
        client: &ProviderClient,
        integration: &Integration,
        resource: &LocalResource,
        external_id: &str,
        job_id: &str,
    ) -> SyncResult<String> {
        let remote_response = match resource.resource_type {
            ResourceType::Customer => client.get_customer(cancel, external_id).await?,
            ResourceType::Invoice => client.get_invoice(cancel, external_id).await?,
        };

        let local = VersionedRecord {
            data: resource.data.clone(),
            updated_at: resource.updated_at,
        };
        let remote = VersionedRecord {
            updated_at: remote_timestamp(&remote_response.data),
            data: remote_response.data,
        };

        let conflicts = self
            .resolver
            .detect_conflicts(&local, &remote, resource.resource_type);
        if !conflicts.is_empty() {
            let (_, unresolved) = self.resolver.auto_resolve(conflicts);
            if !unresolved.is_empty() {
                self.resolver
                    .request_manual_resolution(
                        self.store.as_ref(),
                        job_id,
                        &integration.tenant_id,
                        resource.resource_type,
                        &resource.id,
                        &unresolved,
                    )
                    .await?;
                return Err(SyncError::ConflictUnresolved);
            }

            match self.resolver.resolve(Some(&local), Some(&remote)).action {
                ResolutionAction::UseLocal => {}
                ResolutionAction::UseRemote => {
                    // Remote side is authoritative; adopt it locally and
                    // skip the provider write
                    self.store
                        .upsert_resource(&LocalResource {
                            id: resource.id.clone(),
                            tenant_id: integration.tenant_id.clone(),
                            resource_type: resource.resource_type,
                            data: remote.data.clone(),
                            updated_at: Utc::now(),
                        })
                        .await?;
                    return Ok(external_id.to_string());
                }
                ResolutionAction::Defer => return Err(SyncError::ConflictUnresolved),
            }
        }

        match resource.resource_type {
            ResourceType::Customer => {
                client
                    .update_customer(cancel, external_id, &resource.data)
                    .await?
            }
            ResourceType::Invoice => {
                client
                    .update_invoice(cancel, external_id, &resource.data)
                    .await?
            }
        };
        Ok(external_id.to_string())
    }

    async fn pull(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        provider: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> SyncOutcome {
        let integration = match self.active_integration(tenant_id, provider).await {
            Ok(i) => i,
            Err(e) => return SyncOutcome::failed(&e),
        };

        let key = generate_key("sync", resource_type, resource_id, SyncDirection::Pull);
        match self.idempotency.check(tenant_id, &integration.id, &key).await {
            Ok(DedupDecision::New) => {}
            Ok(DedupDecision::Duplicate(prior)) => {
                return self
                    .echo_prior(tenant_id, provider, resource_type, resource_id, prior)
                    .await;
            }
            Err(e) => return SyncOutcome::failed(&e),
        }

        let entry = self.pending_entry(
            &integration,
            resource_type,
            resource_id,
            SyncDirection::Pull,
            &key,
        );
        let log_id = self.logger.start(&entry).await;
        let started = Instant::now();

        let result = self
            .pull_inner(cancel, &integration, resource_type, resource_id, &entry.id)
            .await;
        self.finalize(log_id, started, &result).await;

        match result {
            Ok(external_id) => SyncOutcome::ok(Some(external_id)),
            Err(e) => SyncOutcome::failed(&e),
        }
    }

    async fn pull_inner(
        &self,
        cancel: &CancellationToken,
        integration: &Integration,
        resource_type: ResourceType,
        resource_id: &str,
        job_id: &str,
    ) -> SyncResult<String> {
        let tenant_id = &integration.tenant_id;
        let provider = &integration.provider;
        let client = self.client(tenant_id, provider)?;

        let external_id = self
            .store
            .get_external_id(tenant_id, resource_type, resource_id, provider)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "external link for {} {}",
                    resource_type.as_str(),
                    resource_id
                ))
            })?;

        let remote_response = match resource_type {
            ResourceType::Customer => client.get_customer(cancel, &external_id).await?,
            ResourceType::Invoice => client.get_invoice(cancel, &external_id).await?,
        };
        let remote = VersionedRecord {
            updated_at: remote_timestamp(&remote_response.data),
            data: remote_response.data,
        };

        let local = self
            .store
            .get_resource(tenant_id, resource_type, resource_id)
            .await?
            .map(|r| VersionedRecord {
                data: r.data,
                updated_at: r.updated_at,
            });

        match self.resolver.resolve(local.as_ref(), Some(&remote)).action {
            ResolutionAction::UseLocal => Ok(external_id),
            ResolutionAction::UseRemote => {
                self.store
                    .upsert_resource(&LocalResource {
                        id: resource_id.to_string(),
                        tenant_id: tenant_id.clone(),
                        resource_type,
                        data: remote.data.clone(),
                        updated_at: Utc::now(),
                    })
                    .await?;
                Ok(external_id)
            }
            ResolutionAction::Defer => {
                if let Some(local) = &local {
                    let conflicts = self.resolver.detect_conflicts(local, &remote, resource_type);
                    if !conflicts.is_empty() {
                        self.resolver
                            .request_manual_resolution(
                                self.store.as_ref(),
                                job_id,
                                tenant_id,
                                resource_type,
                                resource_id,
                                &conflicts,
                            )
                            .await?;
                    }
                }
                Err(SyncError::ConflictUnresolved)
            }
        }
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

    /// Echo the outcome a suppressing ledger entry already recorded.
    async fn echo_prior(
        &self,
        tenant_id: &str,
        provider: &str,
        resource_type: ResourceType,
        resource_id: &str,
        prior: SyncLogEntry,
    ) -> SyncOutcome {
        info!(
            tenant_id = %tenant_id,
            resource_id = %resource_id,
            prior_status = prior.status.as_str(),
            "Duplicate sync suppressed by idempotency ledger"
        );
        match prior.status {
            SyncStatus::Success => {
                let external_id = match self
                    .store
                    .get_external_id(tenant_id, resource_type, resource_id, provider)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(
                            tenant_id = %tenant_id,
                            resource_id = %resource_id,
                            error = %e,
                            "Failed to load external id for duplicate echo (non-critical)"
                        );
                        None
                    }
                };
                SyncOutcome::ok(external_id)
            }
            SyncStatus::Pending => SyncOutcome {
                success: false,
                external_id: None,
                error_code: Some("sync_in_progress".to_string()),
                error: Some("A sync for this resource is already in progress".to_string()),
            },
            SyncStatus::Error => SyncOutcome {
                success: false,
                external_id: None,
                error_code: prior.error_code,
                error: prior.error_message,
            },
        }
    }

    fn pending_entry(
        &self,
        integration: &Integration,
        resource_type: ResourceType,
        resource_id: &str,
        direction: SyncDirection,
        key: &str,
    ) -> SyncLogEntry {
        SyncLogEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: integration.tenant_id.clone(),
            integration_id: integration.id.clone(),
            operation: "sync".to_string(),
            direction,
            resource_type,
            resource_id: resource_id.to_string(),
            status: SyncStatus::Pending,
            duration_ms: None,
            error_code: None,
            error_message: None,
            idempotency_key: Some(key.to_string()),
            created_at: Utc::now(),
        }
    }

    async fn finalize(
        &self,
        log_id: Option<String>,
        started: Instant,
        result: &SyncResult<String>,
    ) {
        let Some(log_id) = log_id else { return };
        let duration_ms = started.elapsed().as_millis() as i64;
        match result {
            Ok(_) => {
                self.logger
                    .complete(&log_id, SyncStatus::Success, duration_ms, None, None)
                    .await;
            }
            Err(e) => {
                self.logger
                    .complete(
                        &log_id,
                        SyncStatus::Error,
                        duration_ms,
                        Some(e.error_code()),
                        Some(&e.to_string()),
                    )
                    .await;
            }
        }
    }

    fn client(&self, tenant_id: &str, provider: &str) -> SyncResult<Arc<ProviderClient>> {
        let config = self
            .providers
            .get(provider)
            .ok_or_else(|| SyncError::NotFound(format!("provider '{}'", provider)))?;

        let key = format!("{}:{}", tenant_id, provider);
        let client = self
            .clients
            .entry(key)
            .or_insert_with(|| {
                let mut client =
                    ProviderClient::new(config.clone(), tenant_id, self.tokens.clone());
                if let Some(retry) = &self.retry {
                    client = client.with_retry_policy(retry.clone());
                }
                Arc::new(client)
            })
            .clone();
        Ok(client)
    }
}

/// Provider create responses carry the remote record id as `id`.
fn extract_external_id(response: &ApiResponse) -> SyncResult<String> {
    response
        .data
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::Internal(anyhow::anyhow!(
                "provider create response missing id (status {})",
                response.status
            ))
        })
}

/// Remote payload timestamp, falling back to now when absent. Without a
/// remote timestamp the skew tolerance suppresses conflict detection.
fn remote_timestamp(data: &Value) -> DateTime<Utc> {
    data.get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::vault::SecretRef;
    use anyhow::{bail, Result};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    /// Store wrapper that fails external-id lookups but behaves normally
    /// otherwise.
    struct LinkLookupFailingStore {
        inner: SqliteStore,
    }

    #[async_trait::async_trait]
    impl DataStore for LinkLookupFailingStore {
        async fn get_integration(
            &self,
            tenant_id: &str,
            provider: &str,
        ) -> Result<Option<Integration>> {
            self.inner.get_integration(tenant_id, provider).await
        }

        async fn insert_integration(&self, integration: &Integration) -> Result<()> {
            self.inner.insert_integration(integration).await
        }

        async fn update_integration_tokens(
            &self,
            integration_id: &str,
            access_ref: &SecretRef,
            refresh_ref: Option<&SecretRef>,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.inner
                .update_integration_tokens(integration_id, access_ref, refresh_ref, expires_at)
                .await
        }

        async fn deactivate_integration(&self, integration_id: &str) -> Result<()> {
            self.inner.deactivate_integration(integration_id).await
        }

        async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
            self.inner.insert_sync_log(entry).await
        }

        async fn finalize_sync_log(
            &self,
            id: &str,
            status: SyncStatus,
            duration_ms: i64,
            error_code: Option<&str>,
            error_message: Option<&str>,
        ) -> Result<()> {
            self.inner
                .finalize_sync_log(id, status, duration_ms, error_code, error_message)
                .await
        }

        async fn latest_log_for_key(
            &self,
            tenant_id: &str,
            integration_id: &str,
            idempotency_key: &str,
        ) -> Result<Option<SyncLogEntry>> {
            self.inner
                .latest_log_for_key(tenant_id, integration_id, idempotency_key)
                .await
        }

        async fn insert_conflicts(&self, conflicts: &[crate::store::SyncConflictRecord]) -> Result<()> {
            self.inner.insert_conflicts(conflicts).await
        }

        async fn get_resource(
            &self,
            tenant_id: &str,
            resource_type: ResourceType,
            resource_id: &str,
        ) -> Result<Option<LocalResource>> {
            self.inner
                .get_resource(tenant_id, resource_type, resource_id)
                .await
        }

        async fn upsert_resource(&self, resource: &LocalResource) -> Result<()> {
            self.inner.upsert_resource(resource).await
        }

        async fn get_external_id(
            &self,
            _tenant_id: &str,
            _resource_type: ResourceType,
            _resource_id: &str,
            _provider: &str,
        ) -> Result<Option<String>> {
            bail!("link lookup unavailable")
        }

        async fn link_external_id(
            &self,
            tenant_id: &str,
            resource_type: ResourceType,
            resource_id: &str,
            provider: &str,
            external_id: &str,
        ) -> Result<bool> {
            self.inner
                .link_external_id(tenant_id, resource_type, resource_id, provider, external_id)
                .await
        }

        async fn relink_external_id(
            &self,
            tenant_id: &str,
            resource_type: ResourceType,
            resource_id: &str,
            provider: &str,
            external_id: &str,
        ) -> Result<()> {
            self.inner
                .relink_external_id(tenant_id, resource_type, resource_id, provider, external_id)
                .await
        }
    }

    fn test_provider_config() -> ProviderConfig {
        ProviderConfig {
            name: "quickbooks".to_string(),
            authorize_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            api_base_url: "https://example.com".to_string(),
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            redirect_uri: "https://cb".to_string(),
            scope: "accounting".to_string(),
            requests_per_minute: 100,
            idempotency_header: Some("Request-Id".to_string()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_echo_survives_failed_link_lookup() {
        let store = Arc::new(LinkLookupFailingStore {
            inner: SqliteStore::in_memory().unwrap(),
        });
        let vault =
            Arc::new(TokenVault::new(":memory:", &BASE64.encode([7u8; 32])).unwrap());

        let integration = Integration {
            id: "int-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            provider: "quickbooks".to_string(),
            status: IntegrationStatus::Active,
            access_token_ref: SecretRef::from_string("ref-a".to_string()),
            refresh_token_ref: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
            metadata: Value::Object(Default::default()),
        };
        store.insert_integration(&integration).await.unwrap();

        // Prior success within the dedup window suppresses re-execution
        let key = generate_key("sync", ResourceType::Invoice, "inv-1", SyncDirection::Push);
        let prior = SyncLogEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: "tenant-1".to_string(),
            integration_id: "int-1".to_string(),
            operation: "sync".to_string(),
            direction: SyncDirection::Push,
            resource_type: ResourceType::Invoice,
            resource_id: "inv-1".to_string(),
            status: SyncStatus::Success,
            duration_ms: Some(12),
            error_code: None,
            error_message: None,
            idempotency_key: Some(key),
            created_at: Utc::now(),
        };
        store.insert_sync_log(&prior).await.unwrap();

        let mut providers = HashMap::new();
        providers.insert("quickbooks".to_string(), test_provider_config());
        let orchestrator = SyncOrchestrator::new(
            store,
            vault,
            providers,
            ConflictStrategy::NewestWins,
            EngineConfig::default(),
        );

        let cancel = CancellationToken::new();
        let outcome = orchestrator
            .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
            .await;

        // The echo is still a success; the unavailable link only costs
        // the external id
        assert!(outcome.success);
        assert!(outcome.external_id.is_none());
        assert!(outcome.error_code.is_none());
    }
}
