//! End-to-end sync scenarios against a mock provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ledgersync::config::{EngineConfig, ProviderConfig};
use ledgersync::conflict::ConflictStrategy;
use ledgersync::orchestrator::SyncOrchestrator;
use ledgersync::retry::RetryPolicy;
use ledgersync::store::{
    DataStore, Integration, IntegrationStatus, LocalResource, ResourceType, SqliteStore,
    SyncStatus,
};
use ledgersync::vault::TokenVault;

struct Harness {
    orchestrator: SyncOrchestrator,
    store: Arc<SqliteStore>,
    vault: Arc<TokenVault>,
}

fn provider_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        name: "quickbooks".to_string(),
        authorize_url: format!("{}/oauth/authorize", base_url),
        token_url: format!("{}/oauth/token", base_url),
        api_base_url: base_url.to_string(),
        client_id: "cid".to_string(),
        client_secret: "cs".to_string(),
        redirect_uri: "https://app.example.com/callback".to_string(),
        scope: "com.intuit.quickbooks.accounting".to_string(),
        requests_per_minute: 500,
        idempotency_header: Some("Request-Id".to_string()),
    }
}

fn harness(base_url: &str, strategy: ConflictStrategy) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgersync=debug".into()),
        )
        .try_init();

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let vault = Arc::new(TokenVault::new(":memory:", &BASE64.encode([9u8; 32])).unwrap());

    let mut providers = HashMap::new();
    providers.insert("quickbooks".to_string(), provider_config(base_url));

    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        vault.clone(),
        providers,
        strategy,
        EngineConfig::default(),
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    });

    Harness {
        orchestrator,
        store,
        vault,
    }
}

async fn seed_active_integration(h: &Harness) {
    let access_ref = h
        .vault
        .store_access_token("tenant-1", "quickbooks", "at-1")
        .unwrap();
    let refresh_ref = h
        .vault
        .store_refresh_token("tenant-1", "quickbooks", "rt-1")
        .unwrap();
    h.store
        .insert_integration(&Integration {
            id: "int-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            provider: "quickbooks".to_string(),
            status: IntegrationStatus::Active,
            access_token_ref: access_ref,
            refresh_token_ref: Some(refresh_ref),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            metadata: json!({}),
        })
        .await
        .unwrap();
}

async fn seed_invoice(h: &Harness, id: &str) {
    h.store
        .upsert_resource(&LocalResource {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            resource_type: ResourceType::Invoice,
            data: json!({"amount": 150.0, "status": "draft", "currency": "USD"}),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
}

async fn log_statuses(h: &Harness, key: &str) -> Vec<SyncStatus> {
    h.store
        .latest_log_for_key("tenant-1", "int-1", key)
        .await
        .unwrap()
        .map(|e| vec![e.status])
        .unwrap_or_default()
}

#[tokio::test]
async fn missing_integration_yields_exact_message() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Integration not found or inactive")
    );
    assert_eq!(outcome.error_code.as_deref(), Some("integration_inactive"));
}

#[tokio::test]
async fn inactive_integration_yields_exact_message() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    h.store.deactivate_integration("int-1").await.unwrap();

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Integration not found or inactive")
    );
}

#[tokio::test]
async fn create_then_repeat_is_deduplicated_without_second_call() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/invoices")
        .match_header("request-id", "sync:invoice:inv-1:push")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "QB-100"}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    seed_invoice(&h, "inv-1").await;

    let cancel = CancellationToken::new();
    let first = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;
    assert!(first.success, "first sync failed: {:?}", first.error);
    assert_eq!(first.external_id.as_deref(), Some("QB-100"));

    // Exact repeat: suppressed by the ledger, provider called only once
    let second = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;
    assert!(second.success);
    assert_eq!(second.external_id.as_deref(), Some("QB-100"));
    create.assert_async().await;

    assert_eq!(
        log_statuses(&h, "sync:invoice:inv-1:push").await,
        vec![SyncStatus::Success]
    );
}

#[tokio::test]
async fn transient_500_then_success_leaves_one_success_row() {
    let mut server = mockito::Server::new_async().await;
    let success = server
        .mock("POST", "/invoices")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "QB-200"}"#)
        .create_async()
        .await;
    // Newest mock matches first, serves one 500, then falls through
    let failure = server
        .mock("POST", "/invoices")
        .with_status(500)
        .with_body("temporarily unavailable")
        .expect_at_most(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    seed_invoice(&h, "inv-1").await;

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(outcome.success, "sync failed: {:?}", outcome.error);
    assert_eq!(outcome.external_id.as_deref(), Some("QB-200"));
    failure.assert_async().await;
    success.assert_async().await;

    // Exactly one log row, transitioned pending -> success
    assert_eq!(
        log_statuses(&h, "sync:invoice:inv-1:push").await,
        vec![SyncStatus::Success]
    );
}

#[tokio::test]
async fn terminal_400_leaves_one_error_row_with_provider_message() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/invoices")
        .with_status(400)
        .with_body(r#"{"Fault": "Required field Line is missing"}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    seed_invoice(&h, "inv-1").await;

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("validation_error"));
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("Required field Line is missing"));
    mock.assert_async().await;

    let row = h
        .store
        .latest_log_for_key("tenant-1", "int-1", "sync:invoice:inv-1:push")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SyncStatus::Error);
    assert_eq!(row.error_code.as_deref(), Some("validation_error"));
    assert!(row
        .error_message
        .as_deref()
        .unwrap()
        .contains("Required field Line is missing"));
}

#[tokio::test]
async fn update_path_detects_manual_conflict_and_parks_job() {
    let mut server = mockito::Server::new_async().await;
    // Remote copy diverges in amount and was updated well outside tolerance
    let remote_updated = (Utc::now() - ChronoDuration::minutes(30)).to_rfc3339();
    let get = server
        .mock("GET", "/invoices/QB-300")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"id": "QB-300", "amount": 999.0, "status": "draft", "currency": "USD", "updated_at": "{}"}}"#,
            remote_updated
        ))
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::Manual);
    seed_active_integration(&h).await;
    seed_invoice(&h, "inv-1").await;
    h.store
        .link_external_id("tenant-1", ResourceType::Invoice, "inv-1", "quickbooks", "QB-300")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error_code.as_deref(),
        Some("requires_manual_resolution")
    );
    get.assert_async().await;

    // Job finalized as error with the manual-resolution code and the
    // diverging field persisted as a pending conflict row
    let row = h
        .store
        .latest_log_for_key("tenant-1", "int-1", "sync:invoice:inv-1:push")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SyncStatus::Error);
    assert_eq!(
        row.error_code.as_deref(),
        Some("requires_manual_resolution")
    );

    let conflicts = h.store.conflicts_for_job(&row.id).unwrap();
    assert!(!conflicts.is_empty());
    assert!(conflicts.iter().all(|c| c.status == "pending"));
    assert!(conflicts.iter().any(|c| c.details["field"] == "amount"));
}

#[tokio::test]
async fn update_path_newest_wins_pushes_local_when_newer() {
    let mut server = mockito::Server::new_async().await;
    let remote_updated = (Utc::now() - ChronoDuration::minutes(30)).to_rfc3339();
    let get = server
        .mock("GET", "/customers/QB-7")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"id": "QB-7", "name": "Acme Ltd", "updated_at": "{}"}}"#,
            remote_updated
        ))
        .expect(1)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/customers/QB-7")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "QB-7", "name": "Acme"}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    h.store
        .upsert_resource(&LocalResource {
            id: "c-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            resource_type: ResourceType::Customer,
            data: json!({"name": "Acme"}),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    h.store
        .link_external_id("tenant-1", ResourceType::Customer, "c-1", "quickbooks", "QB-7")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_customer_to_accounting(&cancel, "tenant-1", "quickbooks", "c-1")
        .await;

    assert!(outcome.success, "sync failed: {:?}", outcome.error);
    get.assert_async().await;
    put.assert_async().await;
}

#[tokio::test]
async fn pull_adopts_remote_copy() {
    let mut server = mockito::Server::new_async().await;
    let get = server
        .mock("GET", "/customers/QB-7")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "QB-7", "name": "Acme Ltd", "email": "billing@acme.com"}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::RemoteWins);
    seed_active_integration(&h).await;
    h.store
        .upsert_resource(&LocalResource {
            id: "c-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            resource_type: ResourceType::Customer,
            data: json!({"name": "Acme"}),
            updated_at: Utc::now() - ChronoDuration::hours(1),
        })
        .await
        .unwrap();
    h.store
        .link_external_id("tenant-1", ResourceType::Customer, "c-1", "quickbooks", "QB-7")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .pull_customer_from_accounting(&cancel, "tenant-1", "quickbooks", "c-1")
        .await;

    assert!(outcome.success, "pull failed: {:?}", outcome.error);
    get.assert_async().await;

    let local = h
        .store
        .get_resource("tenant-1", ResourceType::Customer, "c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.data["name"], "Acme Ltd");
    assert_eq!(local.data["email"], "billing@acme.com");
}

#[tokio::test]
async fn pull_without_link_is_not_found() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::RemoteWins);
    seed_active_integration(&h).await;

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .pull_invoice_from_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("not_found"));
}

#[tokio::test]
async fn missing_local_resource_logs_error_row() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;

    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_customer_to_accounting(&cancel, "tenant-1", "quickbooks", "ghost")
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("not_found"));

    let row = h
        .store
        .latest_log_for_key("tenant-1", "int-1", "sync:customer:ghost:push")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SyncStatus::Error);
}

#[tokio::test]
async fn disconnect_deactivates_and_clears_vault() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;

    h.orchestrator
        .disconnect("tenant-1", "quickbooks")
        .await
        .unwrap();

    let integration = h
        .store
        .get_integration("tenant-1", "quickbooks")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(integration.status, IntegrationStatus::Inactive);
    // Vaulted secrets gone
    assert!(h.vault.get_access_token(&integration.access_token_ref).is_err());

    // Further syncs now refuse with the inactive message
    let cancel = CancellationToken::new();
    let outcome = h
        .orchestrator
        .sync_invoice_to_accounting(&cancel, "tenant-1", "quickbooks", "inv-1")
        .await;
    assert_eq!(
        outcome.error.as_deref(),
        Some("Integration not found or inactive")
    );
}

#[tokio::test]
async fn relink_replaces_existing_link() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    seed_active_integration(&h).await;
    seed_invoice(&h, "inv-1").await;
    h.store
        .link_external_id("tenant-1", ResourceType::Invoice, "inv-1", "quickbooks", "QB-1")
        .await
        .unwrap();

    h.orchestrator
        .relink_resource("tenant-1", "quickbooks", ResourceType::Invoice, "inv-1", "QB-2")
        .await
        .unwrap();

    let linked = h
        .store
        .get_external_id("tenant-1", ResourceType::Invoice, "inv-1", "quickbooks")
        .await
        .unwrap();
    assert_eq!(linked.as_deref(), Some("QB-2"));
}

#[tokio::test]
async fn relink_requires_active_integration() {
    let server = mockito::Server::new_async().await;
    let h = harness(&server.url(), ConflictStrategy::NewestWins);

    let err = h
        .orchestrator
        .relink_resource("tenant-1", "quickbooks", ResourceType::Invoice, "inv-1", "QB-2")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Integration not found or inactive");
}

#[tokio::test]
async fn connect_creates_active_integration() {
    let mut server = mockito::Server::new_async().await;
    let token = server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "at-x", "refresh_token": "rt-x", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(&server.url(), ConflictStrategy::NewestWins);
    let integration = h
        .orchestrator
        .connect("tenant-1", "quickbooks", "auth-code", None)
        .await
        .unwrap();

    assert_eq!(integration.status, IntegrationStatus::Active);
    token.assert_async().await;

    assert_eq!(
        h.vault
            .get_access_token(&integration.access_token_ref)
            .unwrap(),
        "at-x"
    );
    assert!(h
        .store
        .get_integration("tenant-1", "quickbooks")
        .await
        .unwrap()
        .is_some());
}
