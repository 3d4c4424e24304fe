//! Rate-limited, retrying HTTP client for one provider connection.
//!
//! Every outbound call goes through the same pipeline: consume a rate-limit
//! token, obtain a valid access token, send, classify the response. Retries
//! re-enter the pipeline from the top so each attempt consumes its own
//! rate-limit token and re-reads the (possibly rotated) access token. A 401
//! on the first attempt forces a token refresh before the single allowed
//! auth retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{SyncError, SyncResult};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::token_manager::TokenManager;

/// Per-attempt wall-clock bound; the transport backstop when the
/// cancellation token never fires.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded provider response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
}

/// Client for a single tenant's connection to one provider.
pub struct ProviderClient {
    config: ProviderConfig,
    tenant_id: String,
    tokens: Arc<TokenManager>,
    http: reqwest::Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig, tenant_id: &str, tokens: Arc<TokenManager>) -> Self {
        let limiter = RateLimiter::per_minute(config.requests_per_minute);
        Self {
            config,
            tenant_id: tenant_id.to_string(),
            tokens,
            http: reqwest::Client::new(),
            limiter,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the default backoff policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> &str {
        &self.config.name
    }

    /// Rate-limit tokens left in the current window.
    pub async fn remaining_requests(&self) -> u32 {
        self.limiter.remaining_requests().await
    }

    /// Execute a provider API call with rate limiting and retry.
    ///
    /// `idempotency_key` is forwarded on the provider's idempotency header
    /// when it declares one; providers without one still rely on the local
    /// ledger for dedup.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> SyncResult<ApiResponse> {
        self.retry
            .run(cancel, |attempt| {
                let method = method.clone();
                async move {
                    self.limiter.take(cancel).await?;
                    let result = self
                        .attempt(cancel, method, path, body, idempotency_key)
                        .await;

                    if let Err(SyncError::Auth { status, .. }) = &result {
                        if attempt == 0 {
                            debug!(
                                provider = %self.config.name,
                                status = status,
                                "Token rejected, forcing refresh before auth retry"
                            );
                            self.refresh_after_rejection().await;
                        }
                    }
                    result
                }
            })
            .await
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> SyncResult<ApiResponse> {
        let token = self
            .tokens
            .get_valid_access_token(&self.tenant_id, &self.config.name)
            .await?;

        let url = format!("{}{}", self.config.api_base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        if let (Some(header), Some(key)) = (&self.config.idempotency_header, idempotency_key) {
            request = request.header(header.as_str(), key);
        }

        // Cancellation must interrupt an in-flight call, not just the
        // waits around it
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = request.send() => result
                .map_err(|e| SyncError::Network(format!("request to {} failed: {}", url, e)))?,
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::classify_status(status, body, retry_after));
        }

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = response.bytes() => result
                .map_err(|e| SyncError::Network(format!("failed reading response body: {}", e)))?,
        };
        let data = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Network(format!("invalid response body: {}", e)))?
        };

        Ok(ApiResponse { status, data })
    }

    /// Best-effort forced refresh after a provider rejected the token. The
    /// auth retry surfaces the original error if this fails too.
    async fn refresh_after_rejection(&self) {
        let stale = match self
            .tokens
            .current_access_ref(&self.tenant_id, &self.config.name)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(provider = %self.config.name, error = %e, "Could not resolve token for forced refresh");
                return;
            }
        };
        if let Err(e) = self
            .tokens
            .force_refresh(&self.tenant_id, &self.config.name, &stale)
            .await
        {
            warn!(provider = %self.config.name, error = %e, "Forced token refresh failed");
        }
    }

    // Normalized resource endpoints. Provider-specific payload shapes are
    // the mapper's concern upstream; this surface speaks the normalized API.

    pub async fn create_customer(
        &self,
        cancel: &CancellationToken,
        payload: &Value,
        idempotency_key: &str,
    ) -> SyncResult<ApiResponse> {
        self.request(
            cancel,
            Method::POST,
            "/customers",
            Some(payload),
            Some(idempotency_key),
        )
        .await
    }

    pub async fn update_customer(
        &self,
        cancel: &CancellationToken,
        external_id: &str,
        payload: &Value,
    ) -> SyncResult<ApiResponse> {
        let path = format!("/customers/{}", urlencoding::encode(external_id));
        self.request(cancel, Method::PUT, &path, Some(payload), None)
            .await
    }

    pub async fn get_customer(
        &self,
        cancel: &CancellationToken,
        external_id: &str,
    ) -> SyncResult<ApiResponse> {
        let path = format!("/customers/{}", urlencoding::encode(external_id));
        self.request(cancel, Method::GET, &path, None, None).await
    }

    pub async fn list_customers(
        &self,
        cancel: &CancellationToken,
        updated_since: Option<DateTime<Utc>>,
    ) -> SyncResult<ApiResponse> {
        self.request(cancel, Method::GET, &list_path("/customers", updated_since), None, None)
            .await
    }

    pub async fn create_invoice(
        &self,
        cancel: &CancellationToken,
        payload: &Value,
        idempotency_key: &str,
    ) -> SyncResult<ApiResponse> {
        self.request(
            cancel,
            Method::POST,
            "/invoices",
            Some(payload),
            Some(idempotency_key),
        )
        .await
    }

    pub async fn update_invoice(
        &self,
        cancel: &CancellationToken,
        external_id: &str,
        payload: &Value,
    ) -> SyncResult<ApiResponse> {
        let path = format!("/invoices/{}", urlencoding::encode(external_id));
        self.request(cancel, Method::PUT, &path, Some(payload), None)
            .await
    }

    pub async fn get_invoice(
        &self,
        cancel: &CancellationToken,
        external_id: &str,
    ) -> SyncResult<ApiResponse> {
        let path = format!("/invoices/{}", urlencoding::encode(external_id));
        self.request(cancel, Method::GET, &path, None, None).await
    }

    pub async fn list_invoices(
        &self,
        cancel: &CancellationToken,
        updated_since: Option<DateTime<Utc>>,
    ) -> SyncResult<ApiResponse> {
        self.request(cancel, Method::GET, &list_path("/invoices", updated_since), None, None)
            .await
    }
}

fn list_path(base: &str, updated_since: Option<DateTime<Utc>>) -> String {
    match updated_since {
        Some(ts) => format!(
            "{}?updated_since={}",
            base,
            urlencoding::encode(&ts.to_rfc3339())
        ),
        None => base.to_string(),
    }
}
