//! Exponential-backoff retry with jitter.
//!
//! Generic executor used by the provider client for every outbound call.
//! Retryability is decided by a pluggable predicate; the default is
//! [`SyncError::is_retryable`]. On exhaustion the last error is returned
//! unmodified so callers can still branch on its kind.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 6).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Symmetric jitter fraction applied to each delay (default 0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay for the retry following `attempt` (zero-based):
    /// `min(max_delay, base * 2^attempt)` ± jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Execute `op` with the default retry predicate.
    ///
    /// `op` receives the zero-based attempt index. Cancellation during a
    /// backoff sleep abandons remaining attempts with `Err(Cancelled)`.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.run_with(cancel, op, |err, attempt| err.is_retryable(attempt), |_, _, _| {})
            .await
    }

    /// Execute `op` with a custom `should_retry(error, attempt)` predicate
    /// and an `on_retry(error, attempt, delay)` observability callback,
    /// invoked before each backoff sleep.
    pub async fn run_with<T, F, Fut, P, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        should_retry: P,
        mut on_retry: R,
    ) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        P: Fn(&SyncError, u32) -> bool,
        R: FnMut(&SyncError, u32, Duration),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 >= attempts || !should_retry(&err, attempt) {
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after retryable error"
                    );
                    on_retry(&err, attempt, delay);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let policy = fast_policy();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, SyncError>(7) }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exactly_k_plus_one_times() {
        // Predicate retries exactly k of n possible attempts: operation
        // executes k+1 times and the propagated error is the final one.
        let policy = fast_policy();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let k = 3u32;
        let calls_clone = Arc::clone(&calls);
        let result: SyncResult<()> = policy
            .run_with(
                &cancel,
                move |attempt| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Err(SyncError::TransientServer {
                            status: 500,
                            body: format!("attempt {}", attempt),
                        })
                    }
                },
                move |_, attempt| attempt < k,
                |_, _, _| {},
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        match result.unwrap_err() {
            SyncError::TransientServer { body, .. } => assert_eq!(body, "attempt 3"),
            other => panic!("expected TransientServer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let policy = fast_policy();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SyncError::Validation {
                        status: 400,
                        body: "bad request".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error_unmodified() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..fast_policy()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy
            .run(&cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(SyncError::Network(format!("reset on attempt {}", attempt)))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            SyncError::Network(msg) => assert_eq!(msg, "reset on attempt 2"),
            other => panic!("expected Network, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_retried_exactly_once() {
        let policy = fast_policy();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SyncError::Auth {
                        status: 401,
                        body: String::new(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Auth { .. })));
        // First 401 retryable, second terminal
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_retry_callback_observes_each_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..fast_policy()
        };
        let cancel = CancellationToken::new();
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let observed_clone = Arc::clone(&observed);
        let _: SyncResult<()> = policy
            .run_with(
                &cancel,
                |_| async {
                    Err(SyncError::TransientServer {
                        status: 502,
                        body: String::new(),
                    })
                },
                |err, attempt| err.is_retryable(attempt),
                move |err, attempt, delay| {
                    observed_clone
                        .lock()
                        .unwrap()
                        .push((err.error_code(), attempt, delay));
                },
            )
            .await;

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 3);
        assert_eq!(observed[0].1, 0);
        assert_eq!(observed[2].1, 2);
        assert!(observed.iter().all(|(code, _, _)| *code == "transient_server_error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_remaining_attempts() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                policy
                    .run(&cancel, move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async {
                            Err::<(), _>(SyncError::TransientServer {
                                status: 500,
                                body: String::new(),
                            })
                        }
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // 100 * 2^3 = 800, capped at 500
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).as_millis();
            assert!((800..=1200).contains(&d), "delay {} out of ±20% bounds", d);
        }
    }
}
