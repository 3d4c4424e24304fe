//! Per-provider request rate limiting.
//!
//! Stepped-window token bucket: the full capacity is restored once per fixed
//! window (default 60s) rather than refilled smoothly. This is a deliberate
//! simplification: it permits a full-capacity burst at the start of each
//! window, which every supported provider tolerates. State is in-memory only
//! and resets on process restart (accepted limitation).

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// Granularity at which a blocked `take()` re-checks the bucket.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct BucketState {
    remaining: u32,
    window_started: Instant,
}

/// Stepped-window token bucket for a single provider connection.
///
/// Consumption is serialized through an internal mutex so two concurrent
/// callers can never both observe and decrement the same token. One owned
/// instance per `ProviderClient`, sized to the provider's documented budget.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` requests per `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new(BucketState {
                remaining: capacity,
                window_started: Instant::now(),
            }),
        }
    }

    /// Limiter for a provider's declared requests-per-minute budget.
    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    /// Consume one token, waiting until one is available.
    ///
    /// Blocks (polling at fixed granularity) while the current window is
    /// exhausted. Returns `Err(Cancelled)` if `cancel` fires while waiting.
    pub async fn take(&self, cancel: &CancellationToken) -> SyncResult<()> {
        loop {
            {
                let mut state = self.state.lock().await;
                self.roll_window(&mut state);
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Tokens left in the current window. Never negative.
    pub async fn remaining_requests(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.roll_window(&mut state);
        state.remaining
    }

    /// Instant at which the current window resets to full capacity.
    pub async fn reset_time(&self) -> Instant {
        let mut state = self.state.lock().await;
        self.roll_window(&mut state);
        state.window_started + self.window
    }

    /// Restore full capacity if the window has elapsed. Caller holds the lock.
    fn roll_window(&self, state: &mut BucketState) {
        let now = Instant::now();
        if now.duration_since(state.window_started) >= self.window {
            state.remaining = self.capacity;
            state.window_started = now;
        }
    }
}
