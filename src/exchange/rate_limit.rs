// =============================================================================
// REST rate limiter -- process-wide token bucket
// =============================================================================
//
// The exchange enforces request-weight limits per minute and order-rate
// limits per 10 seconds. One bucket is shared by every tenant in the process
// so tenant-level bursts can never exceed the upstream limits.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Request weight available per minute. The exchange allows 1200; the engine
/// caps itself below that.
const WEIGHT_CAPACITY: f64 = 1_000.0;
/// Orders allowed per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
    orders_in_window: u32,
    window_started: Instant,
}

/// Token bucket over request weight plus a fixed-window order counter.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

/// Serialisable view of the current limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub available_weight: u32,
    pub orders_in_window: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_capacity(WEIGHT_CAPACITY)
    }

    pub fn with_capacity(capacity: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
                orders_in_window: 0,
                window_started: Instant::now(),
            }),
            capacity,
            // Full refill over one minute.
            refill_per_sec: capacity / 60.0,
        }
    }

    /// Take `weight` tokens, waiting as long as necessary. Never returns an
    /// error; the wait is bounded by the refill rate.
    pub async fn acquire(&self, weight: u32) {
        loop {
            let wait = {
                let mut st = self.state.lock();
                self.refill(&mut st);
                if st.tokens >= weight as f64 {
                    st.tokens -= weight as f64;
                    None
                } else {
                    let deficit = weight as f64 - st.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    debug!(weight, wait_ms = d.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    /// Record an order send against the 10-second window. Returns `false`
    /// when the window is exhausted and the order should be delayed.
    pub fn try_order(&self) -> bool {
        let mut st = self.state.lock();
        if st.window_started.elapsed() >= Duration::from_secs(10) {
            st.window_started = Instant::now();
            st.orders_in_window = 0;
        }
        if st.orders_in_window >= ORDER_10S_LIMIT {
            warn!(
                limit = ORDER_10S_LIMIT,
                "order blocked -- 10s order window exhausted"
            );
            return false;
        }
        st.orders_in_window += 1;
        true
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let mut st = self.state.lock();
        self.refill(&mut st);
        RateLimitSnapshot {
            available_weight: st.tokens as u32,
            orders_in_window: st.orders_in_window,
        }
    }

    fn refill(&self, st: &mut BucketState) {
        let elapsed = st.refilled_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            st.refilled_at = Instant::now();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
