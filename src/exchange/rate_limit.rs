// =============================================================================
// Rate Limiter — per-(exchange, account) sliding-window request pacing
// =============================================================================
//
// Admission is a 60-second sliding window with a small burst allowance on
// top. `wait_if_needed` suspends the caller until the oldest tracked request
// ages out, so no more than `limit` requests are admitted in any 60 s span.
// Sequential batch fallbacks additionally pace individual orders through
// `pace()`.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Window the admission cap applies to.
const WINDOW: Duration = Duration::from_secs(60);

/// Per-exchange admission profile.
#[derive(Debug, Clone, Copy)]
pub struct RateProfile {
    /// Requests admitted per 60 s window.
    pub requests_per_minute: u32,
    /// Extra requests tolerated above the steady-state cap.
    pub burst: u32,
    /// Minimum spacing between sequential orders (batch fallback).
    pub min_order_interval: Duration,
}

impl RateProfile {
    pub fn for_exchange(exchange: &str) -> Self {
        match exchange.to_lowercase().as_str() {
            // Binance: generous request weight; native batch does the pacing.
            "binance" => Self {
                requests_per_minute: 1100,
                burst: 20,
                min_order_interval: Duration::from_millis(50),
            },
            // Upbit allows 8 orders/s — 125 ms between sequential orders.
            "upbit" => Self {
                requests_per_minute: 450,
                burst: 10,
                min_order_interval: Duration::from_millis(125),
            },
            // Bithumb allows 5 orders/s — 200 ms between sequential orders.
            "bithumb" => Self {
                requests_per_minute: 270,
                burst: 10,
                min_order_interval: Duration::from_millis(200),
            },
            // Securities APIs are the slowest; stay well under their caps.
            "korea_investment" | "kis" => Self {
                requests_per_minute: 60,
                burst: 5,
                min_order_interval: Duration::from_millis(500),
            },
            _ => Self {
                requests_per_minute: 120,
                burst: 10,
                min_order_interval: Duration::from_millis(250),
            },
        }
    }

    fn cap(&self) -> usize {
        (self.requests_per_minute + self.burst) as usize
    }
}

/// Serializable view of a limiter's current load.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub in_window: usize,
    pub capacity: usize,
}

/// Sliding-window limiter for one (exchange, account) pair.
pub struct RateLimiter {
    profile: RateProfile,
    window: Mutex<VecDeque<Instant>>,
    last_order: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(profile: RateProfile) -> Self {
        Self {
            profile,
            window: Mutex::new(VecDeque::with_capacity(profile.cap())),
            last_order: Mutex::new(None),
        }
    }

    /// Suspend until a request slot is free, then claim it. The wait is
    /// bounded by `60 s − age_of_oldest_request`.
    pub async fn wait_if_needed(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    window.pop_front();
                }

                if window.len() < self.profile.cap() {
                    window.push_back(now);
                    return;
                }

                // Full: wait for the oldest entry to age out.
                let oldest = *window.front().expect("non-empty window");
                WINDOW.saturating_sub(now.duration_since(oldest))
            };

            warn!(wait_ms = wait.as_millis() as u64, "rate window full — waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    /// Whether a slot is available right now, claiming it if so. Non-waiting
    /// variant for callers that surface `RateLimited` instead of blocking.
    pub async fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            window.pop_front();
        }
        if window.len() < self.profile.cap() {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Enforce the sequential-order spacing for batch fallbacks. Holds an
    /// async mutex so concurrent batches interleave at the same cadence.
    pub async fn pace(&self) {
        let mut last = self.last_order.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.profile.min_order_interval {
                let delay = self.profile.min_order_interval - since;
                debug!(delay_ms = delay.as_millis() as u64, "pacing sequential order");
                tokio::time::sleep(delay).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Spacing applied between native batch slices.
    pub fn batch_slice_delay(&self) -> Duration {
        self.profile.min_order_interval
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            window.pop_front();
        }
        RateLimitSnapshot {
            in_window: window.len(),
            capacity: self.profile.cap(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("requests_per_minute", &self.profile.requests_per_minute)
            .field("burst", &self.profile.burst)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared map of limiters keyed by (exchange, account). Every adapter bound
/// to the same account shares one limiter.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<(String, i64), Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_account(&self, exchange: &str, account_id: i64) -> Arc<RateLimiter> {
        let key = (exchange.to_lowercase(), account_id);
        if let Some(limiter) = self.limiters.read().get(&key) {
            return limiter.clone();
        }
        let mut limiters = self.limiters.write();
        limiters
            .entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::new(RateProfile::for_exchange(exchange))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_profile(cap: u32) -> RateProfile {
        RateProfile {
            requests_per_minute: cap,
            burst: 0,
            min_order_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn admits_up_to_capacity_without_waiting() {
        let limiter = RateLimiter::new(tiny_profile(5));
        for _ in 0..5 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
        let snap = limiter.snapshot().await;
        assert_eq!(snap.in_window, 5);
        assert_eq!(snap.capacity, 5);
    }

    #[tokio::test]
    async fn pace_enforces_minimum_spacing() {
        let limiter = RateLimiter::new(tiny_profile(100));
        let start = Instant::now();
        limiter.pace().await;
        limiter.pace().await;
        limiter.pace().await;
        // Two enforced gaps of >= 20 ms each.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn registry_shares_limiters_per_account() {
        let registry = RateLimiterRegistry::new();
        let a = registry.for_account("binance", 1);
        let b = registry.for_account("Binance", 1);
        let c = registry.for_account("binance", 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn profiles_encode_sequential_pacing() {
        assert_eq!(
            RateProfile::for_exchange("upbit").min_order_interval,
            Duration::from_millis(125)
        );
        assert_eq!(
            RateProfile::for_exchange("bithumb").min_order_interval,
            Duration::from_millis(200)
        );
    }
}
