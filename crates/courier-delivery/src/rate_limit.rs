//! Sliding-window rate limiter guarding token issuance.
//!
//! Each key keeps the instants of its admitted requests inside the window.
//! A check prunes expired instants, then admits while fewer than
//! `max_requests` remain.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use courier_core::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// How often idle keys are swept from the map.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Window size and quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of the sliding window.
    pub window: Duration,
    /// Admissions allowed per window; zero disables limiting.
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(60_000), max_requests: 60 }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request was admitted (and counted).
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// Time until the oldest admission leaves the window; zero when allowed.
    pub wait_time: Duration,
}

#[derive(Debug)]
struct Windows {
    by_key: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

/// Per-key sliding-window admission control.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    /// Creates a limiter with empty windows.
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        let last_sweep = clock.now();
        Self { config, clock, windows: Mutex::new(Windows { by_key: HashMap::new(), last_sweep }) }
    }

    /// Admits and records a request for `key` if quota remains.
    ///
    /// Never blocks; a rejected caller should honor `wait_time`.
    #[allow(clippy::significant_drop_tightening)]
    pub fn check(&self, key: &str) -> RateDecision {
        let max = self.config.max_requests;
        if max == 0 {
            return RateDecision { allowed: true, remaining: u32::MAX, wait_time: Duration::ZERO };
        }

        let now = self.clock.now();
        let window = self.config.window;
        let mut windows = self.windows.lock();

        if now.saturating_duration_since(windows.last_sweep) >= SWEEP_INTERVAL {
            windows.by_key.retain(|_, stamps| {
                prune(stamps, now, window);
                !stamps.is_empty()
            });
            windows.last_sweep = now;
        }

        let stamps = windows.by_key.entry(key.to_owned()).or_default();
        prune(stamps, now, window);

        let used = u32::try_from(stamps.len()).unwrap_or(u32::MAX);
        if used < max {
            stamps.push_back(now);
            return RateDecision { allowed: true, remaining: max - used - 1, wait_time: Duration::ZERO };
        }

        let wait_time = stamps
            .front()
            .map_or(window, |oldest| (*oldest + window).saturating_duration_since(now));
        RateDecision { allowed: false, remaining: 0, wait_time }
    }

    /// Checks `key`, waiting out `wait_time` and checking once more if the
    /// first check is rejected.
    pub async fn acquire(&self, key: &str) -> Result<RateDecision> {
        let first = self.check(key);
        if first.allowed {
            return Ok(first);
        }

        tracing::debug!(key, wait_ms = %first.wait_time.as_millis(), "rate limited, waiting once");
        self.clock.sleep(first.wait_time).await;

        let second = self.check(key);
        if second.allowed {
            Ok(second)
        } else {
            tracing::warn!(key, "rate limit still exceeded after waiting");
            Err(DeliveryError::rate_limited(key, second.wait_time))
        }
    }

    /// Admissions left for `key` without recording a request.
    pub fn remaining(&self, key: &str) -> u32 {
        let max = self.config.max_requests;
        if max == 0 {
            return u32::MAX;
        }
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        windows.by_key.get_mut(key).map_or(max, |stamps| {
            prune(stamps, now, self.config.window);
            max.saturating_sub(u32::try_from(stamps.len()).unwrap_or(u32::MAX))
        })
    }

    /// Forgets every admission recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.windows.lock().by_key.remove(key);
    }
}

/// Drops instants at least `window` old; the deque is in admission order.
fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while stamps.front().is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window) {
        stamps.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn limiter(clock: &TestClock, max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { window: Duration::from_secs(60), max_requests }, clock.shared())
    }

    #[test]
    fn admits_exactly_max_requests_per_window() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 3);

        let remaining: Vec<_> = (0..3).map(|_| limiter.check("token:a")).collect();
        assert!(remaining.iter().all(|d| d.allowed));
        assert_eq!(remaining.iter().map(|d| d.remaining).collect::<Vec<_>>(), vec![2, 1, 0]);

        clock.advance(Duration::from_secs(15));
        let rejected = limiter.check("token:a");
        assert!(!rejected.allowed);
        assert_eq!(rejected.wait_time, Duration::from_secs(45));
    }

    #[test]
    fn window_slides_as_time_passes() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 2);

        assert!(limiter.check("k").allowed);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check("k").allowed);
        assert!(!limiter.check("k").allowed);

        clock.advance(Duration::from_secs(30));
        assert!(limiter.check("k").allowed);
        assert!(!limiter.check("k").allowed);
    }

    #[test]
    fn keys_are_independent() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 1);

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert!(!limiter.check("a").allowed);
        assert_eq!(limiter.remaining("b"), 0);
        assert_eq!(limiter.remaining("c"), 1);
    }

    #[test]
    fn zero_quota_disables_limiting() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 0);

        assert!((0..1000).all(|_| limiter.check("k").allowed));
    }

    #[test]
    fn reset_clears_window() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 1);
        assert!(limiter.check("k").allowed);

        limiter.reset("k");

        assert!(limiter.check("k").allowed);
    }

    #[tokio::test]
    async fn acquire_waits_once_then_admits() {
        let clock = TestClock::new();
        let limiter = limiter(&clock, 1);
        assert!(limiter.check("k").allowed);

        let decision = limiter.acquire("k").await.unwrap();

        assert!(decision.allowed);
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    /// Clock whose sleep returns without moving time.
    #[derive(Debug)]
    struct FrozenClock(TestClock);

    impl courier_core::Clock for FrozenClock {
        fn now(&self) -> Instant {
            self.0.now()
        }

        fn now_system(&self) -> std::time::SystemTime {
            self.0.now_system()
        }

        fn sleep(&self, _duration: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn acquire_reports_rate_limited_when_still_full() {
        let clock = TestClock::new();
        let limiter = RateLimiter::new(
            RateLimitConfig { window: Duration::from_secs(60), max_requests: 1 },
            std::sync::Arc::new(FrozenClock(clock.clone())),
        );
        assert!(limiter.check("k").allowed);
        clock.advance(Duration::from_secs(10));

        let err = limiter.acquire("k").await.unwrap_err();

        assert_eq!(err, DeliveryError::rate_limited("k", Duration::from_secs(50)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(50)));
    }
}
