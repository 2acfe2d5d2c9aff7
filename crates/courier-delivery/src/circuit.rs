//! Circuit breaker for upstream platform calls.
//!
//! One breaker guards one resource (token issuance for a tenant, the send
//! path for a tenant). It keeps no timers: every [`CircuitBreaker::execute`]
//! evaluates the state lazily against the injected clock.
//!
//! # State Machine
//!
//! ```text
//!   ┌──────────────┐  failure_threshold failures   ┌──────────────┐
//!   │    CLOSED    │ ────────────────────────────▶ │     OPEN     │
//!   │ calls pass   │                               │  fail fast   │
//!   └──────────────┘                               └──────────────┘
//!          ▲                                          │       ▲
//!          │ success_threshold                        │       │ any
//!          │ consecutive successes     reset_timeout  │       │ failure
//!          │                           elapsed        ▼       │
//!          │                                       ┌──────────────┐
//!          └────────────────────────────────────── │  HALF-OPEN   │
//!                                                  │ trial calls  │
//!                                                  └──────────────┘
//! ```

use std::{
    future::Future,
    time::{Duration, Instant},
};

use courier_core::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the observation period that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Failures further apart than this restart the count.
    pub observation_period: Duration,
    /// Trial calls allowed in flight while half-open.
    pub half_open_max_in_flight: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
            observation_period: Duration::from_secs(60),
            half_open_max_in_flight: 1,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast.
    Open,
    /// Limited trial calls test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Protected resource.
    pub name: String,
    /// Effective state at snapshot time.
    pub state: CircuitState,
    /// Failures counted toward opening.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub half_open_successes: u32,
    /// Milliseconds since the most recent failure.
    pub ms_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

impl BreakerState {
    const fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            half_open_successes: 0,
            half_open_in_flight: 0,
        }
    }

    fn cooled_down(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.last_failure_at.is_none_or(|at| now.saturating_duration_since(at) >= reset_timeout)
    }
}

/// Three-state failure isolator around a single upstream resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `name`.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        Self { name: name.into(), config, clock, inner: Mutex::new(BreakerState::closed()) }
    }

    /// Protected resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `call` if the breaker admits it and records the outcome.
    ///
    /// Returns [`DeliveryError::CircuitOpen`] without invoking `call` when the
    /// circuit is open, or when half-open and the trial slot is taken.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.admit()?;
        let outcome = call().await;

        match &outcome {
            Ok(_) => self.record_success(&mut permit),
            Err(error) if counts_as_failure(error) => self.record_failure(&mut permit),
            Err(_) => {},
        }
        outcome
    }

    /// Effective state, including a pending Open to HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open && inner.cooled_down(self.clock.now(), self.config.reset_timeout) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    /// Snapshot for health and ops endpoints.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let now = self.clock.now();
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            ms_since_last_failure: inner
                .last_failure_at
                .map(|at| u64::try_from(now.saturating_duration_since(at).as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Forces the breaker closed and clears all counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        tracing::info!(circuit = %self.name, "circuit breaker reset");
    }

    #[allow(clippy::significant_drop_tightening)] // check-then-transition must stay under one lock
    fn admit(&self) -> Result<Permit<'_>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open && inner.cooled_down(now, self.config.reset_timeout) {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            tracing::info!(circuit = %self.name, "circuit breaker half-open, admitting trial calls");
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit { breaker: self, trial: false, settled: false }),
            CircuitState::HalfOpen if inner.half_open_in_flight < self.config.half_open_max_in_flight => {
                inner.half_open_in_flight += 1;
                Ok(Permit { breaker: self, trial: true, settled: false })
            },
            CircuitState::HalfOpen | CircuitState::Open => {
                tracing::debug!(circuit = %self.name, state = %inner.state, "call rejected by circuit breaker");
                Err(DeliveryError::circuit_open(&self.name))
            },
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    fn record_success(&self, permit: &mut Permit<'_>) {
        permit.settled = true;
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if permit.trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    tracing::info!(circuit = %self.name, "circuit breaker closed after recovery");
                }
            },
            // A call admitted before the circuit opened; its result is stale.
            CircuitState::HalfOpen | CircuitState::Open => {},
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    fn record_failure(&self, permit: &mut Permit<'_>) {
        permit.settled = true;
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                let stale = inner
                    .last_failure_at
                    .is_some_and(|at| now.saturating_duration_since(at) > self.config.observation_period);
                if stale {
                    inner.failure_count = 0;
                }
                inner.failure_count += 1;
                inner.last_failure_at = Some(now);

                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            },
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(now);
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                tracing::warn!(circuit = %self.name, "trial call failed, circuit breaker re-opened");
            },
            CircuitState::Open => {},
        }
    }
}

/// Admission ticket; releases a half-open trial slot if the call is dropped
/// before it reports an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Local mistakes say nothing about upstream health.
fn counts_as_failure(error: &DeliveryError) -> bool {
    !matches!(
        error,
        DeliveryError::Cancelled
            | DeliveryError::Configuration { .. }
            | DeliveryError::CredentialMissing { .. }
            | DeliveryError::RateLimited { .. }
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use courier_core::TestClock;

    use super::*;

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        CircuitBreaker::new("send:test", CircuitConfig::default(), clock.shared())
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Err::<(), _>(DeliveryError::network("refused")) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        for _ in 0..4 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(DeliveryError::circuit_open("send:test")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        succeed(&breaker).await.unwrap();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 4);
    }

    #[tokio::test]
    async fn half_open_closes_after_consecutive_successes() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        clock.advance(Duration::from_secs(29));
        assert!(matches!(succeed(&breaker).await, Err(DeliveryError::CircuitOpen { .. })));

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_cooldown() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(30));

        assert!(matches!(fail(&breaker).await, Err(DeliveryError::Network { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(20));
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_concurrent_trial() {
        let clock = TestClock::new();
        let breaker = Arc::new(breaker(&clock));
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(30));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        while breaker.inner.lock().half_open_in_flight == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(succeed(&breaker).await, Err(DeliveryError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.snapshot().half_open_successes, 1);
    }

    #[tokio::test]
    async fn failures_outside_observation_period_restart_count() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(61));
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn local_errors_do_not_trip_the_breaker() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        for _ in 0..10 {
            let _ = breaker.execute(|| async { Err::<(), _>(DeliveryError::Cancelled) }).await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
