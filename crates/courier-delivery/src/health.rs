//! Health probes and the monitor that aggregates them.
//!
//! The monitor runs every registered [`HealthProbe`] concurrently, keeps the
//! latest [`HealthReport`], and folds probe verdicts into one status: any
//! unhealthy probe makes the service unhealthy, any degraded probe makes it
//! degraded.

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{DeliveryEvent, DeliveryObserver, SharedClock, TenantConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::{
    circuit::{CircuitSnapshot, CircuitState},
    client::mask,
    credentials::CredentialStore,
    queue::DeliveryQueue,
};

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcomes kept by the error-rate probe.
const ERROR_RATE_WINDOW: usize = 100;
/// Attempts needed before the error rate is judged.
const ERROR_RATE_MIN_SAMPLES: usize = 10;
const ERROR_RATE_DEGRADED: f64 = 0.5;

/// Service or probe health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Working with reduced reliability
    Degraded,
    /// Not able to deliver
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What a probe found.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Verdict
    pub status: HealthStatus,
    /// Probe-specific context
    pub details: Value,
    /// Failure description
    pub error: Option<String>,
}

impl ProbeResult {
    /// Healthy result with `details`.
    pub fn healthy(details: Value) -> Self {
        Self { status: HealthStatus::Healthy, details, error: None }
    }

    /// Degraded result.
    pub fn degraded(details: Value, reason: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, details, error: Some(reason.into()) }
    }

    /// Unhealthy result.
    pub fn unhealthy(details: Value, error: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, details, error: Some(error.into()) }
    }
}

/// A single health check.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    /// Stable probe name used in reports.
    fn name(&self) -> &str;

    /// Runs the check.
    async fn check(&self) -> ProbeResult;
}

/// One probe's entry in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    /// Probe name
    pub name: String,
    /// Verdict
    pub status: HealthStatus,
    /// Wall time the probe took
    pub response_time_ms: u64,
    /// Probe-specific context
    pub details: Value,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cumulative probe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HealthMetrics {
    /// Probe runs since start
    pub total_checks: u64,
    /// Runs that came back healthy
    pub successful_checks: u64,
    /// Runs that came back degraded or unhealthy
    pub failed_checks: u64,
    /// Mean probe duration
    pub average_response_time_ms: f64,
}

/// Aggregated health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Worst probe status
    pub status: HealthStatus,
    /// When the probes ran
    pub last_check_time: DateTime<Utc>,
    /// Seconds since the monitor was created
    pub uptime_secs: u64,
    /// Per-probe results
    pub checks: Vec<CheckResult>,
    /// Cumulative counters
    pub metrics: HealthMetrics,
}

/// Runs probes on demand or on an interval and keeps the latest report.
#[derive(Debug)]
pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    clock: SharedClock,
    started: std::time::Instant,
    probe_timeout: Duration,
    latest: RwLock<Option<HealthReport>>,
    metrics: Mutex<HealthMetrics>,
}

impl HealthMonitor {
    /// Creates a monitor with no probes.
    pub fn new(clock: SharedClock) -> Self {
        let started = clock.now();
        Self {
            probes: Vec::new(),
            clock,
            started,
            probe_timeout: PROBE_TIMEOUT,
            latest: RwLock::new(None),
            metrics: Mutex::new(HealthMetrics::default()),
        }
    }

    /// Adds a probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Overrides the per-probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Runs every probe now and stores the report.
    pub async fn check_now(&self) -> HealthReport {
        let runs = self.probes.iter().map(|probe| self.run_probe(Arc::clone(probe)));
        let checks = futures::future::join_all(runs).await;

        let status = checks.iter().map(|c| c.status).max().unwrap_or(HealthStatus::Healthy);
        let metrics = self.record(&checks);
        let report = HealthReport {
            status,
            last_check_time: self.clock.now_utc(),
            uptime_secs: self.clock.now().saturating_duration_since(self.started).as_secs(),
            checks,
            metrics,
        };

        let previous = self.latest.write().replace(report.clone()).map(|r| r.status);
        if previous != Some(status) {
            match status {
                HealthStatus::Healthy => tracing::info!(%status, "service health changed"),
                _ => tracing::warn!(%status, "service health changed"),
            }
        }
        report
    }

    /// Most recent report, if any probe run has completed.
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }

    /// Latest report, running the probes first if none exists yet.
    pub async fn report(&self) -> HealthReport {
        match self.latest() {
            Some(report) => report,
            None => self.check_now().await,
        }
    }

    /// Checks immediately and then every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), probes = self.probes.len(), "health monitor started");
        loop {
            self.check_now().await;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.clock.sleep(interval) => {},
            }
        }
        tracing::info!("health monitor stopped");
    }

    async fn run_probe(&self, probe: Arc<dyn HealthProbe>) -> CheckResult {
        let name = probe.name().to_owned();
        let started = self.clock.now();
        let span = info_span!("health_probe", probe = %name);

        let result = tokio::time::timeout(self.probe_timeout, probe.check()).instrument(span).await.unwrap_or_else(
            |_| {
                ProbeResult::unhealthy(
                    Value::Null,
                    format!("probe timed out after {}ms", self.probe_timeout.as_millis()),
                )
            },
        );
        let elapsed = self.clock.now().saturating_duration_since(started);

        if let Some(error) = &result.error {
            tracing::debug!(probe = %name, status = %result.status, error = %error, "probe reported a problem");
        }
        CheckResult {
            name,
            status: result.status,
            response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            details: result.details,
            error: result.error,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record(&self, checks: &[CheckResult]) -> HealthMetrics {
        let mut metrics = self.metrics.lock();
        for check in checks {
            let total_ms = metrics.average_response_time_ms * metrics.total_checks as f64;
            metrics.total_checks += 1;
            metrics.average_response_time_ms = (total_ms + check.response_time_ms as f64) / metrics.total_checks as f64;
            if check.status == HealthStatus::Healthy {
                metrics.successful_checks += 1;
            } else {
                metrics.failed_checks += 1;
            }
        }
        *metrics
    }
}

/// Confirms a tenant can obtain an access token.
///
/// A still-valid cached token counts as healthy without contacting the
/// platform; otherwise the probe goes through the store's rate limiter and
/// breaker like any other refresh.
#[derive(Debug)]
pub struct TokenProbe {
    name: String,
    tenant: TenantConfig,
    credentials: CredentialStore,
}

impl TokenProbe {
    /// Probe for `tenant`.
    pub fn new(tenant: TenantConfig, credentials: CredentialStore) -> Self {
        Self { name: format!("token:{}", tenant.account_id), tenant, credentials }
    }
}

#[async_trait]
impl HealthProbe for TokenProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ProbeResult {
        let details = |cached: bool| json!({ "corp_id": mask(&self.tenant.corp_id), "cached": cached });

        if self.credentials.cached(&self.tenant).is_some() {
            return ProbeResult::healthy(details(true));
        }
        match self.credentials.credential(&self.tenant).await {
            Ok(_) => ProbeResult::healthy(details(false)),
            Err(error) => ProbeResult::unhealthy(details(false), error.to_string()),
        }
    }
}

type SnapshotSource = Box<dyn Fn() -> Vec<CircuitSnapshot> + Send + Sync>;

/// Reports breaker states: any open breaker is unhealthy, any half-open one
/// degraded.
pub struct CircuitProbe {
    source: SnapshotSource,
}

impl fmt::Debug for CircuitProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitProbe").finish_non_exhaustive()
    }
}

impl CircuitProbe {
    /// Probe over whatever breakers `source` reports at check time.
    pub fn new(source: impl Fn() -> Vec<CircuitSnapshot> + Send + Sync + 'static) -> Self {
        Self { source: Box::new(source) }
    }
}

#[async_trait]
impl HealthProbe for CircuitProbe {
    fn name(&self) -> &str {
        "circuit_breakers"
    }

    async fn check(&self) -> ProbeResult {
        let snapshots = (self.source)();
        let named = |state: CircuitState| -> Vec<&str> {
            snapshots.iter().filter(|s| s.state == state).map(|s| s.name.as_str()).collect()
        };
        let open = named(CircuitState::Open);
        let half_open = named(CircuitState::HalfOpen);
        let details = json!({ "breakers": snapshots });

        if !open.is_empty() {
            ProbeResult::unhealthy(details, format!("open: {}", open.join(", ")))
        } else if !half_open.is_empty() {
            ProbeResult::degraded(details, format!("half-open: {}", half_open.join(", ")))
        } else {
            ProbeResult::healthy(details)
        }
    }
}

/// Degraded while dead letters await inspection.
#[derive(Debug)]
pub struct QueueProbe {
    queue: DeliveryQueue,
}

impl QueueProbe {
    /// Probe over `queue`.
    pub fn new(queue: DeliveryQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HealthProbe for QueueProbe {
    fn name(&self) -> &str {
        "delivery_queue"
    }

    async fn check(&self) -> ProbeResult {
        let status = self.queue.status();
        let details = serde_json::to_value(status).unwrap_or(Value::Null);
        if status.dead_letters > 0 {
            ProbeResult::degraded(details, format!("{} dead letters", status.dead_letters))
        } else {
            ProbeResult::healthy(details)
        }
    }
}

/// Tracks recent send outcomes as a [`DeliveryObserver`] and reports
/// degraded when at least half of them failed.
#[derive(Debug, Default)]
pub struct ErrorRateProbe {
    outcomes: Mutex<VecDeque<bool>>,
}

impl ErrorRateProbe {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(attempts, failures)` over the recent window.
    pub fn counts(&self) -> (usize, usize) {
        let outcomes = self.outcomes.lock();
        (outcomes.len(), outcomes.iter().filter(|ok| !**ok).count())
    }

    fn push(&self, ok: bool) {
        let mut outcomes = self.outcomes.lock();
        if outcomes.len() == ERROR_RATE_WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(ok);
    }
}

#[async_trait]
impl DeliveryObserver for ErrorRateProbe {
    async fn on_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Succeeded { .. } => self.push(true),
            DeliveryEvent::AttemptFailed { .. } => self.push(false),
            DeliveryEvent::DeadLettered { .. } => {},
        }
    }
}

#[async_trait]
impl HealthProbe for ErrorRateProbe {
    fn name(&self) -> &str {
        "delivery_error_rate"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn check(&self) -> ProbeResult {
        let (attempts, failures) = self.counts();
        let rate = if attempts == 0 { 0.0 } else { failures as f64 / attempts as f64 };
        let details = json!({ "attempts": attempts, "failures": failures, "error_rate": rate });

        if attempts >= ERROR_RATE_MIN_SAMPLES && rate >= ERROR_RATE_DEGRADED {
            ProbeResult::degraded(details, format!("error rate {:.0}%", rate * 100.0))
        } else {
            ProbeResult::healthy(details)
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{TaskId, TestClock};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use courier_core::{OutboundMessage, SendReceipt};

    use super::*;
    use crate::{
        circuit::{CircuitBreaker, CircuitConfig},
        client::{PlatformApi, TokenGrant},
        credentials::CredentialConfig,
        error::{DeliveryError, Result},
        rate_limit::{RateLimitConfig, RateLimiter},
    };

    #[derive(Debug)]
    struct Fixed(&'static str, HealthStatus);

    #[async_trait]
    impl HealthProbe for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(&self) -> ProbeResult {
            ProbeResult { status: self.1, details: Value::Null, error: None }
        }
    }

    #[derive(Debug)]
    struct Hangs;

    #[async_trait]
    impl HealthProbe for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn check(&self) -> ProbeResult {
            std::future::pending().await
        }
    }

    fn monitor(probes: &[(&'static str, HealthStatus)]) -> HealthMonitor {
        probes
            .iter()
            .fold(HealthMonitor::new(TestClock::new().shared()), |m, (name, status)| {
                m.with_probe(Arc::new(Fixed(*name, *status)))
            })
    }

    #[tokio::test]
    async fn worst_probe_decides_status() {
        use HealthStatus::{Degraded, Healthy, Unhealthy};

        assert_eq!(monitor(&[]).check_now().await.status, Healthy);
        assert_eq!(monitor(&[("a", Healthy), ("b", Healthy)]).check_now().await.status, Healthy);
        assert_eq!(monitor(&[("a", Healthy), ("b", Degraded)]).check_now().await.status, Degraded);
        assert_eq!(monitor(&[("a", Degraded), ("b", Unhealthy)]).check_now().await.status, Unhealthy);
    }

    #[tokio::test]
    async fn metrics_accumulate_across_runs() {
        let monitor = monitor(&[("a", HealthStatus::Healthy), ("b", HealthStatus::Degraded)]);

        monitor.check_now().await;
        let report = monitor.check_now().await;

        assert_eq!(report.metrics.total_checks, 4);
        assert_eq!(report.metrics.successful_checks, 2);
        assert_eq!(report.metrics.failed_checks, 2);
        assert_eq!(report.checks.len(), 2);
        assert_eq!(monitor.latest(), Some(report));
    }

    #[tokio::test]
    async fn hung_probe_times_out_as_unhealthy() {
        let monitor = HealthMonitor::new(TestClock::new().shared())
            .with_probe(Arc::new(Hangs))
            .with_probe_timeout(Duration::from_millis(10));

        let report = monitor.check_now().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.checks[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[derive(Debug, Default)]
    struct Issuer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PlatformApi for Issuer {
        async fn issue_token(&self, _corp_id: &str, _corp_secret: &str) -> Result<TokenGrant> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::upstream(40001, "invalid credential"));
            }
            Ok(TokenGrant { access_token: "tok".into(), expires_in: Duration::from_secs(7200) })
        }

        async fn send_message(&self, _: &str, _: i64, _: &OutboundMessage) -> Result<SendReceipt> {
            unreachable!("health checks never send")
        }
    }

    fn tenant() -> TenantConfig {
        TenantConfig {
            account_id: "default".into(),
            corp_id: "ww1234".into(),
            corp_secret: "secret".into(),
            agent_id: 1,
            token: "t".into(),
            encoding_aes_key: None,
        }
    }

    #[tokio::test]
    async fn token_check_reuses_cached_credential() {
        let clock = TestClock::new();
        let api = Arc::new(Issuer::default());
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.shared()));
        let store = CredentialStore::new(api.clone(), limiter, clock.shared(), CredentialConfig::default());
        let check = TokenProbe::new(tenant(), store);

        let first = check.check().await;
        assert_eq!(first.status, HealthStatus::Healthy);
        assert_eq!(first.details["cached"], false);

        let second = check.check().await;
        assert_eq!(second.status, HealthStatus::Healthy);
        assert_eq!(second.details["cached"], true);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_check_reports_issuance_failure() {
        let clock = TestClock::new();
        let api = Arc::new(Issuer::default());
        api.fail.store(true, Ordering::SeqCst);
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.shared()));
        let store = CredentialStore::new(api.clone(), limiter, clock.shared(), CredentialConfig::default());

        let result = TokenProbe::new(tenant(), store).check().await;

        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.as_deref().unwrap().contains("invalid credential"));
        assert_ne!(result.details["corp_id"], "ww1234");
    }

    #[tokio::test]
    async fn circuit_probe_reflects_breaker_state() {
        let clock = TestClock::new();
        let config = CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() };
        let breaker = Arc::new(CircuitBreaker::new("send:default", config, clock.shared()));
        let probe = {
            let breaker = breaker.clone();
            CircuitProbe::new(move || vec![breaker.snapshot()])
        };
        assert_eq!(probe.check().await.status, HealthStatus::Healthy);

        let _ = breaker.execute(|| async { Err::<(), _>(DeliveryError::network("down")) }).await;
        let open = probe.check().await;
        assert_eq!(open.status, HealthStatus::Unhealthy);
        assert_eq!(open.error.as_deref(), Some("open: send:default"));

        clock.advance(Duration::from_secs(30));
        assert_eq!(probe.check().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn error_rate_needs_enough_samples() {
        let probe = ErrorRateProbe::new();
        let failed = || DeliveryEvent::AttemptFailed {
            task_id: TaskId::new(),
            attempt: 1,
            error: "x".into(),
            will_retry: false,
            at: Utc::now(),
        };

        for _ in 0..9 {
            probe.on_event(failed()).await;
        }
        assert_eq!(probe.check().await.status, HealthStatus::Healthy);

        probe.on_event(failed()).await;
        assert_eq!(probe.check().await.status, HealthStatus::Degraded);

        for _ in 0..11 {
            probe.on_event(DeliveryEvent::Succeeded { task_id: TaskId::new(), attempt: 1, at: Utc::now() }).await;
        }
        assert_eq!(probe.counts(), (21, 10));
        assert_eq!(probe.check().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let monitor = Arc::new(monitor(&[("a", HealthStatus::Healthy)]));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.clone().run(Duration::from_secs(30), cancel.clone()));

        while monitor.latest().is_none() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(monitor.latest().unwrap().metrics.total_checks >= 1);
    }
}
