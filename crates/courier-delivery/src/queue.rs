//! Concurrency-bounded outbound send queue with retry and dead-lettering.
//!
//! Tasks run on tokio tasks tracked by a [`TaskTracker`]. A failing task keeps
//! its worker slot through the backoff wait and is then requeued at the front,
//! so retries reach a worker before anything enqueued after them.
//!
//! The cost is head-of-line blocking: while `max_concurrent` tasks sit in
//! backoff, nothing else is dispatched, even for tenants whose upstream is
//! healthy. The wait is bounded by [`RetryPolicy::max_delay`]. Deployments
//! serving many tenants should size `max_concurrent` above the number of
//! tenants expected to fail at once.
//!
//! Cancellation is cooperative: a cancelled task is never retried again, but a
//! send already on the wire runs to completion and its outcome is recorded.

use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use courier_core::{
    DeadLetter, DeliveryEvent, DeliveryObserver, NoOpObserver, OutboundMessage, QueuedSend, SendReceipt,
    SharedClock, TaskId,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info_span, Instrument};

use crate::{
    error::Result,
    retry::{RetryDecision, RetryPolicy},
};

/// Function that performs one send attempt.
pub type SendFn = Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, Result<SendReceipt>> + Send + Sync>;

/// Wraps an async closure as a [`SendFn`].
pub fn send_fn<F, Fut>(f: F) -> SendFn
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SendReceipt>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Tasks sending or backing off at once.
    pub max_concurrent: usize,
    /// Retry budget and backoff.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 3, retry: RetryPolicy::default() }
    }
}

/// Cumulative counters since start (or the last `clear`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Distinct enqueued tasks.
    pub total: u64,
    /// Tasks the platform accepted.
    pub success: u64,
    /// Failed send attempts.
    pub failed: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Tasks moved to the dead-letter list.
    pub dead_lettered: u64,
    /// Tasks stopped by cancellation.
    pub cancelled: u64,
}

/// Point-in-time queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Sends on the wire.
    pub in_flight: usize,
    /// Tasks in a backoff wait.
    pub waiting_retry: usize,
    /// Dead letters awaiting inspection.
    pub dead_letters: usize,
    /// Cumulative counters.
    pub stats: QueueStats,
}

struct Task {
    send: QueuedSend,
    send_fn: SendFn,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    in_flight: usize,
    waiting_retry: usize,
    dead_letters: Vec<DeadLetter>,
    stats: QueueStats,
    generation: u64,
}

impl QueueState {
    const fn busy_workers(&self) -> usize {
        self.in_flight + self.waiting_retry
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.busy_workers() == 0
    }
}

struct QueueInner {
    config: QueueConfig,
    clock: SharedClock,
    observer: Arc<dyn DeliveryObserver>,
    state: Mutex<QueueState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    idle: Notify,
}

/// Buffered sender with bounded concurrency, retry, and dead letters.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue").field("status", &self.status()).finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Creates an empty queue that reports to no observer.
    pub fn new(config: QueueConfig, clock: SharedClock) -> Self {
        Self::with_observer(config, clock, Arc::new(NoOpObserver))
    }

    /// Creates an empty queue reporting outcomes to `observer`.
    pub fn with_observer(config: QueueConfig, clock: SharedClock, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                clock,
                observer,
                state: Mutex::new(QueueState::default()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Appends a task and starts workers up to the concurrency limit.
    pub fn enqueue(&self, message: OutboundMessage, send_fn: SendFn) -> TaskId {
        self.enqueue_with_cancellation(message, send_fn, CancellationToken::new())
    }

    /// Like [`enqueue`](Self::enqueue); cancelling `cancel` stops further
    /// attempts of this task.
    pub fn enqueue_with_cancellation(
        &self,
        message: OutboundMessage,
        send_fn: SendFn,
        cancel: CancellationToken,
    ) -> TaskId {
        let id = TaskId::new();
        {
            let mut state = self.inner.state.lock();
            let send = QueuedSend {
                id,
                payload: message,
                attempt_count: 0,
                enqueued_at: self.inner.clock.now_utc(),
            };
            let generation = state.generation;
            state.pending.push_back(Task { send, send_fn, cancel, generation });
            state.stats.total += 1;
        }
        tracing::debug!(task_id = %id, "send task enqueued");

        self.inner.pump();
        id
    }

    /// Pending, in-flight, and cumulative counts.
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            waiting_retry: state.waiting_retry,
            dead_letters: state.dead_letters.len(),
            stats: state.stats,
        }
    }

    /// Copy of the dead-letter list.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state.lock().dead_letters.clone()
    }

    /// Removes and returns the dead-letter list.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.inner.state.lock().dead_letters)
    }

    /// Drops all pending and dead-lettered work and resets counters.
    ///
    /// Tasks in a backoff wait are discarded when the wait ends; sends already
    /// on the wire finish but are not counted.
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.pending.len() + state.dead_letters.len();
            state.pending.clear();
            state.dead_letters.clear();
            state.stats = QueueStats::default();
            state.generation += 1;
            dropped
        };
        tracing::warn!(dropped, "delivery queue cleared");
        self.inner.notify_if_idle();
    }

    /// Resolves once nothing is pending, sending, or backing off.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops retries, then waits up to `timeout` for in-flight sends.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let status = self.status();
        tracing::info!(
            pending = status.pending,
            in_flight = status.in_flight,
            timeout_secs = timeout.as_secs(),
            "shutting down delivery queue"
        );

        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_ok() {
            tracing::info!("delivery queue drained");
            true
        } else {
            tracing::warn!("delivery queue shutdown timed out with sends still in flight");
            false
        }
    }
}

impl QueueInner {
    /// Starts tasks while workers are free.
    fn pump(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if self.shutdown.is_cancelled() || state.busy_workers() >= self.config.max_concurrent {
                    return;
                }
                let Some(task) = state.pending.pop_front() else {
                    return;
                };
                state.in_flight += 1;
                task
            };

            let inner = Arc::clone(self);
            self.tracker.spawn(async move { inner.run(task).await });
        }
    }

    async fn run(self: Arc<Self>, mut task: Task) {
        let task_id = task.send.id;
        let attempt = task.send.attempt_count + 1;

        if task.cancel.is_cancelled() {
            tracing::info!(%task_id, "send task cancelled before dispatch");
            self.settle(&task, Settlement::Cancelled);
            return;
        }

        let span = info_span!(
            "send_task",
            %task_id,
            attempt,
            msg_type = task.send.payload.body.msg_type()
        );
        let outcome = (task.send_fn)(task.send.payload.clone()).instrument(span).await;
        let now = self.clock.now_utc();

        let error = match outcome {
            Ok(receipt) => {
                tracing::info!(%task_id, attempt, msg_id = ?receipt.msg_id, "message delivered");
                self.settle(&task, Settlement::Delivered);
                self.observer.on_event(DeliveryEvent::Succeeded { task_id, attempt, at: now }).await;
                return;
            },
            Err(error) => error,
        };

        let cancelled = task.cancel.is_cancelled() || self.shutdown.is_cancelled();
        let decision = if cancelled {
            RetryDecision::GiveUp { reason: "cancelled".to_string() }
        } else {
            self.config.retry.decide(task.send.attempt_count, &error)
        };
        let will_retry = matches!(decision, RetryDecision::Retry { .. });

        match decision {
            RetryDecision::Retry { .. } => {
                tracing::warn!(%task_id, attempt, error = %error, "send failed, retrying");
                self.settle(&task, Settlement::Retrying);
            },
            RetryDecision::GiveUp { .. } if cancelled => {
                tracing::info!(%task_id, attempt, error = %error, "send failed after cancellation, not retrying");
                self.settle(&task, Settlement::Abandoned);
            },
            RetryDecision::GiveUp { ref reason } => {
                tracing::error!(%task_id, attempt, error = %error, %reason, "send task dead-lettered");
                let letter = DeadLetter {
                    task_id,
                    payload: task.send.payload.clone(),
                    attempts: attempt,
                    last_error: error.to_string(),
                    failed_at: now,
                };
                self.settle(&task, Settlement::DeadLettered(letter));
            },
        }

        self.observer
            .on_event(DeliveryEvent::AttemptFailed { task_id, attempt, error: error.to_string(), will_retry, at: now })
            .await;

        match decision {
            RetryDecision::Retry { attempt_count, delay } => {
                task.send.attempt_count = attempt_count;
                self.backoff_and_requeue(task, delay).await;
            },
            RetryDecision::GiveUp { .. } if !cancelled => {
                self.observer
                    .on_event(DeliveryEvent::DeadLettered {
                        task_id,
                        attempts: attempt,
                        error: error.to_string(),
                        at: now,
                    })
                    .await;
            },
            RetryDecision::GiveUp { .. } => {},
        }
    }

    /// Holds the worker slot through the backoff, then requeues at the front.
    async fn backoff_and_requeue(self: Arc<Self>, task: Task, delay: Duration) {
        tracing::debug!(task_id = %task.send.id, delay_ms = %delay.as_millis(), "backing off before retry");
        let interrupted = tokio::select! {
            () = self.clock.sleep(delay) => false,
            () = task.cancel.cancelled() => true,
            () = self.shutdown.cancelled() => true,
        };

        {
            let mut state = self.state.lock();
            state.waiting_retry -= 1;
            let current = task.generation == state.generation;
            if interrupted {
                if current {
                    state.stats.cancelled += 1;
                }
            } else if current {
                state.pending.push_front(task);
            }
        }
        if interrupted {
            tracing::info!("send task cancelled during backoff");
        }

        self.pump();
        self.notify_if_idle();
    }

    /// Releases the in-flight slot and records the outcome. Counters and dead
    /// letters are skipped for tasks that predate the last `clear`.
    fn settle(self: &Arc<Self>, task: &Task, settlement: Settlement) {
        {
            let mut state = self.state.lock();
            state.in_flight -= 1;
            let current = task.generation == state.generation;
            match settlement {
                Settlement::Delivered if current => state.stats.success += 1,
                Settlement::Cancelled if current => state.stats.cancelled += 1,
                Settlement::Abandoned if current => {
                    state.stats.failed += 1;
                    state.stats.cancelled += 1;
                },
                Settlement::Retrying => {
                    state.waiting_retry += 1;
                    if current {
                        state.stats.failed += 1;
                        state.stats.retries += 1;
                    }
                },
                Settlement::DeadLettered(letter) if current => {
                    state.stats.failed += 1;
                    state.stats.dead_lettered += 1;
                    state.dead_letters.push(letter);
                },
                _ => {},
            }
        }
        self.pump();
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.state.lock().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

enum Settlement {
    Delivered,
    Cancelled,
    Abandoned,
    Retrying,
    DeadLettered(DeadLetter),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::{RealClock, Target, TestClock};

    use super::*;
    use crate::error::DeliveryError;

    fn config(max_concurrent: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            retry: RetryPolicy { max_retries: 3, base_delay: Duration::from_secs(1), ..RetryPolicy::default() },
        }
    }

    fn message(content: &str) -> OutboundMessage {
        OutboundMessage::text(Target::user("u1"), content)
    }

    /// Fails the first `failures` calls, then succeeds; records message order.
    fn flaky(failures: usize, calls: Arc<AtomicUsize>, order: Arc<Mutex<Vec<String>>>) -> SendFn {
        send_fn(move |message: OutboundMessage| {
            let calls = calls.clone();
            let order = order.clone();
            async move {
                if let courier_core::MessageBody::Text { text } = &message.body {
                    order.lock().push(text.content.clone());
                }
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(DeliveryError::network("connection reset"))
                } else {
                    Ok(SendReceipt::default())
                }
            }
        })
    }

    #[tokio::test]
    async fn successful_send_is_recorded() {
        let queue = DeliveryQueue::new(config(2), TestClock::new().shared());
        let calls = Arc::new(AtomicUsize::new(0));

        queue.enqueue(message("hi"), flaky(0, calls.clone(), Arc::default()));
        queue.wait_idle().await;

        let status = queue.status();
        assert_eq!(status.stats, QueueStats { total: 1, success: 1, ..QueueStats::default() });
        assert_eq!(status.pending, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_task_is_dead_lettered_once_with_exponential_backoff() {
        let clock = TestClock::new();
        let queue = DeliveryQueue::new(config(1), clock.shared());
        let calls = Arc::new(AtomicUsize::new(0));

        let id = queue.enqueue(message("doomed"), flaky(usize::MAX, calls.clone(), Arc::default()));
        queue.wait_idle().await;

        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_id, id);
        assert_eq!(letters[0].attempts, 4);
        assert!(letters[0].last_error.contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(2 + 4 + 8));

        let stats = queue.status().stats;
        assert_eq!((stats.total, stats.failed, stats.retries, stats.dead_lettered, stats.success), (1, 4, 3, 1, 0));
    }

    #[tokio::test]
    async fn retries_run_before_later_arrivals() {
        let queue = DeliveryQueue::new(config(1), TestClock::new().shared());
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue(message("a"), flaky(1, Arc::new(AtomicUsize::new(0)), order.clone()));
        queue.enqueue(message("b"), flaky(0, Arc::new(AtomicUsize::new(0)), order.clone()));
        queue.wait_idle().await;

        assert_eq!(*order.lock(), vec!["a", "a", "b"]);
        assert_eq!(queue.status().stats.success, 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let queue = DeliveryQueue::new(config(2), RealClock::shared());
        let gate = Arc::new(Notify::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let (gate, running, peak) = (gate.clone(), running.clone(), peak.clone());
            queue.enqueue(
                message(&i.to_string()),
                send_fn(move |_| {
                    let (gate, running, peak) = (gate.clone(), running.clone(), peak.clone());
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        gate.notified().await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(SendReceipt::default())
                    }
                }),
            );
        }

        assert_eq!(queue.status().pending, 3);
        while queue.status().stats.success < 5 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_dead_letters_immediately() {
        let queue = DeliveryQueue::new(config(1), TestClock::new().shared());

        queue.enqueue(
            message("x"),
            send_fn(|_| async { Err(DeliveryError::upstream(81013, "user & party & tag all invalid")) }),
        );
        queue.wait_idle().await;

        let letters = queue.drain_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.status().stats.retries, 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retries() {
        let config = QueueConfig {
            max_concurrent: 1,
            retry: RetryPolicy { base_delay: Duration::from_secs(60), ..RetryPolicy::default() },
        };
        let queue = DeliveryQueue::new(config, RealClock::shared());
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        queue.enqueue_with_cancellation(
            message("x"),
            flaky(usize::MAX, calls.clone(), Arc::default()),
            cancel.clone(),
        );
        while queue.status().waiting_retry == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        queue.wait_idle().await;

        let status = queue.status();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(status.stats.cancelled, 1);
        assert_eq!(status.dead_letters, 0);
    }

    #[tokio::test]
    async fn backoff_keeps_later_arrivals_waiting() {
        let config = QueueConfig {
            max_concurrent: 1,
            retry: RetryPolicy { base_delay: Duration::from_secs(60), ..RetryPolicy::default() },
        };
        let queue = DeliveryQueue::new(config, RealClock::shared());
        let order = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        queue.enqueue_with_cancellation(
            message("failing"),
            flaky(usize::MAX, Arc::new(AtomicUsize::new(0)), order.clone()),
            cancel.clone(),
        );
        while queue.status().waiting_retry == 0 {
            tokio::task::yield_now().await;
        }
        queue.enqueue(message("healthy"), flaky(0, Arc::new(AtomicUsize::new(0)), order.clone()));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let status = queue.status();
        assert_eq!((status.pending, status.in_flight, status.waiting_retry), (1, 0, 1));
        assert_eq!(*order.lock(), vec!["failing"]);

        cancel.cancel();
        queue.wait_idle().await;
        assert_eq!(*order.lock(), vec!["failing", "healthy"]);
        assert_eq!(queue.status().stats.success, 1);
    }

    #[tokio::test]
    async fn cancellation_does_not_abort_in_flight_send() {
        let queue = DeliveryQueue::new(config(1), TestClock::new().shared());
        let gate = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let (g, s) = (gate.clone(), started.clone());
        queue.enqueue_with_cancellation(
            message("x"),
            send_fn(move |_| {
                let (gate, started) = (g.clone(), s.clone());
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(SendReceipt::default())
                }
            }),
            cancel.clone(),
        );
        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        gate.notify_one();
        queue.wait_idle().await;

        assert_eq!(queue.status().stats.success, 1);
    }

    #[tokio::test]
    async fn clear_drops_pending_and_dead_letters() {
        let queue = DeliveryQueue::new(config(1), TestClock::new().shared());
        queue.enqueue(message("bad"), send_fn(|_| async { Err(DeliveryError::configuration("no agent")) }));
        queue.wait_idle().await;
        assert_eq!(queue.status().dead_letters, 1);

        queue.clear();

        let status = queue.status();
        assert_eq!(status.dead_letters, 0);
        assert_eq!(status.stats, QueueStats::default());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_sends() {
        let queue = DeliveryQueue::new(config(1), RealClock::shared());
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        queue.enqueue(
            message("slow"),
            send_fn(move |_| {
                let done = d.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(SendReceipt::default())
                }
            }),
        );

        assert!(queue.shutdown(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
