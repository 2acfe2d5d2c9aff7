//! Delivery outcome events.
//!
//! The delivery queue reports every attempt outcome through a
//! [`DeliveryObserver`]; the health monitor is the main subscriber and turns
//! the stream into an error-rate signal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::TaskId;

/// Outcome of one send attempt, or of a whole task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// The platform accepted the message.
    Succeeded {
        /// Task that completed.
        task_id: TaskId,
        /// Attempt number that succeeded (1-based).
        attempt: u32,
        /// Completion time.
        at: DateTime<Utc>,
    },

    /// An attempt failed; the task may still be retried.
    AttemptFailed {
        /// Task that failed.
        task_id: TaskId,
        /// Attempt number that failed (1-based).
        attempt: u32,
        /// Error rendered for operators.
        error: String,
        /// Whether the queue will try again.
        will_retry: bool,
        /// Failure time.
        at: DateTime<Utc>,
    },

    /// The task exhausted its retries and moved to the dead-letter list.
    DeadLettered {
        /// Task that was set aside.
        task_id: TaskId,
        /// Attempts made in total.
        attempts: u32,
        /// Final error.
        error: String,
        /// Dead-letter time.
        at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    /// Task the event refers to.
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Succeeded { task_id, .. }
            | Self::AttemptFailed { task_id, .. }
            | Self::DeadLettered { task_id, .. } => *task_id,
        }
    }
}

/// Subscriber to delivery outcomes.
///
/// Implementations must not block; failures inside an observer are its own
/// concern and never reach the queue.
#[async_trait::async_trait]
pub trait DeliveryObserver: Send + Sync + std::fmt::Debug {
    /// Receives one delivery event.
    async fn on_event(&self, event: DeliveryEvent);
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

#[async_trait::async_trait]
impl DeliveryObserver for NoOpObserver {
    async fn on_event(&self, _event: DeliveryEvent) {}
}

/// Fans events out to several observers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastObserver {
    observers: Vec<Arc<dyn DeliveryObserver>>,
}

impl MulticastObserver {
    /// Creates a fan-out with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn subscribe(&mut self, observer: Arc<dyn DeliveryObserver>) {
        self.observers.push(observer);
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

#[async_trait::async_trait]
impl DeliveryObserver for MulticastObserver {
    async fn on_event(&self, event: DeliveryEvent) {
        let deliveries = self.observers.iter().map(|observer| observer.on_event(event.clone()));
        futures::future::join_all(deliveries).await;
    }
}
