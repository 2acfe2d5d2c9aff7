//! Exponential backoff for queued sends.
//!
//! A failed task with `attempt_count < max_retries` is retried after
//! `base_delay * 2^attempt_count` (counted after the increment), capped at
//! `max_delay` and optionally jittered.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry budget and backoff shape for the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay unit for the exponential schedule.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Randomization (0.0 to 1.0) applied around each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`; the task's attempt count becomes `attempt_count`.
    Retry {
        /// Attempt count after this failure
        attempt_count: u32,
        /// Wait before requeueing
        delay: Duration,
    },
    /// Move the task to the dead-letter list.
    GiveUp {
        /// Why retrying stopped
        reason: String,
    },
}

impl RetryPolicy {
    /// Decides the fate of a task that has already been retried
    /// `attempt_count` times and just failed with `error`.
    pub fn decide(&self, attempt_count: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }
        if attempt_count >= self.max_retries {
            return RetryDecision::GiveUp { reason: format!("maximum retries ({}) exhausted", self.max_retries) };
        }

        let next = attempt_count + 1;
        let mut delay = self.delay_for(next);
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint);
        }
        RetryDecision::Retry { attempt_count: next, delay }
    }

    /// Backoff delay for the given attempt count.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt_count.min(20));
        let raw = self.base_delay.saturating_mul(multiplier);
        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let spread = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
