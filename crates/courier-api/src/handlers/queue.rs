//! Delivery queue inspection endpoints.

use axum::{extract::State, Json};
use courier_core::DeadLetter;
use courier_delivery::QueueStatus;
use tracing::instrument;

use crate::AppState;

/// `GET /queue/status`: pending, in-flight and retrying counts with stats.
#[instrument(name = "queue_status", skip(app_state))]
pub async fn queue_status(State(app_state): State<AppState>) -> Json<QueueStatus> {
    Json(app_state.queue.status())
}

/// `GET /queue/dead-letters`: tasks that exhausted their retries.
#[instrument(name = "dead_letters", skip(app_state))]
pub async fn dead_letters(State(app_state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(app_state.queue.dead_letters())
}
