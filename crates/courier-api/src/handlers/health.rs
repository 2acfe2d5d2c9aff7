//! Health, readiness and liveness endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_delivery::{HealthReport, HealthStatus};
use tracing::{debug, instrument};

use crate::AppState;

/// `GET /health`: runs every probe and returns the full report.
///
/// Degraded still answers 200; only an unhealthy verdict is a 503.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let report = app_state.health.check_now().await;
    debug!(status = %report.status, checks = report.checks.len(), "health check completed");
    report_response(report)
}

/// `GET /ready`: latest report, probing only when none exists yet.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    report_response(app_state.health.report().await)
}

/// `GET /live`: the process is serving requests.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "courier",
    });

    (StatusCode::OK, Json(response)).into_response()
}

fn report_response(report: HealthReport) -> Response {
    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(report)).into_response()
}
