//! Health, readiness, liveness and queue endpoint tests.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use courier_api::{MessageRouter, Services};
use courier_core::RealClock;
use courier_testing::{config, MockPlatform, TenantBuilder};
use serde_json::Value;
use tower::ServiceExt;

async fn app(platform: &MockPlatform) -> Router {
    let tenant = TenantBuilder::new("default").corp_id("wwhealth").build();
    Services::build(&config(&platform.uri(), &[tenant]), MessageRouter::new(), RealClock::shared())
        .unwrap()
        .http_router()
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("failed to read body");
    (status, serde_json::from_slice(&bytes).expect("response should be JSON"))
}

#[tokio::test]
async fn health_is_ok_when_token_can_be_issued() {
    let platform = MockPlatform::start().await;
    platform.token("wwhealth", "tok-1", 1).await;
    let app = app(&platform).await;

    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    let names: Vec<&str> = body["checks"].as_array().unwrap().iter().map(|c| c["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["token:default", "circuit_breakers", "delivery_queue", "delivery_error_rate"]);
    assert_eq!(body["checks"][0]["details"]["corp_id"], "wwhealth...");
    assert_eq!(body["metrics"]["total_checks"], 4);

    // the second check is served from the token cache
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"][0]["details"]["cached"], true);
}

#[tokio::test]
async fn health_is_unavailable_when_token_issuance_fails() {
    let platform = MockPlatform::start().await;
    let app = app(&platform).await;

    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert!(body["checks"][0]["error"].is_string());
}

#[tokio::test]
async fn liveness_does_not_touch_the_platform() {
    let platform = MockPlatform::start().await;
    let app = app(&platform).await;

    let (status, body) = get(&app, "/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "courier");
}

#[tokio::test]
async fn queue_endpoints_report_empty_queue() {
    let platform = MockPlatform::start().await;
    let app = app(&platform).await;

    let (status, body) = get(&app, "/queue/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 0);
    assert_eq!(body["stats"]["total"], 0);

    let (status, body) = get(&app, "/queue/dead-letters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}
