//! Integration tests for health check endpoints
//!
//! Tests the health check API routes to ensure proper responses
//! for liveness and readiness probes.

mod common;

use axum::http::{Method, StatusCode};

use common::TestApp;

#[tokio::test]
async fn test_root_endpoint() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("Lockstep"));
}

#[tokio::test]
async fn test_simple_health_check() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_liveness_probe() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health/live", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_readiness_with_memory_broker_is_degraded_but_ready() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health/ready", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    let services = body["services"].as_array().unwrap();
    let broker = services
        .iter()
        .find(|s| s["name"] == "broker")
        .expect("broker entry");
    assert_eq!(broker["status"], "degraded");
}

#[tokio::test]
async fn test_readiness_fails_when_store_rejects() {
    let app = TestApp::new();
    app.store.set_write_failure(true);

    let (status, body) = app.send(Method::GET, "/health/ready", None, None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_nonexistent_route_returns_404() {
    let app = TestApp::new();
    let (status, _) = app.send(Method::GET, "/nonexistent", None, None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
