//! Integration tests for the session lifecycle over HTTP
//!
//! Time is driven by the manual clock, so durations in the assertions are
//! exact.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use common::TestApp;
use lockstep_api::models::SessionStatus;
use lockstep_api::repositories::{Pagination, Store};

async fn create_session(app: &TestApp, pair_id: Uuid) -> Uuid {
    let (status, body) = app
        .send(
            Method::POST,
            "/sessions",
            Some(&app.operator_token),
            Some(json!({ "pairId": pair_id, "journeyIds": ["ocean-dive"] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
}

async fn command(app: &TestApp, session_id: Uuid, name: &str) -> (StatusCode, serde_json::Value) {
    let uri = format!("/sessions/{}/commands/{}", session_id, name);
    app.send(Method::POST, &uri, Some(&app.operator_token), None)
        .await
}

#[test_log::test(tokio::test)]
async fn test_pause_is_excluded_from_total_duration() {
    let app = TestApp::new();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;

    let (status, body) = command(&app, session_id, "start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert!(body["startedAt"].is_string());

    app.clock.advance(Duration::seconds(10));
    let (status, body) = command(&app, session_id, "pause").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");
    assert!(body["pausedAt"].is_string());
    assert_eq!(body["positionMs"], 10_000);

    app.clock.advance(Duration::seconds(5));
    let (status, body) = command(&app, session_id, "start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["pauseDurationMs"], 5_000);

    app.clock.advance(Duration::seconds(20));
    let (status, body) = command(&app, session_id, "stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["overallStatus"], "completed");
    assert_eq!(body["totalDurationMs"], 30_000);
    assert_eq!(body["participants"][0]["status"], "completed");
}

#[tokio::test]
async fn test_rejected_command_returns_current_state() {
    let app = TestApp::new();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;

    let (status, body) = command(&app, session_id, "pause").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");
    assert_eq!(body["details"]["status"], "ready");
    assert_eq!(body["details"]["id"], session_id.to_string());

    command(&app, session_id, "stop").await;
    let (status, body) = command(&app, session_id, "start").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["status"], "stopped");

    let (status, _) = command(&app, session_id, "rewind").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_seek_requires_position() {
    let app = TestApp::new();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;
    command(&app, session_id, "start").await;

    let uri = format!("/sessions/{}/commands/seek", session_id);
    let (status, _) = app
        .send(Method::POST, &uri, Some(&app.operator_token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .send(
            Method::POST,
            &uri,
            Some(&app.operator_token),
            Some(json!({ "positionMs": 42_000 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["positionMs"], 42_000);

    app.clock.advance(Duration::seconds(3));
    let detail = app.state.orchestrator.get_session(session_id).await.unwrap();
    assert_eq!(detail.position_ms, 45_000);
}

#[tokio::test]
async fn test_commands_fan_out_on_the_bus() {
    let app = TestApp::new();
    let mut bus = app.state.bus.subscribe();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;

    command(&app, session_id, "start").await;

    let mut topics = Vec::new();
    while let Ok(message) = bus.try_recv() {
        topics.push(message.topic);
    }
    assert!(topics.contains(&format!("sessions/{}/commands/start", session_id)));
    assert!(topics.contains(&"devices/VR-001/commands/start".to_string()));
    assert!(topics.contains(&"devices/CHAIR-001/commands/start".to_string()));

    // polling sees the same commands
    let (status, body) = app
        .send(Method::GET, "/commands/CHAIR-001", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let polled = body.as_array().unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0]["command"]["command"], "start");
    assert_eq!(polled[0]["command"]["commandSeq"], 1);

    let (_, body) = app
        .send(Method::GET, "/commands/CHAIR-001", None, None)
        .await;
    assert!(body.as_array().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_persistence_failure_leaves_state_untouched() {
    let app = TestApp::new();
    let mut bus = app.state.bus.subscribe();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;
    while bus.try_recv().is_ok() {}

    app.store.set_write_failure(true);
    let (status, body) = command(&app, session_id, "start").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "STORE_ERROR");
    assert!(bus.try_recv().is_err());

    app.store.set_write_failure(false);
    let stored = app.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Ready);
    assert_eq!(stored.command_seq, 0);

    let (status, body) = command(&app, session_id, "start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commandSeq"], 1);
}

#[tokio::test]
async fn test_logs_and_delete() {
    let app = TestApp::new();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;
    command(&app, session_id, "start").await;
    command(&app, session_id, "pause").await;

    let uri = format!("/sessions/{}/logs", session_id);
    let (status, body) = app
        .send(Method::GET, &uri, Some(&app.viewer_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|log| log["event"].as_str().unwrap())
        .collect();
    assert_eq!(events, vec!["created", "start", "pause"]);

    let uri = format!("/sessions/{}", session_id);
    let (status, _) = app
        .send(Method::DELETE, &uri, Some(&app.operator_token), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .send(Method::GET, &uri, Some(&app.viewer_token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let logs = app
        .store
        .list_logs(session_id, Pagination::default())
        .await
        .unwrap();
    assert_eq!(logs.total, 0);
}

#[tokio::test]
async fn test_viewer_cannot_command() {
    let app = TestApp::new();
    let pair = app.online_pair("VR-001", "CHAIR-001").await;
    let session_id = create_session(&app, pair.id).await;

    let uri = format!("/sessions/{}/commands/start", session_id);
    let (status, _) = app
        .send(Method::POST, &uri, Some(&app.viewer_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
