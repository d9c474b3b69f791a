//! Common test utilities for API integration tests
//!
//! Builds the full application on the in-memory store, the in-memory bus and
//! a manual clock, so tests drive time explicitly and never touch the network.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use lockstep_api::models::{DeviceKind, DevicePair};
use lockstep_api::repositories::MemoryStore;
use lockstep_api::services::auth::Role;
use lockstep_api::services::ManualClock;
use lockstep_api::transport::messages::HeartbeatPayload;
use lockstep_api::transport::MessageBus;
use lockstep_api::{AppState, Config};

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub operator_token: String,
    pub viewer_token: String,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    pub fn with_config(config: Config) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let state = AppState::new(
            config,
            store.clone(),
            MessageBus::new_in_memory(),
            clock.clone(),
        );
        let operator_token = state
            .auth
            .issue_token("operator-1", Role::Operator)
            .expect("operator token");
        let viewer_token = state
            .auth
            .issue_token("viewer-1", Role::Viewer)
            .expect("viewer token");

        Self {
            state,
            store,
            clock,
            operator_token,
            viewer_token,
        }
    }

    pub fn router(&self) -> Router {
        self.state.router()
    }

    /// Heartbeat both devices and pair them through a claimed bundle
    pub async fn online_pair(&self, vr: &str, chair: &str) -> DevicePair {
        for id in [vr, chair] {
            self.state
                .presence
                .record_heartbeat(id, HeartbeatPayload::default())
                .await;
        }
        let pairing = &self.state.pairing;
        let issued = pairing.issue_bundle(None).await.expect("issue bundle");
        pairing
            .claim(&issued.code, vr, DeviceKind::Vr)
            .await
            .expect("vr claim");
        pairing
            .claim(&issued.code, chair, DeviceKind::Chair)
            .await
            .expect("chair claim")
            .pair
            .expect("completed bundle carries its pair")
    }

    /// Send a request through the router and decode the JSON body, if any
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }
}
