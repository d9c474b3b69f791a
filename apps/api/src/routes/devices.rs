//! Device registry and presence routes
//!
//! - `GET /devices` - Registered devices (authenticated)
//! - `GET /devices/presence` - Live presence view (authenticated)
//! - `POST /devices/publish` - Publish a device topic over HTTP, for devices
//!   with neither broker nor bridge socket

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::middleware::AuthUser;
use crate::models::Device;
use crate::repositories::{PaginatedResult, Pagination, SharedStore};
use crate::services::presence::{DevicePresence, PresenceTracker};
use crate::transport::inbound::{InboundRouter, TransportKind};

#[derive(Clone)]
pub struct DevicesState {
    pub store: SharedStore,
    pub presence: Arc<PresenceTracker>,
    pub inbound: Arc<InboundRouter>,
}

pub fn devices_router(state: DevicesState) -> Router {
    Router::new()
        .route("/", get(list_devices))
        .route("/presence", get(presence))
        .route("/publish", post(publish))
        .with_state(state)
}

async fn list_devices(
    _user: AuthUser,
    State(state): State<DevicesState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Device>>> {
    let devices = state.store.list_devices(page.clamped()).await?;
    Ok(Json(devices))
}

async fn presence(_user: AuthUser, State(state): State<DevicesState>) -> Json<Vec<DevicePresence>> {
    Json(state.presence.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Accepted without waiting for the outcome; like broker traffic, a bad
/// payload is logged and dropped
async fn publish(State(state): State<DevicesState>, Json(req): Json<PublishRequest>) -> StatusCode {
    let message = state
        .inbound
        .message(TransportKind::Polling, req.topic, req.payload);
    state.inbound.route(message).await;
    StatusCode::ACCEPTED
}
