//! Command polling fallback
//!
//! - `GET /commands/:device_id` - Drain every queued command, oldest first (device)
//! - `POST /commands/:device_id` - Queue and publish one command (operator)
//!
//! Push and poll share one queue per device, so a device that switches
//! between them sees each command once.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::middleware::OperatorUser;
use crate::models::validate_device_id;
use crate::services::clock::SharedClock;
use crate::services::{CommandDispatcher, QueuedCommand};

#[derive(Clone)]
pub struct CommandsState {
    pub commands: Arc<CommandDispatcher>,
    pub clock: SharedClock,
}

pub fn commands_router(state: CommandsState) -> Router {
    Router::new()
        .route("/:device_id", get(poll_commands).post(post_command))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PostCommandRequest {
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

async fn poll_commands(
    State(state): State<CommandsState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<QueuedCommand>>> {
    validate_device_id(&device_id)?;
    let drained = state.commands.drain(&device_id);
    if !drained.is_empty() {
        tracing::debug!(device_id = %device_id, count = drained.len(), "Commands polled");
    }
    Ok(Json(drained))
}

async fn post_command(
    operator: OperatorUser,
    State(state): State<CommandsState>,
    Path(device_id): Path<String>,
    Json(req): Json<PostCommandRequest>,
) -> ApiResult<(StatusCode, Json<QueuedCommand>)> {
    let queued = state
        .commands
        .post(&device_id, &req.command, req.payload, state.clock.now())
        .await?;
    tracing::info!(
        operator = %operator.claims.sub,
        device_id = %device_id,
        command = %req.command,
        "Ad hoc command queued"
    );
    Ok((StatusCode::ACCEPTED, Json(queued)))
}
