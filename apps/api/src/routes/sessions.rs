//! Session REST route handlers
//!
//! - `POST /sessions` - Individual session for one pair (operator)
//! - `POST /sessions/group` - Group session from several pairs (operator)
//! - `GET /sessions/:id` - Session with participants (authenticated)
//! - `DELETE /sessions/:id` - Stop if live, then delete (operator)
//! - `POST /sessions/:id/commands/:command` - Session-wide command (operator)
//! - `POST /sessions/:id/participants/:pid/commands/:command` - One participant (operator)
//! - `POST /sessions/:id/participants/:pid/progress` - Progress report (device)
//! - `GET /sessions/:id/stats` - Drift rollup (authenticated)
//! - `GET /sessions/:id/logs` - Audit log (authenticated)
//!
//! Command endpoints answer with the resulting state; a rejected command's
//! error body carries the current state in `details`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::middleware::{AuthUser, OperatorUser};
use crate::models::{DeviceKind, SeatInfo, SessionCommand, SessionDetail, SessionLog, SessionParticipant};
use crate::repositories::{PaginatedResult, Pagination};
use crate::services::telemetry::{DriftSample, SyncStats};
use crate::services::{SessionOrchestrator, TelemetryService};

#[derive(Clone)]
pub struct SessionsState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub telemetry: Arc<TelemetryService>,
}

pub fn sessions_router(state: SessionsState) -> Router {
    Router::new()
        .route("/", post(create_individual))
        .route("/group", post(create_group))
        .route("/:session_id", get(get_session).delete(delete_session))
        .route("/:session_id/commands/:command", post(session_command))
        .route(
            "/:session_id/participants/:participant_id/commands/:command",
            post(participant_command),
        )
        .route(
            "/:session_id/participants/:participant_id/progress",
            post(report_progress),
        )
        .route("/:session_id/stats", get(session_stats))
        .route("/:session_id/logs", get(session_logs))
        .with_state(state)
}

// ========== Request Types ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub pair_id: Uuid,
    #[serde(default)]
    pub journey_ids: Vec<String>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub pair_ids: Vec<Uuid>,
    #[serde(default)]
    pub journey_ids: Vec<String>,
    /// Optional per-seat details, in `pair_ids` order
    #[serde(default)]
    pub seats: Vec<SeatInfo>,
}

/// Optional body of a command; only `seek` needs it
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub position_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub position_ms: i64,
    #[serde(default)]
    pub device_clock_ms: Option<i64>,
    pub side: DeviceKind,
}

// ========== Handlers ==========

async fn create_individual(
    operator: OperatorUser,
    State(state): State<SessionsState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionDetail>)> {
    let detail = state
        .orchestrator
        .create_individual(req.pair_id, req.journey_ids, req.auto_start)
        .await?;
    tracing::debug!(
        operator = %operator.claims.sub,
        session_id = %detail.session.id,
        "Session created over HTTP"
    );
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn create_group(
    _operator: OperatorUser,
    State(state): State<SessionsState>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<SessionDetail>)> {
    let detail = state
        .orchestrator
        .create_group_from_pairs(req.pair_ids, req.journey_ids, req.seats)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_session(
    _user: AuthUser,
    State(state): State<SessionsState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionDetail>> {
    Ok(Json(state.orchestrator.get_session(session_id).await?))
}

async fn delete_session(
    _operator: OperatorUser,
    State(state): State<SessionsState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_command(
    operator: OperatorUser,
    State(state): State<SessionsState>,
    Path((session_id, command)): Path<(Uuid, String)>,
    body: Option<Json<CommandRequest>>,
) -> ApiResult<Json<SessionDetail>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let command = SessionCommand::from_parts(&command, req.position_ms)?;
    tracing::debug!(
        operator = %operator.claims.sub,
        session_id = %session_id,
        command = %command,
        "Session command requested"
    );
    Ok(Json(state.orchestrator.command(session_id, command).await?))
}

async fn participant_command(
    _operator: OperatorUser,
    State(state): State<SessionsState>,
    Path((session_id, participant_id, command)): Path<(Uuid, Uuid, String)>,
    body: Option<Json<CommandRequest>>,
) -> ApiResult<Json<SessionParticipant>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let command = SessionCommand::from_parts(&command, req.position_ms)?;
    let participant = state
        .orchestrator
        .command_participant(session_id, participant_id, command)
        .await?;
    Ok(Json(participant))
}

async fn report_progress(
    State(state): State<SessionsState>,
    Path((session_id, participant_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ProgressRequest>,
) -> ApiResult<Json<DriftSample>> {
    let sample = state
        .telemetry
        .report_progress(
            session_id,
            participant_id,
            req.position_ms,
            req.device_clock_ms,
            req.side,
        )
        .await?;
    Ok(Json(sample))
}

async fn session_stats(
    _user: AuthUser,
    State(state): State<SessionsState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SyncStats>> {
    Ok(Json(state.telemetry.stats_for(session_id).await?))
}

async fn session_logs(
    _user: AuthUser,
    State(state): State<SessionsState>,
    Path(session_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<SessionLog>>> {
    Ok(Json(state.orchestrator.logs(session_id, page).await?))
}
