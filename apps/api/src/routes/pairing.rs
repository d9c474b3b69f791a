//! Pairing REST route handlers
//!
//! Operators issue codes; devices claim them by typing or scanning the code.
//!
//! - `POST /pairing/bundles` - Issue a bundle code (operator)
//! - `POST /pairing/bundles/:code/claim` - Claim the vr or chair slot (device)
//! - `POST /pairing/codes` - Issue a single-device code (operator)
//! - `POST /pairing/codes/:code/claim` - Claim a single-device code (device)
//! - `POST /pairing/pairs/:pair_id/deactivate` - End a binding (operator)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::middleware::OperatorUser;
use crate::models::{BundleState, Device, DeviceKind, DevicePair, IssuedCode};
use crate::services::PairingService;

#[derive(Clone)]
pub struct PairingState {
    pub pairing: Arc<PairingService>,
}

pub fn pairing_router(state: PairingState) -> Router {
    Router::new()
        .route("/bundles", post(issue_bundle))
        .route("/bundles/:code/claim", post(claim_bundle))
        .route("/codes", post(issue_code))
        .route("/codes/:code/claim", post(claim_code))
        .route("/pairs/:pair_id/deactivate", post(deactivate_pair))
        .with_state(state)
}

// ========== Request Types ==========

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueBundleRequest {
    /// Rebind this existing pair instead of creating a new one
    #[serde(default)]
    pub target_pair_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBundleRequest {
    pub device_id: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Deserialize)]
pub struct IssueCodeRequest {
    pub kind: DeviceKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCodeRequest {
    pub hardware_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ========== Handlers ==========

async fn issue_bundle(
    operator: OperatorUser,
    State(state): State<PairingState>,
    body: Option<Json<IssueBundleRequest>>,
) -> ApiResult<(StatusCode, Json<IssuedCode>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let issued = state.pairing.issue_bundle(req.target_pair_id).await?;
    tracing::debug!(operator = %operator.claims.sub, code = %issued.code, "Bundle issued");
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn claim_bundle(
    State(state): State<PairingState>,
    Path(code): Path<String>,
    Json(req): Json<ClaimBundleRequest>,
) -> ApiResult<Json<BundleState>> {
    let bundle = state.pairing.claim(&code, &req.device_id, req.kind).await?;
    Ok(Json(bundle))
}

async fn issue_code(
    _operator: OperatorUser,
    State(state): State<PairingState>,
    Json(req): Json<IssueCodeRequest>,
) -> ApiResult<(StatusCode, Json<IssuedCode>)> {
    let issued = state.pairing.issue_code(req.kind).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn claim_code(
    State(state): State<PairingState>,
    Path(code): Path<String>,
    Json(req): Json<ClaimCodeRequest>,
) -> ApiResult<Json<Device>> {
    let device = state
        .pairing
        .claim_code(&code, &req.hardware_id, req.metadata)
        .await?;
    Ok(Json(device))
}

async fn deactivate_pair(
    _operator: OperatorUser,
    State(state): State<PairingState>,
    Path(pair_id): Path<Uuid>,
) -> ApiResult<Json<DevicePair>> {
    let pair = state.pairing.deactivate_pair(pair_id).await?;
    Ok(Json(pair))
}
