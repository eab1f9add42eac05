use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use tunetrail_core::{DeviceId, DeviceType, SessionId, TrackId, principal::scopes};

use crate::auth::Verified;
use crate::error::ServerError;

use super::{AppState, require_scope};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// `POST /api/v1/sessions/start` -- open a listening session. An active
/// session on the same device is superseded.
pub async fn start(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::SESSIONS_WRITE)?;
    let session = state
        .gateway
        .sessions
        .start(
            &verified.principal,
            request.device_id,
            request.device_type,
            request.context,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    pub position_ms: Option<u64>,
    pub current_track_id: Option<TrackId>,
}

/// `PUT /api/v1/sessions/{id}/heartbeat` -- refresh liveness and persist
/// the last-known position.
pub async fn heartbeat(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::SESSIONS_WRITE)?;
    state
        .gateway
        .sessions
        .heartbeat(
            &verified.principal,
            &SessionId::new(id),
            request.position_ms,
            request.current_track_id,
        )
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `POST /api/v1/sessions/{id}/end` -- finalize a session. Idempotent.
pub async fn end(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::SESSIONS_WRITE)?;
    let session = state
        .gateway
        .sessions
        .end(&verified.principal, &SessionId::new(id))
        .await?;
    Ok(Json(session))
}
