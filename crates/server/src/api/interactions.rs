use std::collections::HashMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use tunetrail_core::{IngestEvent, SessionId, TrackId, principal::scopes};
use tunetrail_gateway::ImpressionReport;

use crate::auth::Verified;
use crate::error::ServerError;

use super::{AppState, require_scope};

/// `POST /api/v1/interactions` -- ingest one interaction event.
pub async fn ingest(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(event): Json<IngestEvent>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let interaction = state
        .gateway
        .ingestor
        .ingest(&verified.principal, event)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": interaction.id,
            "type": interaction.kind,
            "completion_override": interaction.completion_override,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<IngestEvent>,
}

/// `POST /api/v1/interactions/batch` -- ingest events in order, stopping
/// at the first hard error.
pub async fn ingest_batch(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let outcome = state
        .gateway
        .ingestor
        .ingest_batch(&verified.principal, request.events)
        .await?;

    // A partial batch is still a 200: the accepted count and the stopping
    // error are both in the body.
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ImpressionsRequest {
    pub impressions: Vec<ImpressionReport>,
}

/// `POST /api/v1/impressions/recommendations` -- client-side impression
/// reporting for list views rendered outside the dispatcher.
pub async fn record_impressions(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<ImpressionsRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let recorded = state
        .gateway
        .ingestor
        .record_impressions(&verified.principal, request.impressions)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "recorded": recorded })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchTelemetry {
    pub query: String,
    #[serde(default)]
    pub results_count: u32,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

/// `POST /api/v1/telemetry/search` -- append a search telemetry record.
pub async fn search(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(record): Json<SearchTelemetry>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let stored = state
        .gateway
        .ingestor
        .record_search(
            &verified.principal,
            record.query,
            record.results_count,
            record.extensions,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": stored.id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ContentViewTelemetry {
    pub content_type: String,
    pub content_id: String,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

/// `POST /api/v1/telemetry/content-views` -- append a content-view record.
pub async fn content_view(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(record): Json<ContentViewTelemetry>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let stored = state
        .gateway
        .ingestor
        .record_content_view(
            &verified.principal,
            record.content_type,
            record.content_id,
            record.extensions,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": stored.id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PlayerEventTelemetry {
    pub event: String,
    pub session_id: Option<SessionId>,
    pub track_id: Option<TrackId>,
    pub position_ms: Option<u64>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

/// `POST /api/v1/telemetry/player-events` -- append a low-level player
/// event record.
pub async fn player_event(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(record): Json<PlayerEventTelemetry>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let stored = state
        .gateway
        .ingestor
        .record_player_event(
            &verified.principal,
            record.event,
            record.session_id,
            record.track_id,
            record.position_ms,
            record.extensions,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": stored.id })),
    ))
}
