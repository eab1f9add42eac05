use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use tunetrail_core::{ErrorKind, TrackId, plan::buckets, principal::scopes};
use tunetrail_gateway::ResourceDescriptor;

use crate::auth::Verified;
use crate::error::ServerError;

use super::{AppState, require_scope};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub track_id: TrackId,
}

/// `POST /api/v1/audio/analyze` -- enqueue an audio analysis job.
///
/// The DSP itself runs outside this plane; here the request is metered
/// against the daily bucket and handed a job id. The bucket is flagged
/// sensitive: premium callers fail closed on a cache outage.
pub async fn analyze(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::AUDIO_ANALYZE)?;

    let descriptor = ResourceDescriptor {
        operation: "audio_analyze",
        quota_bucket: Some(buckets::AUDIO_ANALYSIS),
        sensitive: true,
        ..ResourceDescriptor::default()
    };
    state
        .gateway
        .gate
        .check(&verified.principal, &descriptor)
        .await?;

    if state
        .gateway
        .repo
        .track_by_id(&request.track_id)
        .await
        .map_err(tunetrail_gateway::GatewayError::from)?
        .is_none()
    {
        return Err(ServerError::api(ErrorKind::NotFound, "unknown track"));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "job_id": state.gateway.ids.mint(),
            "track_id": request.track_id,
            "status": "queued",
        })),
    ))
}
