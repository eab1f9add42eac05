use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;

use tunetrail_core::{
    FeedbackSignal, ModelTier, Plan, RecommendKind, RecommendationId, TrackId,
    plan::{buckets, features},
    principal::scopes,
};
use tunetrail_gateway::ResourceDescriptor;

use crate::auth::Verified;
use crate::error::ServerError;

use super::{AppState, client_deadline, require_scope};

#[derive(Debug, Default, Deserialize)]
pub struct RecommendQuery {
    pub limit: Option<usize>,
    /// Requested model tier; capped by the plan's entitlement.
    pub model_tier: Option<ModelTier>,
}

/// What the gate demands for each recommendation kind. The plan floor
/// comes from the kind's own tier table.
fn descriptor_for(kind: RecommendKind) -> ResourceDescriptor {
    let required_plan = (kind.min_plan() > Plan::Free).then(|| kind.min_plan());
    let (operation, feature, sensitive) = match kind {
        RecommendKind::UserPersonal => ("recommendations", None, false),
        RecommendKind::SimilarToTrack => ("similar_tracks", None, false),
        RecommendKind::DailyMix => ("daily_mix", Some(features::DAILY_MIX), false),
        RecommendKind::RadioSeed => ("radio", Some(features::RADIO), false),
        RecommendKind::TasteProfile => ("taste_profile", Some(features::TASTE_PROFILE), true),
    };
    ResourceDescriptor {
        operation,
        required_plan,
        feature,
        quota_bucket: Some(buckets::RECOMMENDATIONS),
        sensitive,
    }
}

async fn serve(
    state: &AppState,
    verified: &Verified,
    headers: &HeaderMap,
    kind: RecommendKind,
    seed: Option<TrackId>,
    query: RecommendQuery,
) -> Result<axum::response::Response, ServerError> {
    require_scope(verified, scopes::RECOMMENDATIONS_READ)?;

    state
        .gateway
        .gate
        .check(&verified.principal, &descriptor_for(kind))
        .await?;

    let set = state
        .gateway
        .dispatcher
        .recommend(
            &verified.principal,
            kind,
            seed,
            query.limit,
            query.model_tier,
            client_deadline(headers),
        )
        .await?;
    Ok(Json(set).into_response())
}

/// `GET /api/v1/recommendations` -- personal recommendations (free+).
pub async fn personal(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    headers: HeaderMap,
    Query(query): Query<RecommendQuery>,
) -> Result<impl IntoResponse, ServerError> {
    serve(
        &state,
        &verified,
        &headers,
        RecommendKind::UserPersonal,
        None,
        query,
    )
    .await
}

/// `GET /api/v1/recommendations/similar/{track_id}` -- similar tracks
/// (free+).
pub async fn similar(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    headers: HeaderMap,
    Path(track_id): Path<String>,
    Query(query): Query<RecommendQuery>,
) -> Result<impl IntoResponse, ServerError> {
    serve(
        &state,
        &verified,
        &headers,
        RecommendKind::SimilarToTrack,
        Some(TrackId::new(track_id)),
        query,
    )
    .await
}

/// `GET /api/v1/ml/daily-mix` -- daily mix (starter+).
pub async fn daily_mix(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    headers: HeaderMap,
    Query(query): Query<RecommendQuery>,
) -> Result<impl IntoResponse, ServerError> {
    serve(
        &state,
        &verified,
        &headers,
        RecommendKind::DailyMix,
        None,
        query,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct RadioRequest {
    pub seed_track_id: TrackId,
    pub limit: Option<usize>,
    pub model_tier: Option<ModelTier>,
}

/// `POST /api/v1/ml/radio` -- radio from a seed track (starter+).
pub async fn radio(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    headers: HeaderMap,
    Json(request): Json<RadioRequest>,
) -> Result<impl IntoResponse, ServerError> {
    serve(
        &state,
        &verified,
        &headers,
        RecommendKind::RadioSeed,
        Some(request.seed_track_id),
        RecommendQuery {
            limit: request.limit,
            model_tier: request.model_tier,
        },
    )
    .await
}

/// `GET /api/v1/ml/taste-profile` -- taste profile (pro+).
pub async fn taste_profile(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    headers: HeaderMap,
    Query(query): Query<RecommendQuery>,
) -> Result<impl IntoResponse, ServerError> {
    serve(
        &state,
        &verified,
        &headers,
        RecommendKind::TasteProfile,
        None,
        query,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub recommendation_id: RecommendationId,
    pub signal: FeedbackSignal,
    pub reason: Option<String>,
}

/// `POST /api/v1/ml/recommendations/feedback` -- close the loop on a
/// served slot. Never blocks on ML-side processing.
pub async fn feedback(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::INTERACTIONS_WRITE)?;
    let ack = state
        .gateway
        .dispatcher
        .feedback(
            &verified.principal,
            request.recommendation_id,
            request.signal,
            request.reason,
        )
        .await?;
    Ok(Json(ack))
}
