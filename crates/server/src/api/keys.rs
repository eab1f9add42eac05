use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use tunetrail_core::{ApiKeyId, plan::features, principal::scopes};
use tunetrail_gateway::{IssueKeyRequest, ResourceDescriptor};

use crate::auth::Verified;
use crate::error::ServerError;

use super::{AppState, require_scope};

/// `POST /api/v1/api-keys` -- mint a key. The secret appears in this
/// response and never again.
pub async fn create(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Json(request): Json<IssueKeyRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::KEYS_MANAGE)?;
    let issued = state
        .gateway
        .api_keys
        .issue(&verified.principal, request)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// `GET /api/v1/api-keys` -- list the caller's keys, redacted.
pub async fn list(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::KEYS_MANAGE)?;
    let keys = state.gateway.api_keys.list(&verified.principal).await?;
    Ok(Json(serde_json::json!({ "keys": keys })))
}

/// `POST /api/v1/api-keys/{id}/rotate` -- mint a replacement and put the
/// old key on the revocation timer.
pub async fn rotate(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::KEYS_MANAGE)?;
    let rotated = state
        .gateway
        .api_keys
        .rotate(&verified.principal, &ApiKeyId::new(id))
        .await?;
    Ok(Json(rotated))
}

/// `POST /api/v1/api-keys/{id}/revoke` -- revoke immediately.
pub async fn revoke(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::KEYS_MANAGE)?;
    let revoked = state
        .gateway
        .api_keys
        .revoke(&verified.principal, &ApiKeyId::new(id))
        .await?;
    Ok(Json(revoked))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    /// Aggregation window in days (1..=90).
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    30
}

/// `GET /api/v1/api-keys/{id}/usage` -- usage analytics, plan-gated.
pub async fn usage(
    State(state): State<AppState>,
    axum::Extension(verified): axum::Extension<Verified>,
    Path(id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&verified, scopes::USAGE_READ)?;

    let descriptor = ResourceDescriptor {
        operation: "api_key_usage_analytics",
        feature: Some(features::API_USAGE_ANALYTICS),
        ..ResourceDescriptor::default()
    };
    state
        .gateway
        .gate
        .check(&verified.principal, &descriptor)
        .await?;

    let report = state
        .gateway
        .api_keys
        .usage(&verified.principal, &ApiKeyId::new(id), query.window_days)
        .await?;
    Ok(Json(report))
}
