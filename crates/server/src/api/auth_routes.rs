use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;

use tunetrail_core::ApiError;

use crate::auth::{LoginRequest, RegisterRequest, Verified};
use crate::error::ServerError;

use super::AppState;

/// `POST /api/v1/auth/register` -- create an organization and its first
/// user, returning a session token.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.auth.register(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `POST /api/v1/auth/login` -- verify a password and issue a session
/// token.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.auth.login(request).await?;
    Ok(Json(session))
}

/// `POST /api/v1/auth/logout` -- revoke the presented session token.
pub async fn logout(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<impl IntoResponse, ServerError> {
    let token = super::raw_bearer(&request)
        .ok_or_else(|| ServerError::Api(ApiError::validation("missing bearer token")))?;
    state.auth.logout(&token).await?;
    Ok(Json(serde_json::json!({ "status": "logged_out" })))
}

/// `GET /api/v1/auth/me` -- echo the verified principal.
pub async fn me(
    axum::Extension(verified): axum::Extension<Verified>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(serde_json::json!({
        "user_id": verified.principal.user_id,
        "org_id": verified.principal.org_id,
        "plan": verified.principal.plan,
        "scopes": verified.principal.scopes,
        "auth_method": verified.principal.auth_method,
        "key_id": verified.principal.key_id,
    })))
}
