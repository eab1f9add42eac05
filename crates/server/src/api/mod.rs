pub mod audio;
pub mod auth_routes;
pub mod health;
pub mod interactions;
pub mod keys;
pub mod recommend;
pub mod sessions;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::routing::{get, post, put};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use tunetrail_core::ErrorKind;
use tunetrail_gateway::{Gateway, UsageEvent};

use crate::auth::middleware::AuthLayer;
use crate::auth::{AuthService, Verified};
use crate::error::ServerError;
use crate::ratelimit::RateLimitLayer;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The assembled serving plane.
    pub gateway: Arc<Gateway>,
    /// Credential verification and account endpoints.
    pub auth: Arc<AuthService>,
    /// Producer side of the key-usage channel.
    pub usage_tx: mpsc::Sender<UsageEvent>,
    /// Allowed CORS origins; empty means permissive.
    pub cors_origins: Vec<String>,
    /// Deployment edition surfaced on the health endpoint.
    pub edition: String,
}

/// Build the Axum router with all API routes and middleware.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        // Health & metrics (always public)
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        // Account entry points (must be public)
        .route("/api/v1/auth/register", post(auth_routes::register))
        .route("/api/v1/auth/login", post(auth_routes::login));

    let protected = Router::new()
        // Account
        .route("/api/v1/auth/logout", post(auth_routes::logout))
        .route("/api/v1/auth/me", get(auth_routes::me))
        // API keys
        .route("/api/v1/api-keys", post(keys::create).get(keys::list))
        .route("/api/v1/api-keys/{id}/rotate", post(keys::rotate))
        .route("/api/v1/api-keys/{id}/revoke", post(keys::revoke))
        .route("/api/v1/api-keys/{id}/usage", get(keys::usage))
        // Recommendations
        .route("/api/v1/recommendations", get(recommend::personal))
        .route(
            "/api/v1/recommendations/similar/{track_id}",
            get(recommend::similar),
        )
        .route("/api/v1/ml/daily-mix", get(recommend::daily_mix))
        .route("/api/v1/ml/radio", post(recommend::radio))
        .route("/api/v1/ml/taste-profile", get(recommend::taste_profile))
        .route(
            "/api/v1/ml/recommendations/feedback",
            post(recommend::feedback),
        )
        // Audio analysis (metered)
        .route("/api/v1/audio/analyze", post(audio::analyze))
        // Sessions
        .route("/api/v1/sessions/start", post(sessions::start))
        .route("/api/v1/sessions/{id}/heartbeat", put(sessions::heartbeat))
        .route("/api/v1/sessions/{id}/end", post(sessions::end))
        // Interactions & telemetry
        .route("/api/v1/interactions", post(interactions::ingest))
        .route("/api/v1/interactions/batch", post(interactions::ingest_batch))
        .route(
            "/api/v1/impressions/recommendations",
            post(interactions::record_impressions),
        )
        .route("/api/v1/telemetry/search", post(interactions::search))
        .route(
            "/api/v1/telemetry/content-views",
            post(interactions::content_view),
        )
        .route(
            "/api/v1/telemetry/player-events",
            post(interactions::player_event),
        )
        // Rate limiting runs after auth (so the principal is available)
        .layer(RateLimitLayer::new(
            Arc::clone(&state.gateway),
            state.usage_tx.clone(),
        ))
        .layer(AuthLayer::new(Arc::clone(&state.auth)));

    let cors = if state.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Reject callers missing a required scope.
pub(crate) fn require_scope(verified: &Verified, scope: &str) -> Result<(), ServerError> {
    if verified.principal.has_scope(scope) {
        Ok(())
    } else {
        Err(ServerError::api(
            ErrorKind::ScopeInsufficient,
            format!("operation requires scope '{scope}'"),
        ))
    }
}

/// Client-specified request budget from the `x-timeout-ms` header, if any.
pub(crate) fn client_deadline(req_headers: &axum::http::HeaderMap) -> Option<Duration> {
    req_headers
        .get("x-timeout-ms")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Raw bearer credential, for logout.
pub(crate) fn raw_bearer(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_owned)
}
