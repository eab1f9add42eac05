use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use super::AppState;

/// `GET /healthz` -- liveness probe with build and edition info.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "edition": state.edition,
    }))
}

/// `GET /metrics` -- JSON snapshot of the serving-plane counters.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.gateway.metrics.snapshot();
    Json(serde_json::json!({
        "gateway": snapshot,
        "impression_buffer": {
            "depth": state.gateway.impression_buffer.len(),
            "dropped": state.gateway.impression_buffer.dropped_count(),
        },
    }))
}
