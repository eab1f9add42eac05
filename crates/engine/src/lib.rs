//! The recommendation engine boundary.
//!
//! The ML worker pool lives outside the serving plane; this crate defines
//! the request/response contract, an HTTP client for production, and a
//! canned engine for tests and dev mode. The engine is stateless from the
//! caller's perspective.

mod http;
mod static_engine;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tunetrail_core::{ModelTier, RecommendKind, TrackId, UserId};

pub use http::HttpEngine;
pub use static_engine::StaticEngine;

/// A typed request submitted to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    pub kind: RecommendKind,
    pub user_id: UserId,
    pub seed: Option<TrackId>,
    pub limit: usize,
    pub model_tier: ModelTier,
}

/// One scored track returned by the engine, pre-ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTrack {
    pub track_id: TrackId,
    pub score: f64,
    pub reason: Option<String>,
}

/// The engine's answer: scored tracks plus model identity for impressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub tracks: Vec<EngineTrack>,
    pub model_type: String,
    pub model_version: String,
}

/// Errors from the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The deadline elapsed before the engine answered.
    #[error("engine call timed out")]
    Timeout,

    /// Transport-level failure reaching the engine.
    #[error("engine transport error: {0}")]
    Transport(String),

    /// The engine answered with a non-success status.
    #[error("engine returned status {0}")]
    Status(u16),

    /// The engine's answer could not be decoded.
    #[error("engine response decode error: {0}")]
    Decode(String),
}

/// The recommendation worker pool, viewed from the dispatcher.
///
/// Implementations must be `Send + Sync`, deadline-aware, and cancellable
/// (dropping the future must abandon the call).
#[async_trait]
pub trait RecommendationEngine: Send + Sync {
    /// Submit a request with a bounded deadline.
    async fn recommend(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> Result<EngineResponse, EngineError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<(), EngineError>;
}
