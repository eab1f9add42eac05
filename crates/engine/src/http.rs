use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{EngineError, EngineRequest, EngineResponse, RecommendationEngine};

/// HTTP client for the internal recommendation worker pool.
///
/// Speaks JSON to `POST {base_url}/recommend` and `GET {base_url}/healthz`.
/// The per-call deadline is applied as a request timeout, so cancelling the
/// returned future abandons the in-flight call.
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    tracks: Vec<WireTrack>,
    model_type: String,
    model_version: String,
}

#[derive(Debug, Deserialize)]
struct WireTrack {
    track_id: String,
    score: f64,
    reason: Option<String>,
}

impl HttpEngine {
    /// Create a client for the engine at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] if the underlying client cannot
    /// be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl RecommendationEngine for HttpEngine {
    async fn recommend(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> Result<EngineResponse, EngineError> {
        let url = format!("{}/recommend", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status(status.as_u16()));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        Ok(EngineResponse {
            tracks: wire
                .tracks
                .into_iter()
                .map(|t| crate::EngineTrack {
                    track_id: t.track_id.into(),
                    score: t.score,
                    reason: t.reason,
                })
                .collect(),
            model_type: wire.model_type,
            model_version: wire.model_version,
        })
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Status(response.status().as_u16()))
        }
    }
}
