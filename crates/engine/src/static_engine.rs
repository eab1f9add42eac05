use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{EngineError, EngineRequest, EngineResponse, EngineTrack, RecommendationEngine};

/// Canned engine for tests and dev mode.
///
/// Serves a fixed track list, optionally truncated to the request limit.
/// Failure and latency are injectable so dispatcher timeout and
/// stale-while-error behavior can be exercised.
pub struct StaticEngine {
    tracks: RwLock<Vec<EngineTrack>>,
    model_type: String,
    model_version: String,
    fail: AtomicBool,
    delay: RwLock<Option<Duration>>,
    calls: AtomicU64,
}

impl StaticEngine {
    /// Create an engine serving the given tracks.
    #[must_use]
    pub fn new(tracks: Vec<EngineTrack>) -> Self {
        Self {
            tracks: RwLock::new(tracks),
            model_type: "collaborative".to_owned(),
            model_version: "static-1".to_owned(),
            fail: AtomicBool::new(false),
            delay: RwLock::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// Replace the served track list.
    pub fn set_tracks(&self, tracks: Vec<EngineTrack>) {
        *self.tracks.write() = tracks;
    }

    /// Make subsequent calls fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Delay subsequent calls, for timeout tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// How many `recommend` calls reached the engine.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecommendationEngine for StaticEngine {
    async fn recommend(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> Result<EngineResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(EngineError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("static engine set to fail".into()));
        }

        let tracks: Vec<EngineTrack> = self
            .tracks
            .read()
            .iter()
            .take(request.limit)
            .cloned()
            .collect();

        Ok(EngineResponse {
            tracks,
            model_type: self.model_type.clone(),
            model_version: self.model_version.clone(),
        })
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("static engine set to fail".into()));
        }
        Ok(())
    }
}
