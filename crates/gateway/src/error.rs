use thiserror::Error;

use tunetrail_core::{ApiError, ErrorKind};

/// Errors that can occur during serving-plane operations.
///
/// Domain denials (gate denials, validation failures, stale events) travel
/// as [`GatewayError::Api`] and carry the stable client-visible kind.
/// Infrastructure variants are mapped to an opaque `INTERNAL` by the HTTP
/// layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An error occurred in the cache store.
    #[error("state error: {0}")]
    State(#[from] tunetrail_state::StateError),

    /// An error occurred in the repository.
    #[error("repository error: {0}")]
    Repo(#[from] tunetrail_repo::RepoError),

    /// An error from the recommendation engine boundary.
    #[error("engine error: {0}")]
    Engine(#[from] tunetrail_engine::EngineError),

    /// A client-visible error with a stable kind.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The gateway was misconfigured (e.g. missing required components).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Shorthand for a client-visible error.
    #[must_use]
    pub fn api(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Api(ApiError::new(kind, message))
    }

    /// The client-visible kind, when this error carries one.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Api(e) => Some(e.kind),
            _ => None,
        }
    }
}
