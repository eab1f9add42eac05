use thiserror::Error;

/// Errors surfaced by cache store backends.
#[derive(Debug, Error)]
pub enum StateError {
    /// Failed to connect to or pool connections for the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored value could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
