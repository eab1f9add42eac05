use thiserror::Error;

/// Errors surfaced by repository backends.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Failed to connect to or pool connections for the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A uniqueness constraint was violated (email, slug, username).
    #[error("conflict: {0}")]
    Conflict(String),
}
