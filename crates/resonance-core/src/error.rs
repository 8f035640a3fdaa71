//! Error types for the resonance pipeline.

use thiserror::Error;

/// Result type alias using resonance's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Job queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Provider call failed in a way that is worth retrying
    /// (timeout, rate limit, network blip).
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Provider call failed permanently (auth, bad request).
    #[error("Provider error: {0}")]
    Provider(String),

    /// AI output could not be parsed, even after repair.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure should be retried by the worker with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientProvider(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
