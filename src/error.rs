//! Error types for arbor.

use thiserror::Error;

/// Result type alias using arbor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tree-search orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Sandbox execution failed outside of the script itself
    /// (script errors are captured into the node's stderr instead).
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM API error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transcript acquisition error
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// Dataset loading error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// The client went away and the session was torn down.
    #[error("Session cancelled by client")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a sandbox error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create an LLM error.
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
