//! Error types for the trellis automation engine.

use thiserror::Error;

/// Result type alias using trellis's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for trellis operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Node repository operation failed
    #[error("Repository error: {0}")]
    Repository(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(uuid::Uuid),

    /// System node (well-known supertag or field) is missing
    #[error("System node not found: {0}")]
    SystemNodeNotFound(String),

    /// Query evaluation failed
    #[error("Evaluator error: {0}")]
    Evaluator(String),

    /// Automation definition or state could not be parsed
    #[error("Definition error: {0}")]
    Definition(String),

    /// Subscription not found
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(uuid::Uuid),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
