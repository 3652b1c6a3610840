//! Error types for cluster state construction.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that make a snapshot unusable as a whole.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("duplicate resource id: {0}")]
    DuplicateResource(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid resource definition {id}: {reason}")]
    InvalidResource { id: String, reason: String },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] hagrid_core::CoreError),
}
