//! Placement error types.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Reasons a single constraint is rejected. The run itself continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("resource does not exist: {0}")]
    MissingResource(String),

    #[error("constraint has no resources")]
    EmptyConstraint,

    #[error("two templates or tags cannot be colocated")]
    ReferencesColocated,

    #[error("resource '{0}' is not a clone but an instance was requested")]
    NotAClone(String),

    #[error("resource '{rsc}' does not have an instance '{instance}'")]
    NoSuchInstance { rsc: String, instance: String },

    #[error("invalid role: {0}")]
    InvalidRole(String),
}
