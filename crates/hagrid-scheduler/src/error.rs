//! Scheduler error types.

use thiserror::Error;

/// Errors that prevent a scheduling run from starting.
///
/// Problems inside a run never surface here; they are recorded as
/// diagnostics on the resulting transition.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("cluster state error: {0}")]
    State(#[from] hagrid_state::StateError),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
