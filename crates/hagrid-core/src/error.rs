//! Error types shared by the HAGrid crates.

use thiserror::Error;

pub use crate::score::ScoreError;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("score error: {0}")]
    Score(#[from] ScoreError),
}
