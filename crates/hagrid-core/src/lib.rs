//! hagrid-core — primitives shared by every stage of a scheduling run.
//!
//! # Components
//!
//! - **`score`** — Saturating score arithmetic with `±INFINITY` sentinels
//! - **`role`** — Resource roles and their ordering
//! - **`config`** — Cluster-wide options (TOML)
//! - **`task`** — Action task names
//! - **`diagnostics`** — Per-run record of configuration errors, inconsistencies, rollbacks

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod role;
pub mod score;
pub mod task;

pub use config::{ClusterOptions, NoQuorumPolicy};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use error::{CoreError, CoreResult};
pub use role::Role;
pub use score::{
    INFINITY, MINUS_INFINITY, SCORE_INFINITY, Score, ScoreError, add_scores, parse_score,
    readable_score, scale_score,
};
pub use task::Task;
