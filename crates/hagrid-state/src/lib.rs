//! hagrid-state — the materialized cluster snapshot a scheduling run reads.
//!
//! Provides the node and resource arenas, per-resource node-weight tables,
//! recorded operation history, and the JSON snapshot format they are
//! built from.
//!
//! # Architecture
//!
//! Nodes and resources are stored in `Vec` arenas inside `ClusterState`
//! and addressed by `NodeIdx` / `RscIdx`. Resource trees (groups, clones,
//! bundles) are parent/child index links. Every map that influences a
//! scheduling decision is ordered, so identical snapshots produce
//! identical runs.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod weights;

pub use error::{StateError, StateResult};
pub use snapshot::{
    ClusterSnapshot, ColocationSpec, ConstraintsSpec, HistoryEntry, LocationSpec, NodeSpec,
    OpSpec, ResourceSetSpec, ResourceSpec, StatusSpec, parse_duration_ms,
};
pub use store::ClusterState;
pub use types::*;
pub use weights::{NodeWeight, NodeWeights};
