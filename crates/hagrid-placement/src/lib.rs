//! hagrid-placement — where resources run and which role they hold.
//!
//! This crate turns declared colocations into constraint records, applies
//! them to per-resource node-weight tables, assigns every resource to a
//! node and picks the promoted instances of promotable clones. It does
//! NOT create actions (that's `hagrid-scheduler`); it only records the
//! orderings that placement decisions imply.
//!
//! # Components
//!
//! - **`constraints`** — Colocation/ordering store and priority tie-breaks
//! - **`sets`** — Unpacking simple, instance, set and tag colocations
//! - **`colocation`** — Weight and priority application, recursive merge
//! - **`assign`** — Allowed-node initialisation and node assignment
//! - **`promotion`** — Promotion scores, sorting and role selection

pub mod assign;
pub mod colocation;
pub mod constraints;
pub mod error;
pub mod promotion;
pub mod sets;

pub use assign::{Assigner, assign_resources, init_allowed_nodes};
pub use colocation::{
    Affects, MergeOptions, NodeScoreMerger, apply_coloc_to_priority, apply_coloc_to_weights,
    colocation_affects, verify_colocations,
};
pub use constraints::{
    ColocIdx, Colocation, ConstraintStore, NewColocation, OrderKind, OrderingConstraint,
    cmp_dependent_priority, cmp_primary_priority, cmp_resources,
};
pub use error::{PlacementError, PlacementResult};
pub use promotion::{promote_instances, promotion_score};
pub use sets::{unpack_colocation, unpack_colocations};
