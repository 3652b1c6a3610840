//! hagrid-scheduler — turns placement decisions into an ordered set of actions.
//!
//! A [`SchedulerRun`] loads a cluster snapshot, runs placement (from
//! `hagrid-placement`) and then:
//!
//! - Creates the stop/demote/start/promote/monitor actions that move every
//!   resource from its current role to its next role
//! - Decides which actions are required and which can run at all
//! - Schedules fencing of unclean nodes and the actions fencing implies
//! - Binds resource-level orderings to actions and propagates flags
//!
//! # Architecture
//!
//! ```text
//! SchedulerRun
//!   └── RunContext (one per run)
//!       ├── ClusterState     (hagrid-state)
//!       ├── ConstraintStore  (hagrid-placement)
//!       ├── Diagnostics      (hagrid-core)
//!       └── ActionTable      (actions + action orderings)
//! ```

pub mod action;
pub mod context;
pub mod error;
pub mod fencing;
pub mod operation;
pub mod ordering;
pub mod rsc_actions;
pub mod run;

pub use action::{Action, ActionFlags, ActionIdx, ActionKey, ActionOrdering, ActionTable};
pub use context::RunContext;
pub use error::{SchedulerError, SchedulerResult};
pub use fencing::{device_digests, priority_fencing_delay};
pub use operation::OnFail;
pub use run::{ActionSummary, OrderingSummary, Placement, SchedulerRun, Transition};
