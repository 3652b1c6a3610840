//! Per-run context.
//!
//! Everything one scheduling run reads or writes lives here and is
//! dropped with it. Phases are `impl RunContext` blocks spread over the
//! crate's modules and run strictly one after the other.

use hagrid_core::Diagnostics;
use hagrid_placement::ConstraintStore;
use hagrid_state::ClusterState;

use crate::action::ActionTable;

#[derive(Debug)]
pub struct RunContext {
    pub state: ClusterState,
    pub store: ConstraintStore,
    pub diags: Diagnostics,
    pub actions: ActionTable,
}

impl RunContext {
    pub fn new(state: ClusterState) -> Self {
        Self {
            state,
            store: ConstraintStore::new(),
            diags: Diagnostics::new(),
            actions: ActionTable::new(),
        }
    }
}
