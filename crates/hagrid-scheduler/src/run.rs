//! One scheduling run, from snapshot to transition.
//!
//! ```text
//! ClusterSnapshot
//!   └── SchedulerRun::new
//!       ├── unpack colocations
//!       ├── init allowed nodes, assign resources, choose roles
//!       ├── create resource actions
//!       ├── order unfencing, schedule fencing
//!       ├── bind orderings
//!       └── propagate flags  ──▶  Transition
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use hagrid_core::{ClusterOptions, Diagnostic, INFINITY, Role, readable_score};
use hagrid_placement::{OrderKind, assign_resources, init_allowed_nodes, unpack_colocations};
use hagrid_state::{ClusterSnapshot, ClusterState, ColocationSpec, LocationConstraint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::action_uuid;
use crate::context::RunContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::OnFail;

/// Where a resource ended up and in which role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub resource: String,
    pub node: Option<String>,
    pub role: Role,
    /// Final node weights, readable (`INFINITY`, `-INFINITY`, numbers).
    pub scores: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub id: usize,
    pub uuid: String,
    pub task: String,
    pub resource: Option<String>,
    pub node: Option<String>,
    pub optional: bool,
    pub runnable: bool,
    pub pseudo: bool,
    pub on_fail: OnFail,
    pub fail_role: Role,
    pub reason: Option<String>,
    pub meta: BTreeMap<String, String>,
}

impl ActionSummary {
    /// Whether the action would be executed (or synchronized on).
    pub fn is_scheduled(&self) -> bool {
        !self.optional && self.runnable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingSummary {
    pub first: usize,
    pub then: usize,
    pub kind: OrderKind,
}

/// Result of a scheduling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub placements: Vec<Placement>,
    pub actions: Vec<ActionSummary>,
    pub orderings: Vec<OrderingSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Transition {
    fn from_context(ctx: RunContext) -> Self {
        let state = &ctx.state;
        let placements = state
            .resources()
            .map(|(_, r)| Placement {
                resource: r.id.clone(),
                node: r.assigned_to.map(|n| state.node(n).name.clone()),
                role: r.next_role,
                scores: r
                    .allowed_nodes
                    .iter()
                    .map(|(node, w)| (state.node(*node).name.clone(), readable_score(w.weight)))
                    .collect(),
            })
            .collect();

        let actions = ctx
            .actions
            .iter()
            .map(|a| ActionSummary {
                id: a.id.0,
                uuid: action_uuid(state, a),
                task: a.task().to_string(),
                resource: a.rsc().map(|r| state.resource(r).id.clone()),
                node: a.node().map(|n| state.node(n).name.clone()),
                optional: a.flags.optional,
                runnable: a.flags.runnable,
                pseudo: a.flags.pseudo,
                on_fail: a.on_fail,
                fail_role: a.fail_role,
                reason: a.reason.clone(),
                meta: a.meta.clone(),
            })
            .collect();

        let orderings = ctx
            .actions
            .orderings()
            .iter()
            .map(|o| OrderingSummary {
                first: o.first.0,
                then: o.then.0,
                kind: o.kind,
            })
            .collect();

        Self {
            placements,
            actions,
            orderings,
            diagnostics: ctx.diags.into_entries(),
        }
    }

    pub fn placement(&self, rsc: &str) -> Option<&Placement> {
        self.placements.iter().find(|p| p.resource == rsc)
    }

    /// Action identified by `uuid`, on `node` when given.
    pub fn action(&self, uuid: &str, node: Option<&str>) -> Option<&ActionSummary> {
        self.actions
            .iter()
            .find(|a| a.uuid == uuid && (node.is_none() || a.node.as_deref() == node))
    }

    /// Actions that will actually be carried out.
    pub fn scheduled(&self) -> impl Iterator<Item = &ActionSummary> {
        self.actions.iter().filter(|a| a.is_scheduled())
    }

    /// Whether `first` is ordered before `then` (directly).
    pub fn is_ordered(&self, first: &ActionSummary, then: &ActionSummary) -> bool {
        self.orderings
            .iter()
            .any(|o| o.first == first.id && o.then == then.id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A scheduling run over one cluster snapshot.
#[derive(Debug)]
pub struct SchedulerRun {
    ctx: RunContext,
    colocations: Vec<ColocationSpec>,
}

impl SchedulerRun {
    pub fn new(snapshot: &ClusterSnapshot) -> SchedulerResult<Self> {
        let state = ClusterState::from_snapshot(snapshot)?;
        Ok(Self {
            ctx: RunContext::new(state),
            colocations: snapshot.constraints.colocations.clone(),
        })
    }

    /// Load a JSON snapshot, optionally overriding its options with a
    /// TOML options file.
    pub fn from_files(snapshot: &Path, options: Option<&Path>) -> SchedulerResult<Self> {
        let mut snapshot = ClusterSnapshot::from_file(snapshot)?;
        if let Some(path) = options {
            snapshot.options = ClusterOptions::from_file(path)?;
        }
        Self::new(&snapshot)
    }

    pub fn state(&self) -> &ClusterState {
        &self.ctx.state
    }

    /// Force `rsc` onto `node` with a mandatory location preference.
    pub fn pin(&mut self, rsc: &str, node: &str) -> SchedulerResult<()> {
        let state = &mut self.ctx.state;
        let rsc_idx = state
            .find_resource(rsc)
            .ok_or_else(|| SchedulerError::ResourceNotFound(rsc.to_string()))?;
        let node_idx = state
            .find_node(node)
            .ok_or_else(|| SchedulerError::NodeNotFound(node.to_string()))?;
        state.resource_mut(rsc_idx).locations.push(LocationConstraint {
            id: format!("pin-{rsc}"),
            node: node_idx,
            score: INFINITY,
            role: None,
        });
        debug!(rsc, node, "resource pinned");
        Ok(())
    }

    pub fn execute(self) -> Transition {
        let Self {
            mut ctx,
            colocations,
        } = self;
        info!(
            nodes = ctx.state.node_count(),
            resources = ctx.state.resource_count(),
            quorum = ctx.state.have_quorum,
            "scheduling run started"
        );

        unpack_colocations(&ctx.state, &mut ctx.store, &mut ctx.diags, &colocations);
        init_allowed_nodes(&mut ctx.state, &mut ctx.diags);
        assign_resources(&mut ctx.state, &mut ctx.store, &mut ctx.diags);
        ctx.create_resource_actions();
        ctx.order_starts_after_unfencing();
        ctx.schedule_fencing();
        ctx.bind_orderings();
        ctx.update_actions();

        let transition = Transition::from_context(ctx);
        info!(
            actions = transition.actions.len(),
            scheduled = transition.scheduled().count(),
            diagnostics = transition.diagnostics.len(),
            "scheduling run complete"
        );
        transition
    }
}
