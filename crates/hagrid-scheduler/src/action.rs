//! Actions and the per-run action table.
//!
//! Every action is identified by an [`ActionKey`]. Asking for the same
//! key twice returns the same action, so independent phases that need
//! "the stop of R on N" all share one object. Once an action is required
//! it never becomes optional again within the run.
//!
//! Runnability of a resource action is decided when it is requested:
//!
//! - unassigned actions never run;
//! - actions on offline or pending nodes never run (an unrunnable stop of
//!   a managed resource fences the node);
//! - actions that need quorum follow the effective no-quorum policy.

use std::collections::{BTreeMap, HashMap};

use hagrid_core::{NoQuorumPolicy, Role, Task};
use hagrid_placement::OrderKind;
use hagrid_state::{ClusterState, NodeIdx, Requirement, RscIdx};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::RunContext;
use crate::operation::{self, OnFail, OpDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionIdx(pub usize);

/// Identity of an action within one run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    pub task: Task,
    pub resource: Option<RscIdx>,
    pub node: Option<NodeIdx>,
    /// Nonzero only for recurring operations.
    pub interval_ms: u64,
}

impl ActionKey {
    pub fn new(task: Task, resource: Option<RscIdx>, node: Option<NodeIdx>) -> Self {
        Self {
            task,
            resource,
            node,
            interval_ms: 0,
        }
    }

    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionFlags {
    pub optional: bool,
    pub runnable: bool,
    /// Nothing is executed; the action only synchronizes others.
    pub pseudo: bool,
    /// Can be performed by the designated controller on the node's behalf.
    pub on_dc: bool,
    /// Node-specific operation attributes have been evaluated.
    pub attrs_evaluated: bool,
    /// A stop or demote that fencing its node accomplishes.
    pub implied_by_fencing: bool,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionIdx,
    pub key: ActionKey,
    pub flags: ActionFlags,
    pub needs: Requirement,
    pub on_fail: OnFail,
    pub fail_role: Role,
    pub reason: Option<String>,
    /// Normalized operation attributes and action parameters.
    pub meta: BTreeMap<String, String>,
}

impl Action {
    pub fn task(&self) -> &Task {
        &self.key.task
    }

    pub fn rsc(&self) -> Option<RscIdx> {
        self.key.resource
    }

    pub fn node(&self) -> Option<NodeIdx> {
        self.key.node
    }

    pub fn is_required(&self) -> bool {
        !self.flags.optional
    }

    /// Record why the action is (or is not) happening.
    pub fn set_reason(&mut self, reason: &str, overwrite: bool) {
        if overwrite || self.reason.is_none() {
            self.reason = Some(reason.to_string());
        }
    }
}

/// Ordering between two concrete actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOrdering {
    pub first: ActionIdx,
    pub then: ActionIdx,
    pub kind: OrderKind,
}

#[derive(Debug, Default)]
pub struct ActionTable {
    actions: Vec<Action>,
    index: HashMap<ActionKey, ActionIdx>,
    orderings: Vec<ActionOrdering>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, idx: ActionIdx) -> &Action {
        &self.actions[idx.0]
    }

    pub fn get_mut(&mut self, idx: ActionIdx) -> &mut Action {
        &mut self.actions[idx.0]
    }

    pub fn find(&self, key: &ActionKey) -> Option<ActionIdx> {
        self.index.get(key).copied()
    }

    /// Non-recurring actions of `rsc` performing `task`, on any node.
    pub fn find_all(&self, rsc: RscIdx, task: &Task) -> Vec<ActionIdx> {
        self.actions
            .iter()
            .filter(|a| a.key.resource == Some(rsc) && &a.key.task == task && a.key.interval_ms == 0)
            .map(|a| a.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Order `first` before `then`. Returns whether the ordering is new.
    pub fn order(&mut self, first: ActionIdx, then: ActionIdx, kind: OrderKind) -> bool {
        if first == then {
            return false;
        }
        let ordering = ActionOrdering { first, then, kind };
        if self.orderings.contains(&ordering) {
            return false;
        }
        self.orderings.push(ordering);
        true
    }

    pub fn orderings(&self) -> &[ActionOrdering] {
        &self.orderings
    }

    fn insert(&mut self, key: ActionKey, flags: ActionFlags, details: OpDetails) -> ActionIdx {
        let id = ActionIdx(self.actions.len());
        self.index.insert(key.clone(), id);
        self.actions.push(Action {
            id,
            key,
            flags,
            needs: details.needs,
            on_fail: details.on_fail,
            fail_role: details.fail_role,
            reason: None,
            meta: details.meta,
        });
        id
    }
}

/// Stable textual identity of an action, e.g. `db_monitor_10000`.
pub fn action_uuid(state: &ClusterState, action: &Action) -> String {
    match (&action.key.task, action.rsc()) {
        (Task::Fence(op), _) => {
            let node = action.node().map_or("", |n| state.node(n).name.as_str());
            format!("stonith-{node}-{op}")
        }
        (task, Some(rsc)) => format!(
            "{}_{}_{}",
            state.resource(rsc).id,
            task.name(),
            action.key.interval_ms
        ),
        (task, None) => task.name().to_string(),
    }
}

impl RunContext {
    /// Look up the action for `key`, creating it on first use.
    ///
    /// `optional = false` makes an existing optional action required.
    pub fn get_or_create_action(&mut self, key: ActionKey, optional: bool) -> ActionIdx {
        let idx = match self.actions.find(&key) {
            Some(idx) => idx,
            None => self.new_action(key, optional),
        };
        self.update_action_optional(idx, optional);

        let action = self.actions.get_mut(idx);
        if let Some(rsc) = action.rsc() {
            if action.node().is_some() {
                action.flags.attrs_evaluated = true;
            }
            self.update_action_runnable(idx);
            self.update_resource_flags(rsc, idx);
        }
        idx
    }

    pub fn rsc_action(
        &mut self,
        rsc: RscIdx,
        task: Task,
        node: Option<NodeIdx>,
        optional: bool,
    ) -> ActionIdx {
        self.get_or_create_action(ActionKey::new(task, Some(rsc), node), optional)
    }

    /// Cluster-wide pseudo-action named `name`.
    pub fn get_pseudo_op(&mut self, name: &str) -> ActionIdx {
        let key = ActionKey::new(Task::Pseudo(name.to_string()), None, None);
        if let Some(idx) = self.actions.find(&key) {
            return idx;
        }
        let idx = self.get_or_create_action(key, true);
        let flags = &mut self.actions.get_mut(idx).flags;
        flags.pseudo = true;
        flags.runnable = true;
        idx
    }

    /// Pseudo-action for a collective resource (`clone_start_0`, ...).
    pub fn new_rsc_pseudo_action(
        &mut self,
        rsc: RscIdx,
        task: Task,
        optional: bool,
        runnable: bool,
    ) -> ActionIdx {
        let idx = self.rsc_action(rsc, task, None, optional);
        let flags = &mut self.actions.get_mut(idx).flags;
        flags.pseudo = true;
        if runnable {
            flags.runnable = true;
        }
        idx
    }

    /// Required action clearing `rsc`'s recorded history on `node`.
    pub fn clear_resource_history(&mut self, rsc: RscIdx, node: NodeIdx) -> ActionIdx {
        self.rsc_action(rsc, Task::LrmDelete, Some(node), false)
    }

    pub fn action_uuid(&self, idx: ActionIdx) -> String {
        action_uuid(&self.state, self.actions.get(idx))
    }

    fn new_action(&mut self, key: ActionKey, optional: bool) -> ActionIdx {
        let flags = ActionFlags {
            optional,
            runnable: true,
            on_dc: key.task == Task::LrmDelete,
            ..ActionFlags::default()
        };
        let details = match key.resource {
            Some(rsc) => operation::unpack_operation(
                &self.state,
                &mut self.diags,
                rsc,
                &key.task,
                key.interval_ms,
            ),
            None => OpDetails::default(),
        };
        let idx = self.actions.insert(key, flags, details);
        trace!(
            action = %self.action_uuid(idx),
            optional,
            "created action"
        );
        idx
    }

    fn update_action_optional(&mut self, idx: ActionIdx, optional: bool) {
        let action = self.actions.get(idx);
        let unmanaged = match (action.rsc(), action.node()) {
            (Some(rsc), Some(_)) if !action.flags.pseudo && action.key.interval_ms == 0 => {
                !self.state.resource(rsc).flags.managed
            }
            _ => false,
        };
        if unmanaged {
            debug!(action = %self.action_uuid(idx), "optional because the resource is unmanaged");
            self.actions.get_mut(idx).flags.optional = true;
        } else if !optional {
            self.actions.get_mut(idx).flags.optional = false;
        }
    }

    /// The no-quorum policy that applies to `rsc` right now.
    ///
    /// With quorum everything behaves as `ignore`. Under `demote`, a
    /// promotable instance is capped at the unpromoted role and keeps
    /// running; anything else is stopped.
    fn effective_quorum_policy(&mut self, rsc: RscIdx) -> NoQuorumPolicy {
        if self.state.have_quorum {
            return NoQuorumPolicy::Ignore;
        }
        let policy = self.state.options.no_quorum_policy;
        if policy != NoQuorumPolicy::Demote {
            return policy;
        }
        let r = self.state.resource_mut(rsc);
        match r.history.role {
            Role::Promoted | Role::Unpromoted => {
                if r.next_role > Role::Unpromoted {
                    debug!(rsc = %r.id, "no-quorum-policy=demote caps role at unpromoted");
                    r.next_role = Role::Unpromoted;
                }
                NoQuorumPolicy::Ignore
            }
            _ => NoQuorumPolicy::Stop,
        }
    }

    fn update_action_runnable(&mut self, idx: ActionIdx) {
        let action = self.actions.get(idx);
        if action.flags.pseudo {
            return;
        }
        let Some(rsc) = action.rsc() else {
            return;
        };
        let (task, on_dc, needs) = (action.key.task.clone(), action.flags.on_dc, action.needs);
        let uuid = self.action_uuid(idx);

        let Some(node) = action.node() else {
            trace!(action = %uuid, "unrunnable (unassigned)");
            self.actions.get_mut(idx).flags.runnable = false;
            return;
        };

        let n = self.state.node(node);
        let (name, online, pending, unclean) = (n.name.clone(), n.online, n.pending, n.unclean);
        let offline = !online && (!n.is_guest() || n.remote_requires_reset);

        if !on_dc && offline {
            self.actions.get_mut(idx).flags.runnable = false;
            warn!(action = %uuid, node = %name, "unrunnable (node is offline)");
            if self.state.resource(rsc).flags.managed && task == Task::Stop && !unclean {
                self.fence_node(node, "stop is unrunnable", true);
            }
        } else if !on_dc && pending {
            self.actions.get_mut(idx).flags.runnable = false;
            warn!(action = %uuid, node = %name, "unrunnable (node is pending)");
        } else if needs == Requirement::Nothing {
            let runnable = !(self.state.node(node).is_guest() && !self.state.can_fence(node));
            if !runnable {
                debug!(action = %uuid, node = %name, "unrunnable (node's host cannot be fenced)");
            }
            self.actions.get_mut(idx).flags.runnable = runnable;
        } else {
            match self.effective_quorum_policy(rsc) {
                NoQuorumPolicy::Stop => {
                    debug!(action = %uuid, node = %name, "unrunnable (no quorum)");
                    let action = self.actions.get_mut(idx);
                    action.flags.runnable = false;
                    action.set_reason("no quorum", true);
                }
                NoQuorumPolicy::Freeze => {
                    let r = self.state.resource(rsc);
                    if !r.is_active() || r.next_role > r.history.role {
                        debug!(action = %uuid, node = %name, "unrunnable (quorum freeze)");
                        let action = self.actions.get_mut(idx);
                        action.flags.runnable = false;
                        action.set_reason("quorum freeze", true);
                    }
                }
                _ => self.actions.get_mut(idx).flags.runnable = true,
            }
        }
    }

    fn update_resource_flags(&mut self, rsc: RscIdx, idx: ActionIdx) {
        let action = self.actions.get(idx);
        let runnable = action.flags.runnable;
        match action.key.task {
            Task::Stop => self.state.resource_mut(rsc).stopping = true,
            Task::Start => self.state.resource_mut(rsc).starting = runnable,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hagrid_core::ClusterOptions;
    use hagrid_state::{Node, Resource, RscVariant};

    fn make_ctx(options: ClusterOptions) -> (RunContext, RscIdx, NodeIdx, NodeIdx) {
        let mut state = ClusterState::new(options);
        let n1 = state.add_node(Node::new("n1")).unwrap();
        let n2 = state.add_node(Node::new("n2")).unwrap();
        let mut rsc = Resource::new("ip", RscVariant::Primitive);
        rsc.requires = Requirement::Quorum;
        let rsc = state.add_resource(rsc, None).unwrap();
        (RunContext::new(state), rsc, n1, n2)
    }

    #[test]
    fn same_key_returns_same_action() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        let a = ctx.rsc_action(rsc, Task::Start, Some(n1), true);
        let b = ctx.rsc_action(rsc, Task::Start, Some(n1), true);
        assert_eq!(a, b);
        assert_eq!(ctx.actions.len(), 1);
        assert!(ctx.actions.get(a).flags.optional);
    }

    #[test]
    fn required_is_sticky() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        let a = ctx.rsc_action(rsc, Task::Start, Some(n1), false);
        ctx.rsc_action(rsc, Task::Start, Some(n1), true);
        assert!(ctx.actions.get(a).is_required());
    }

    #[test]
    fn unassigned_action_is_unrunnable() {
        let (mut ctx, rsc, _, _) = make_ctx(ClusterOptions::default());
        let a = ctx.rsc_action(rsc, Task::Start, None, false);
        assert!(!ctx.actions.get(a).flags.runnable);
    }

    #[test]
    fn unrunnable_stop_on_offline_node_fences_it() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        ctx.state.node_mut(n1).online = false;
        let stop = ctx.rsc_action(rsc, Task::Stop, Some(n1), false);
        assert!(!ctx.actions.get(stop).flags.runnable);
        assert!(ctx.state.node(n1).unclean);
    }

    #[test]
    fn pending_node_blocks_actions() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        ctx.state.node_mut(n1).pending = true;
        let start = ctx.rsc_action(rsc, Task::Start, Some(n1), false);
        assert!(!ctx.actions.get(start).flags.runnable);
    }

    #[test]
    fn stop_policy_without_quorum_blocks_starts_not_stops() {
        let (mut ctx, rsc, n1, n2) = make_ctx(ClusterOptions::default());
        ctx.state.have_quorum = false;
        let start = ctx.rsc_action(rsc, Task::Start, Some(n1), false);
        let stop = ctx.rsc_action(rsc, Task::Stop, Some(n2), false);
        assert!(!ctx.actions.get(start).flags.runnable);
        assert_eq!(ctx.actions.get(start).reason.as_deref(), Some("no quorum"));
        assert!(ctx.actions.get(stop).flags.runnable);
    }

    #[test]
    fn freeze_allows_active_resources_to_stay() {
        let options = ClusterOptions {
            no_quorum_policy: NoQuorumPolicy::Freeze,
            ..ClusterOptions::default()
        };
        let (mut ctx, rsc, n1, n2) = make_ctx(options);
        ctx.state.have_quorum = false;
        {
            let r = ctx.state.resource_mut(rsc);
            r.history.running_on = vec![n1];
            r.history.role = Role::Started;
            r.next_role = Role::Started;
        }
        let start = ctx.rsc_action(rsc, Task::Start, Some(n2), false);
        assert!(ctx.actions.get(start).flags.runnable);

        ctx.state.resource_mut(rsc).history.running_on.clear();
        let start = ctx.rsc_action(rsc, Task::Start, Some(n1), false);
        assert!(!ctx.actions.get(start).flags.runnable);
    }

    #[test]
    fn demote_policy_caps_promoted_resources() {
        let options = ClusterOptions {
            no_quorum_policy: NoQuorumPolicy::Demote,
            ..ClusterOptions::default()
        };
        let (mut ctx, rsc, n1, _) = make_ctx(options);
        ctx.state.have_quorum = false;
        {
            let r = ctx.state.resource_mut(rsc);
            r.history.running_on = vec![n1];
            r.history.role = Role::Promoted;
            r.next_role = Role::Promoted;
        }
        let promote = ctx.rsc_action(rsc, Task::Promote, Some(n1), false);
        assert!(ctx.actions.get(promote).flags.runnable);
        assert_eq!(ctx.state.resource(rsc).next_role, Role::Unpromoted);
    }

    #[test]
    fn requires_nothing_ignores_quorum() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        ctx.state.resource_mut(rsc).requires = Requirement::Nothing;
        ctx.state.have_quorum = false;
        let start = ctx.rsc_action(rsc, Task::Start, Some(n1), false);
        assert!(ctx.actions.get(start).flags.runnable);
    }

    #[test]
    fn unmanaged_actions_stay_optional() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        ctx.state.resource_mut(rsc).flags.managed = false;
        let stop = ctx.rsc_action(rsc, Task::Stop, Some(n1), false);
        assert!(ctx.actions.get(stop).flags.optional);
    }

    #[test]
    fn pseudo_ops_are_singletons() {
        let (mut ctx, rsc, _, _) = make_ctx(ClusterOptions::default());
        let a = ctx.get_pseudo_op("all-stopped");
        let b = ctx.get_pseudo_op("all-stopped");
        assert_eq!(a, b);
        assert!(ctx.actions.get(a).flags.pseudo);
        assert!(ctx.actions.get(a).flags.runnable);

        let running = ctx.new_rsc_pseudo_action(rsc, Task::Running, true, false);
        assert!(ctx.actions.get(running).flags.pseudo);
        assert!(!ctx.actions.get(running).flags.runnable);
    }

    #[test]
    fn history_cleanup_runs_on_dc() {
        let (mut ctx, rsc, n1, _) = make_ctx(ClusterOptions::default());
        ctx.state.node_mut(n1).online = false;
        let delete = ctx.clear_resource_history(rsc, n1);
        let action = ctx.actions.get(delete);
        assert!(action.flags.on_dc);
        assert!(action.flags.runnable);
        assert!(action.is_required());
        assert_eq!(action.on_fail, OnFail::Ignore);
        assert_eq!(ctx.action_uuid(delete), "ip_lrm_delete_0");
    }

    #[test]
    fn ordering_is_deduplicated() {
        let mut table = ActionTable::new();
        assert!(table.order(ActionIdx(0), ActionIdx(1), OrderKind::Ordered));
        assert!(!table.order(ActionIdx(0), ActionIdx(1), OrderKind::Ordered));
        assert!(table.order(ActionIdx(0), ActionIdx(1), OrderKind::RunnableFirst));
        assert!(!table.order(ActionIdx(2), ActionIdx(2), OrderKind::Ordered));
        assert_eq!(table.orderings().len(), 2);
    }
}
