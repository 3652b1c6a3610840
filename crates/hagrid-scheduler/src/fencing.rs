//! Fencing: fence actions, unfencing digests and fencing-implied actions.
//!
//! A node is fenced when it is unclean and the cluster is able to fence
//! it. Stops and demotes of resources on a fenced node are accomplished
//! by the fencing itself and become pseudo-actions ordered after it.
//! Guest nodes are fenced by recovering the resource that contains them.

use hagrid_core::Task;
use hagrid_placement::OrderKind;
use hagrid_state::{
    ATTR_DIGESTS_ALL, ATTR_DIGESTS_SECURE, ClusterState, Node, NodeIdx, Requirement, Resource,
    RscIdx, RscVariant,
};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, trace, warn};

use crate::action::{ActionIdx, ActionKey};
use crate::context::RunContext;

/// Meta key carrying the node's full device digest summary.
pub const META_DIGESTS_ALL: &str = "digests-all";
/// Meta key carrying the node's secure device digest summary.
pub const META_DIGESTS_SECURE: &str = "digests-secure";
pub const META_PRIORITY_FENCING_DELAY: &str = "priority-fencing-delay";

/// Delay in seconds to apply when fencing `node` after a split.
///
/// Only the side holding the highest node priority is delayed, so that it
/// wins a fencing race. No delay applies when the partition still holds a
/// majority or every member has the same priority.
pub fn priority_fencing_delay(state: &ClusterState, node: NodeIdx) -> u32 {
    let delay = state.options.priority_fencing_delay;
    let target = state.node(node);
    if delay == 0 || !target.is_cluster_member() || target.online {
        return 0;
    }

    let mut top = i32::MIN;
    let mut lowest = i32::MAX;
    for (_, n) in state.nodes().filter(|(_, n)| n.is_cluster_member()) {
        top = top.max(n.priority);
        lowest = lowest.min(n.priority);
    }

    let majority = state.online_member_count() > state.member_count() / 2;
    if majority || lowest == top || target.priority < top {
        return 0;
    }
    delay
}

/// Hex SHA-256 over the sorted `key=value` pairs.
fn digest_params<'a>(params: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// `(all, secure)` parameter digests of a fence device.
pub fn device_digests(rsc: &Resource) -> (String, String) {
    let all = digest_params(rsc.params.iter());
    let secure = digest_params(
        rsc.params
            .iter()
            .filter(|(key, _)| !rsc.private_params.contains(*key)),
    );
    (all, secure)
}

fn summary_entry(rsc: &Resource, digest: &str) -> String {
    let agent = rsc.agent.as_ref().map_or("", |a| a.kind.as_str());
    format!("{}:{agent}:{digest},", rsc.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestMatch {
    /// The node never recorded digests.
    Unknown,
    Match,
    Mismatch,
}

fn compare_device_digest(node: &Node, rsc: &Resource, all: &str, secure: &str) -> DigestMatch {
    let Some(summary_all) = node.attr(ATTR_DIGESTS_ALL) else {
        return DigestMatch::Unknown;
    };
    if summary_all.contains(&summary_entry(rsc, all)) {
        return DigestMatch::Match;
    }
    let secure_matches = node
        .attr(ATTR_DIGESTS_SECURE)
        .is_some_and(|s| s.contains(&summary_entry(rsc, secure)));
    if secure_matches {
        debug!(node = %node.name, device = %rsc.id, "only private parameters of device changed");
        return DigestMatch::Match;
    }
    DigestMatch::Mismatch
}

fn is_unfencing_device(rsc: &Resource) -> bool {
    rsc.variant == RscVariant::Primitive
        && rsc.flags.fence_device
        && (rsc.flags.needs_unfencing
            || rsc.meta.get("provides").is_some_and(|v| v == "unfencing"))
}

impl RunContext {
    /// Fence action for `node`, created on first use.
    ///
    /// `op` defaults to the configured fencing action. A required fence
    /// action is only possible on nodes the cluster can fence.
    pub fn fence_op(
        &mut self,
        node: NodeIdx,
        op: Option<&str>,
        optional: bool,
        reason: Option<&str>,
        priority_delay: bool,
    ) -> ActionIdx {
        let op = op.map_or_else(|| self.state.options.stonith_action.clone(), str::to_string);
        let key = ActionKey::new(Task::Fence(op.clone()), None, Some(node));
        let mut optional = optional;

        let idx = match self.actions.find(&key) {
            Some(idx) => idx,
            None => {
                let idx = self.get_or_create_action(key, true);
                let n = self.state.node(node);
                let meta = [
                    ("target", n.name.clone()),
                    ("target-uuid", n.id.clone()),
                    ("stonith-action", op.clone()),
                ];
                self.actions
                    .get_mut(idx)
                    .meta
                    .extend(meta.map(|(k, v)| (k.to_string(), v)));

                if self.state.options.unfencing_enabled {
                    let (changed, all, secure) = self.unfencing_digests(node);
                    if changed {
                        optional = false;
                    }
                    let meta = &mut self.actions.get_mut(idx).meta;
                    meta.insert(META_DIGESTS_ALL.to_string(), all);
                    meta.insert(META_DIGESTS_SECURE.to_string(), secure);
                }
                idx
            }
        };

        if self.state.options.priority_fencing_delay > 0 {
            let already_delayed = self
                .actions
                .get(idx)
                .meta
                .contains_key(META_PRIORITY_FENCING_DELAY);
            if priority_delay || already_delayed {
                let delay = priority_fencing_delay(&self.state, node);
                self.actions
                    .get_mut(idx)
                    .meta
                    .insert(META_PRIORITY_FENCING_DELAY.to_string(), delay.to_string());
            }
        }

        let can_fence = self.state.can_fence(node);
        let action = self.actions.get_mut(idx);
        if !optional && can_fence {
            action.flags.optional = false;
        }
        if let Some(reason) = reason {
            action.set_reason(reason, false);
        }
        idx
    }

    /// Compare every unfencing device's digests with what `node` recorded.
    ///
    /// Returns whether any definition changed, plus the node's expected
    /// `(all, secure)` digest summaries.
    fn unfencing_digests(&self, node: NodeIdx) -> (bool, String, String) {
        let n = self.state.node(node);
        let mut changed = false;
        let mut summary_all = String::new();
        let mut summary_secure = String::new();

        for (_, rsc) in self.state.resources().filter(|(_, r)| is_unfencing_device(r)) {
            let (all, secure) = device_digests(rsc);
            if compare_device_digest(n, rsc, &all, &secure) == DigestMatch::Mismatch {
                info!(node = %n.name, device = %rsc.id, "unfencing node because device definition changed");
                changed = true;
            }
            summary_all.push_str(&summary_entry(rsc, &all));
            summary_secure.push_str(&summary_entry(rsc, &secure));
        }
        (changed, summary_all, summary_secure)
    }

    /// Mark `node` as needing to be fenced.
    pub fn fence_node(&mut self, node: NodeIdx, reason: &str, priority_delay: bool) {
        let n = self.state.node(node);
        if n.is_guest() {
            if !n.remote_requires_reset {
                warn!(node = %n.name, reason, "guest node will be fenced by recovering its container");
            }
            self.state.node_mut(node).remote_requires_reset = true;
            return;
        }

        if !n.unclean {
            warn!(node = %n.name, reason, "cluster node will be fenced");
        }
        self.state.node_mut(node).unclean = true;
        self.fence_op(node, None, true, Some(reason), priority_delay);
    }

    /// Resource whose `remote-node` meta names the guest node.
    fn guest_container(&self, node: NodeIdx) -> Option<RscIdx> {
        let name = &self.state.node(node).name;
        self.state
            .resources()
            .find(|(_, r)| r.meta.get("remote-node") == Some(name))
            .map(|(idx, _)| idx)
    }

    /// Schedule fencing of every unclean node the cluster can fence.
    pub fn schedule_fencing(&mut self) {
        let any_managed = self.state.resources().any(|(_, r)| r.flags.managed);
        if !any_managed {
            info!("delaying fencing operations until there are resources to manage");
        }

        let nodes: Vec<NodeIdx> = self.state.nodes().map(|(idx, _)| idx).collect();
        let mut integrity_lost = false;
        let mut dc_fence = None;
        let mut fences = Vec::new();

        for node in nodes {
            let n = self.state.node(node);
            let can_fence = self.state.can_fence(node);
            if n.is_guest() {
                if n.remote_requires_reset && any_managed && can_fence {
                    self.fence_guest(node);
                }
                continue;
            }
            if !n.unclean {
                continue;
            }
            if any_managed && can_fence {
                warn!(node = %n.name, "scheduling node for fencing");
                let lost_peer = !n.online && n.is_cluster_member();
                let fence = self.fence_op(node, None, false, Some("node is unclean"), lost_peer);
                self.order_vs_fence(fence, node);
                if self.state.dc == Some(node) {
                    dc_fence = Some(fence);
                } else {
                    fences.push(fence);
                }
            } else {
                warn!(node = %n.name, "node is unclean but cannot be fenced");
                integrity_lost = true;
            }
        }

        if integrity_lost {
            if !self.state.options.stonith_enabled {
                error!("resource integrity is at risk: unclean nodes cannot be fenced with fencing disabled");
            } else if !self.state.have_quorum {
                info!("cannot fence unclean nodes until quorum is attained");
            }
        }

        // The DC is fenced last so the others complete under its control.
        if let Some(dc_fence) = dc_fence {
            for fence in fences {
                self.actions.order(fence, dc_fence, OrderKind::Ordered);
            }
        }
    }

    /// Fence a guest node by stopping (and maybe restarting) its container.
    fn fence_guest(&mut self, node: NodeIdx) {
        let container = self.guest_container(node);
        let (stops, restarting) = match container {
            Some(c) => (
                self.actions.find_all(c, &Task::Stop),
                !self.actions.find_all(c, &Task::Start).is_empty(),
            ),
            None => (Vec::new(), false),
        };
        let op = if restarting { "reboot" } else { "off" };

        let fence = self.fence_op(node, Some(op), false, Some("guest is unclean"), false);
        let flags = &mut self.actions.get_mut(fence).flags;
        flags.pseudo = true;
        flags.runnable = true;
        info!(node = %self.state.node(node).name, op, "implying guest node fencing");

        for stop in stops {
            let first = if self.actions.get(stop).flags.pseudo {
                // The container's stop is itself implied by fencing its host.
                match self.actions.get(stop).node() {
                    Some(host) => self.fence_op(host, None, false, None, false),
                    None => continue,
                }
            } else {
                stop
            };
            self.actions.order(first, fence, OrderKind::RunnableFirst);
            self.actions.order(first, fence, OrderKind::FirstImpliesThen);
        }
        self.order_vs_fence(fence, node);
    }

    /// Order starts of resources that need unfencing after unfencing the
    /// node they start on.
    pub fn order_starts_after_unfencing(&mut self) {
        let starts: Vec<(ActionIdx, NodeIdx)> = self
            .actions
            .iter()
            .filter(|a| *a.task() == Task::Start && !a.flags.pseudo)
            .filter(|a| a.rsc().is_some_and(|r| self.state.resource(r).flags.needs_unfencing))
            .filter_map(|a| Some((a.id, a.node()?)))
            .collect();

        for (start, node) in starts {
            if self.state.node(node).is_guest() {
                continue;
            }
            let unfence = self.fence_op(node, Some("on"), true, None, false);
            self.actions.order(unfence, start, OrderKind::Ordered);
            trace!(
                start = %self.action_uuid(start),
                unfence = %self.action_uuid(unfence),
                "start ordered after unfencing"
            );
        }
    }

    /// Turn stops and demotes on the fenced node into implied pseudo-actions
    /// and order starts that need fencing after it.
    fn order_vs_fence(&mut self, fence: ActionIdx, target: NodeIdx) {
        let target_node = self.state.node(target);
        let target_is_guest = target_node.is_guest();
        let target_down = !target_node.online || target_node.unclean;

        let rscs: Vec<RscIdx> = self
            .state
            .resources()
            .filter(|(_, r)| r.variant == RscVariant::Primitive && r.flags.managed)
            .map(|(idx, _)| idx)
            .collect();

        for rsc in rscs {
            let requires = self.state.resource(rsc).requires;
            let implicit = requires == Requirement::Fencing
                || requires == Requirement::Unfencing
                || target_is_guest;
            let allowed = self.state.resource(rsc).allowed_nodes.contains(target);
            let known = self.state.resource(rsc).history.known_on.contains(&target);

            let actions: Vec<ActionIdx> = self
                .actions
                .iter()
                .filter(|a| a.rsc() == Some(rsc) && a.key.interval_ms == 0)
                .map(|a| a.id)
                .collect();

            for idx in actions {
                let action = self.actions.get(idx);
                let (task, needs) = (action.key.task.clone(), action.needs);
                let on_target = action.node() == Some(target);
                match task {
                    Task::Stop | Task::Demote if on_target => {
                        if task == Task::Demote && !target_down {
                            continue;
                        }
                        let flags = &mut self.actions.get_mut(idx).flags;
                        flags.pseudo = true;
                        flags.runnable = true;
                        flags.implied_by_fencing = true;
                        debug!(action = %self.action_uuid(idx), "implied by fencing");
                        if implicit {
                            self.actions.order(fence, idx, OrderKind::FirstImpliesThen);
                        }
                    }
                    Task::Start | Task::Promote => {
                        let after_fence = match needs {
                            Requirement::Fencing | Requirement::Unfencing => true,
                            Requirement::Quorum => task == Task::Start && allowed && !known,
                            Requirement::Nothing => false,
                        };
                        if after_fence {
                            self.actions.order(fence, idx, OrderKind::Ordered);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
