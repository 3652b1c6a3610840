//! ClusterState — the per-run arena of nodes and resources.
//!
//! One `ClusterState` is built from a snapshot at the start of a
//! scheduling run, mutated only by the phase that owns the relevant
//! fields, and dropped when the run ends.

use std::collections::{BTreeMap, HashMap};

use hagrid_core::{ClusterOptions, NoQuorumPolicy, Role};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;
use crate::weights::NodeWeights;

#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub options: ClusterOptions,
    pub have_quorum: bool,
    /// Designated controller node.
    pub dc: Option<NodeIdx>,
    nodes: Vec<Node>,
    resources: Vec<Resource>,
    node_ids: HashMap<String, NodeIdx>,
    rsc_ids: HashMap<String, RscIdx>,
    /// Tags and templates: reference name → resources.
    references: BTreeMap<String, Vec<RscIdx>>,
}

impl ClusterState {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            have_quorum: true,
            ..Self::default()
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn add_node(&mut self, node: Node) -> StateResult<NodeIdx> {
        if self.node_ids.contains_key(&node.id) || self.node_ids.contains_key(&node.name) {
            return Err(StateError::DuplicateNode(node.id));
        }
        let idx = NodeIdx(self.nodes.len());
        self.node_ids.insert(node.id.clone(), idx);
        if node.name != node.id {
            self.node_ids.insert(node.name.clone(), idx);
        }
        debug!(node = %node.name, "node added");
        self.nodes.push(node);
        Ok(idx)
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx.0]
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[idx.0]
    }

    /// Find a node by id or name.
    pub fn find_node(&self, key: &str) -> Option<NodeIdx> {
        self.node_ids.get(key).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIdx(i), n))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_available(&self, idx: NodeIdx) -> bool {
        self.node(idx).available()
    }

    /// Whether any node in the table could still host the resource.
    pub fn any_available(&self, weights: &NodeWeights) -> bool {
        weights
            .iter()
            .any(|(node, w)| !w.unusable && w.weight >= 0 && self.node_available(*node))
    }

    // ── Resources ──────────────────────────────────────────────────

    pub fn add_resource(&mut self, mut rsc: Resource, parent: Option<RscIdx>) -> StateResult<RscIdx> {
        if self.rsc_ids.contains_key(&rsc.id) {
            return Err(StateError::DuplicateResource(rsc.id));
        }
        let idx = RscIdx(self.resources.len());
        rsc.parent = parent;
        self.rsc_ids.insert(rsc.id.clone(), idx);
        self.resources.push(rsc);
        if let Some(parent) = parent {
            self.resources[parent.0].children.push(idx);
        }
        Ok(idx)
    }

    pub fn resource(&self, idx: RscIdx) -> &Resource {
        &self.resources[idx.0]
    }

    pub fn resource_mut(&mut self, idx: RscIdx) -> &mut Resource {
        &mut self.resources[idx.0]
    }

    pub fn find_resource(&self, id: &str) -> Option<RscIdx> {
        self.rsc_ids.get(id).copied()
    }

    pub fn resources(&self) -> impl Iterator<Item = (RscIdx, &Resource)> {
        self.resources.iter().enumerate().map(|(i, r)| (RscIdx(i), r))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Resources without a parent, in definition order.
    pub fn top_level(&self) -> Vec<RscIdx> {
        self.resources()
            .filter(|(_, r)| r.parent.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Every primitive in the subtree rooted at `rsc`, depth first.
    pub fn primitives(&self, rsc: RscIdx) -> Vec<RscIdx> {
        let mut out = Vec::new();
        self.collect_primitives(rsc, &mut out);
        out
    }

    fn collect_primitives(&self, rsc: RscIdx, out: &mut Vec<RscIdx>) {
        let r = self.resource(rsc);
        if r.variant == RscVariant::Primitive {
            out.push(rsc);
        }
        for child in &r.children {
            self.collect_primitives(*child, out);
        }
    }

    pub fn top_parent(&self, rsc: RscIdx) -> RscIdx {
        let mut current = rsc;
        while let Some(parent) = self.resource(current).parent {
            current = parent;
        }
        current
    }

    /// The clone (or bundle) `rsc` is an instance of, or belongs to.
    pub fn collective_parent(&self, rsc: RscIdx) -> Option<RscIdx> {
        let mut current = self.resource(rsc).parent;
        while let Some(p) = current {
            if self.resource(p).variant.is_collective() {
                return Some(p);
            }
            current = self.resource(p).parent;
        }
        None
    }

    /// Whether `rsc` is an anonymous (not globally unique) clone instance.
    pub fn is_anonymous_instance(&self, rsc: RscIdx) -> bool {
        self.collective_parent(rsc)
            .is_some_and(|clone| !self.resource(clone).flags.unique)
    }

    // ── Tags and templates ────────────────────────────────────────

    pub fn add_reference(&mut self, name: impl Into<String>, members: Vec<RscIdx>) {
        self.references.insert(name.into(), members);
    }

    /// Resources named by a tag or template, if `name` is one.
    pub fn expand_reference(&self, name: &str) -> Option<&[RscIdx]> {
        self.references.get(name).map(Vec::as_slice)
    }

    pub fn is_reference(&self, name: &str) -> bool {
        self.references.contains_key(name)
    }

    // ── Fencing ───────────────────────────────────────────────────

    pub fn has_fence_device(&self) -> bool {
        self.resources.iter().any(|r| r.flags.fence_device)
    }

    /// Whether the cluster is able to fence `node` right now.
    pub fn can_fence(&self, node: NodeIdx) -> bool {
        let n = self.node(node);
        if n.is_guest() {
            // A guest is fenced by stopping its container on the host.
            return match n.host {
                Some(host) => self.node(host).online || self.can_fence(host),
                None => false,
            };
        }
        if !self.options.stonith_enabled || !self.has_fence_device() {
            return false;
        }
        if self.have_quorum || self.options.no_quorum_policy == NoQuorumPolicy::Ignore {
            return true;
        }
        n.online
    }

    /// Add each active resource's priority to the priority of its node.
    ///
    /// Promoted instances count one extra so that a split prefers the
    /// side holding promoted roles.
    pub fn accumulate_node_priorities(&mut self) {
        let mut extra: Vec<i32> = vec![0; self.nodes.len()];
        for rsc in &self.resources {
            if rsc.variant != RscVariant::Primitive || rsc.allocation_priority == 0 {
                continue;
            }
            let bonus = i32::from(rsc.history.role == Role::Promoted);
            for node in &rsc.history.running_on {
                extra[node.0] = extra[node.0].saturating_add(rsc.allocation_priority + bonus);
            }
        }
        for (node, add) in self.nodes.iter_mut().zip(extra) {
            node.priority = node.priority.saturating_add(add);
        }
    }

    pub fn online_member_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_cluster_member() && n.online)
            .count()
    }

    pub fn member_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_cluster_member()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence_device(id: &str) -> Resource {
        let mut rsc = Resource::new(id, RscVariant::Primitive);
        rsc.agent = Agent::parse("stonith:fence_xvm");
        rsc.flags.fence_device = true;
        rsc
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut state = ClusterState::new(ClusterOptions::default());
        state.add_node(Node::new("n1")).unwrap();
        assert!(matches!(state.add_node(Node::new("n1")), Err(StateError::DuplicateNode(_))));

        state.add_resource(Resource::new("ip", RscVariant::Primitive), None).unwrap();
        assert!(state.add_resource(Resource::new("ip", RscVariant::Primitive), None).is_err());
    }

    #[test]
    fn finds_nodes_by_id_and_name() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let mut node = Node::new("1");
        node.name = "alpha".to_string();
        let idx = state.add_node(node).unwrap();
        assert_eq!(state.find_node("1"), Some(idx));
        assert_eq!(state.find_node("alpha"), Some(idx));
    }

    #[test]
    fn parent_links_children() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let grp = state.add_resource(Resource::new("grp", RscVariant::Group), None).unwrap();
        let a = state.add_resource(Resource::new("a", RscVariant::Primitive), Some(grp)).unwrap();
        let b = state.add_resource(Resource::new("b", RscVariant::Primitive), Some(grp)).unwrap();
        assert_eq!(state.resource(grp).children, vec![a, b]);
        assert_eq!(state.top_parent(b), grp);
        assert_eq!(state.top_level(), vec![grp]);
        assert_eq!(state.primitives(grp), vec![a, b]);
    }

    #[test]
    fn cannot_fence_without_device() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let n1 = state.add_node(Node::new("n1")).unwrap();
        assert!(!state.can_fence(n1));

        state.add_resource(fence_device("fence"), None).unwrap();
        assert!(state.can_fence(n1));
    }

    #[test]
    fn without_quorum_only_online_nodes_are_fenceable() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let n1 = state.add_node(Node::new("n1")).unwrap();
        let n2 = state.add_node(Node::new("n2")).unwrap();
        state.node_mut(n2).online = false;
        state.add_resource(fence_device("fence"), None).unwrap();
        state.have_quorum = false;

        assert!(state.can_fence(n1));
        assert!(!state.can_fence(n2));

        state.options.no_quorum_policy = NoQuorumPolicy::Ignore;
        assert!(state.can_fence(n2));
    }

    #[test]
    fn guest_fencing_follows_host() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let host = state.add_node(Node::new("host")).unwrap();
        let mut guest = Node::new("guest");
        guest.variant = NodeVariant::Guest;
        guest.host = Some(host);
        let guest = state.add_node(guest).unwrap();

        assert!(state.can_fence(guest));
        state.node_mut(host).online = false;
        assert!(!state.can_fence(guest));
    }

    #[test]
    fn node_priority_includes_active_resources() {
        let mut state = ClusterState::new(ClusterOptions::default());
        let n1 = state.add_node(Node::new("n1")).unwrap();
        let mut rsc = Resource::new("db", RscVariant::Primitive);
        rsc.allocation_priority = 10;
        rsc.history.role = Role::Promoted;
        rsc.history.running_on = vec![n1];
        state.add_resource(rsc, None).unwrap();

        state.accumulate_node_priorities();
        assert_eq!(state.node(n1).priority, 11);
    }
}
