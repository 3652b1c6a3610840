//! Colocation engine — applying colocation scores to node-weight tables.

use std::collections::BTreeSet;

use hagrid_core::{
    Diagnostics, INFINITY, MINUS_INFINITY, Role, SCORE_INFINITY, Score, readable_score,
    scale_score,
};
use hagrid_state::{ClusterState, NodeIdx, NodeWeights, Resource, RscIdx, RscVariant};
use tracing::{debug, trace};

use crate::constraints::{Colocation, ConstraintStore};

/// What a colocation influences at the current scheduling phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affects {
    Nothing,
    Location,
    Role,
}

// ── Helpers ──────────────────────────────────────────────────────

/// Whether `rsc` (or, for a clone, any of its instances) will hold `role`.
pub fn has_role(state: &ClusterState, rsc: RscIdx, role: Role) -> bool {
    if role == Role::Unknown {
        return true;
    }
    let r = state.resource(rsc);
    if r.variant.is_collective() {
        r.children.iter().any(|child| has_role(state, *child, role))
    } else {
        r.next_role == role
    }
}

/// Nodes where `rsc` (or its instances) will hold `role`.
pub fn nodes_in_role(state: &ClusterState, rsc: RscIdx, role: Role) -> Vec<NodeIdx> {
    let r = state.resource(rsc);
    if r.variant.is_collective() {
        let mut nodes: Vec<NodeIdx> = r
            .children
            .iter()
            .flat_map(|child| nodes_in_role(state, *child, role))
            .collect();
        nodes.sort();
        nodes.dedup();
        return nodes;
    }
    if role == Role::Unknown || r.next_role == role {
        r.assigned_to.into_iter().collect()
    } else {
        Vec::new()
    }
}

fn attr_matches(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a.eq_ignore_ascii_case(b))
}

fn node_value<'a>(state: &'a ClusterState, node: NodeIdx, attr: &str) -> Option<&'a str> {
    state.node(node).attr(attr)
}

fn shares_attr(state: &ClusterState, node: NodeIdx, others: &[NodeIdx], attr: &str) -> bool {
    let value = node_value(state, node, attr);
    others
        .iter()
        .any(|other| attr_matches(value, node_value(state, *other, attr)))
}

// ── Phase checks ─────────────────────────────────────────────────

/// Decide whether `coloc` should change the dependent's location, its
/// role, or nothing at this point of the run.
///
/// With `preview` unset, a colocation whose dependent has already been
/// placed is checked instead: a violated mandatory (anti-)colocation is
/// recorded as an inconsistency.
pub fn colocation_affects(
    state: &ClusterState,
    coloc: &Colocation,
    preview: bool,
    diags: &mut Diagnostics,
) -> Affects {
    let dependent = state.resource(coloc.dependent);
    let primary = state.resource(coloc.primary);

    if !preview && primary.provisional {
        return Affects::Nothing;
    }

    let promotable_parent = dependent
        .parent
        .is_some_and(|p| state.resource(p).is_promotable_clone());
    if coloc.dependent_role >= Role::Unpromoted && promotable_parent && !dependent.provisional {
        return Affects::Role;
    }

    if !preview && !dependent.provisional {
        check_mandatory(state, coloc, diags);
        return Affects::Nothing;
    }

    if !has_role(state, coloc.dependent, coloc.dependent_role)
        || !has_role(state, coloc.primary, coloc.primary_role)
    {
        trace!(constraint = %coloc.id, "role filter does not match next role");
        return Affects::Nothing;
    }
    Affects::Location
}

fn check_mandatory(state: &ClusterState, coloc: &Colocation, diags: &mut Diagnostics) {
    if coloc.score > MINUS_INFINITY && coloc.score < INFINITY {
        return;
    }
    let dependent_nodes = nodes_in_role(state, coloc.dependent, coloc.dependent_role);
    let primary_nodes = nodes_in_role(state, coloc.primary, coloc.primary_role);
    let dependent = &state.resource(coloc.dependent).id;
    let primary = &state.resource(coloc.primary).id;

    for node in dependent_nodes {
        let shared = shares_attr(state, node, &primary_nodes, &coloc.node_attribute);
        let name = &state.node(node).name;
        if coloc.score >= INFINITY && !shared {
            diags.inconsistency(
                coloc.id.as_str(),
                format!("{dependent} must be colocated with {primary} but is not ({name})"),
            );
        } else if coloc.score <= MINUS_INFINITY && shared {
            diags.inconsistency(
                coloc.id.as_str(),
                format!("{dependent} and {primary} are both placed on {name} but must not be"),
            );
        }
    }
}

/// Check every colocation against the final placement.
pub fn verify_colocations(state: &ClusterState, store: &ConstraintStore, diags: &mut Diagnostics) {
    for (_, coloc) in store.colocations() {
        colocation_affects(state, coloc, false, diags);
    }
}

// ── Location ─────────────────────────────────────────────────────

/// Apply a location-affecting colocation to `dependent`'s node weights.
///
/// `dependent` is normally `coloc.dependent`; clone instances pass
/// themselves to receive their clone's colocations. The change is
/// committed when the colocation is mandatory-positive or when at least
/// one node remains available; otherwise it is rolled back. This includes
/// mandatory anti-colocations, so a dependent banned from every node keeps
/// its previous weights and stays placeable.
pub fn apply_coloc_to_weights(
    state: &mut ClusterState,
    diags: &mut Diagnostics,
    dependent: RscIdx,
    coloc: &Colocation,
) {
    let primary_nodes = nodes_in_role(state, coloc.primary, coloc.primary_role);
    if primary_nodes.is_empty() && coloc.score < 0 {
        trace!(constraint = %coloc.id, "primary is inactive, anti-colocation is vacuous");
        return;
    }

    let mut work = state.resource(dependent).allowed_nodes.clone();
    for (node, entry) in work.iter_mut() {
        if primary_nodes.is_empty() {
            entry.weight = diags.add_scores(entry.weight, -coloc.score);
        } else if shares_attr(state, *node, &primary_nodes, &coloc.node_attribute) {
            if coloc.score < INFINITY {
                entry.weight = diags.add_scores(entry.weight, coloc.score);
            }
        } else if coloc.score >= INFINITY {
            entry.weight = diags.add_scores(entry.weight, -coloc.score);
        }
    }

    let dep_id = state.resource(dependent).id.clone();
    if coloc.score >= INFINITY || state.any_available(&work) {
        debug!(
            constraint = %coloc.id,
            rsc = %dep_id,
            score = %readable_score(coloc.score),
            "applied colocation to node weights"
        );
        state.resource_mut(dependent).allowed_nodes = work;
    } else {
        diags.rollback(
            coloc.id.as_str(),
            format!("not applying colocation to {dep_id}: no node would remain available"),
        );
    }
}

// ── Role ─────────────────────────────────────────────────────────

/// Apply a role-affecting colocation to the promotion priority of
/// `dependent`, a promotable clone instance.
pub fn apply_coloc_to_priority(
    state: &ClusterState,
    diags: &mut Diagnostics,
    dependent: RscIdx,
    coloc: &Colocation,
    priority: &mut Score,
) {
    let Some(dep_node) = state.resource(dependent).assigned_to else {
        return;
    };
    let candidates: Vec<RscIdx> = instances(state, coloc.primary)
        .into_iter()
        .filter(|inst| {
            state
                .resource(*inst)
                .assigned_to
                .is_some_and(|node| shares_attr(state, dep_node, &[node], &coloc.node_attribute))
        })
        .collect();

    if candidates.is_empty() {
        if coloc.score >= INFINITY && coloc.dependent_role == Role::Promoted {
            trace!(
                constraint = %coloc.id,
                rsc = %state.resource(dependent).id,
                "cannot be promoted away from primary"
            );
            *priority = MINUS_INFINITY;
        }
        return;
    }
    if coloc.primary_role != Role::Unknown
        && !candidates
            .iter()
            .any(|inst| has_role(state, *inst, coloc.primary_role))
    {
        return;
    }

    let mult = if coloc.dependent_role == Role::Unpromoted { -1 } else { 1 };
    let before = *priority;
    *priority = diags.add_scores(*priority, mult * coloc.score);
    debug!(
        constraint = %coloc.id,
        rsc = %state.resource(dependent).id,
        before = %readable_score(before),
        after = %readable_score(*priority),
        "applied colocation to promotion priority"
    );
}

fn instances(state: &ClusterState, rsc: RscIdx) -> Vec<RscIdx> {
    let r = state.resource(rsc);
    if r.variant.is_collective() {
        r.children.clone()
    } else {
        vec![rsc]
    }
}

// ── Recursive merge ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Follow colocations where the resource is dependent (toward its
    /// primaries) instead of those where it is primary.
    pub forward: bool,
    /// Never let a contribution turn a preferred node negative; such nodes
    /// are marked unusable during the merge and end at weight 1.
    pub nonnegative: bool,
    /// Keep the caller's table if the merge would leave no node available.
    pub rollback: bool,
}

/// Merges colocation-induced preferences into a node table.
///
/// One merger tracks the resources on the current recursion path, so a
/// colocation cycle is cut the second time a resource is reached.
pub struct NodeScoreMerger<'a> {
    state: &'a ClusterState,
    store: &'a ConstraintStore,
    visited: BTreeSet<RscIdx>,
}

impl<'a> NodeScoreMerger<'a> {
    pub fn new(state: &'a ClusterState, store: &'a ConstraintStore) -> Self {
        Self {
            state,
            store,
            visited: BTreeSet::new(),
        }
    }

    /// Treat `rsc` as already on the path; used for the table's owner.
    pub fn exclude(mut self, rsc: RscIdx) -> Self {
        self.visited.insert(rsc);
        self
    }

    /// Add `rsc`'s node preferences, scaled by `factor`, to `weights`,
    /// then recurse through `rsc`'s own colocations.
    ///
    /// An empty `weights` starts from a copy of `rsc`'s allowed nodes.
    pub fn add(
        &mut self,
        diags: &mut Diagnostics,
        rsc: RscIdx,
        weights: &mut NodeWeights,
        attr: &str,
        factor: f32,
        opts: MergeOptions,
    ) {
        let (state, store) = (self.state, self.store);
        let r = state.resource(rsc);
        if !self.visited.insert(rsc) {
            trace!(rsc = %r.id, "breaking colocation cycle");
            return;
        }

        // Groups contribute through their first member.
        let source = match r.variant {
            RscVariant::Group => r.children.first().copied().unwrap_or(rsc),
            _ => rsc,
        };

        let mut work = if weights.is_empty() {
            state.resource(source).allowed_nodes.clone()
        } else {
            let mut work = weights.clone();
            self.combine(diags, state.resource(source), &mut work, attr, factor, opts.nonnegative);
            work
        };

        if state.any_available(&work) {
            let mut owners = vec![source];
            if source != rsc {
                owners.push(rsc);
            }
            for owner in owners {
                let list = if opts.forward {
                    store.this_with(owner)
                } else {
                    store.with_this(owner)
                };
                for idx in list {
                    let coloc = store.colocation(*idx);
                    let other = if opts.forward {
                        coloc.primary
                    } else if !coloc.influence {
                        continue;
                    } else {
                        coloc.dependent
                    };
                    let mult = factor * coloc.score as f32 / SCORE_INFINITY as f32;
                    trace!(
                        rsc = %r.id,
                        other = %state.resource(other).id,
                        constraint = %coloc.id,
                        factor = mult,
                        "merging colocated node scores"
                    );
                    self.add(
                        diags,
                        other,
                        &mut work,
                        &coloc.node_attribute,
                        mult,
                        MergeOptions {
                            rollback: true,
                            ..opts
                        },
                    );
                }
            }
        } else if opts.rollback {
            debug!(rsc = %r.id, "rolling back merged scores: no node remains available");
            self.visited.remove(&rsc);
            return;
        }

        if opts.nonnegative {
            for (_, entry) in work.iter_mut() {
                if entry.unusable {
                    entry.weight = 1;
                    entry.unusable = false;
                }
            }
        }
        self.visited.remove(&rsc);
        *weights = work;
    }

    fn combine(
        &self,
        diags: &mut Diagnostics,
        source: &Resource,
        work: &mut NodeWeights,
        attr: &str,
        factor: f32,
        nonnegative: bool,
    ) {
        for (node, entry) in work.iter_mut() {
            let value = node_value(self.state, *node, attr);
            let best = self.best_matching_score(source, attr, value);
            if factor < 0.0 && best < 0 {
                continue;
            }
            let updated = diags.add_scores(entry.weight, scale_score(best, factor));
            if nonnegative && updated < 0 {
                if entry.weight > 0 {
                    entry.unusable = true;
                }
                continue;
            }
            entry.weight = updated;
        }
    }

    /// Best weight `source` has on an available node whose `attr` equals `value`.
    fn best_matching_score(&self, source: &Resource, attr: &str, value: Option<&str>) -> Score {
        source
            .allowed_nodes
            .iter()
            .filter(|(node, _)| self.state.node_available(**node))
            .filter(|(node, _)| attr_matches(value, node_value(self.state, **node, attr)))
            .map(|(_, w)| w.weight)
            .max()
            .unwrap_or(MINUS_INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::NewColocation;
    use hagrid_core::{ClusterOptions, DiagnosticKind};
    use hagrid_state::Node;

    fn make_state(nodes: &[&str], rscs: &[&str]) -> ClusterState {
        let mut state = ClusterState::new(ClusterOptions::default());
        for n in nodes {
            state.add_node(Node::new(*n)).unwrap();
        }
        for r in rscs {
            let idx = state.add_resource(Resource::new(*r, RscVariant::Primitive), None).unwrap();
            state.resource_mut(idx).allowed_nodes = (0..nodes.len()).map(|i| (NodeIdx(i), 0)).collect();
        }
        state
    }

    fn place(state: &mut ClusterState, rsc: &str, node: usize) {
        let idx = state.find_resource(rsc).unwrap();
        let r = state.resource_mut(idx);
        r.assigned_to = Some(NodeIdx(node));
        r.provisional = false;
        r.next_role = Role::Started;
    }

    fn add(
        state: &ClusterState,
        store: &mut ConstraintStore,
        diags: &mut Diagnostics,
        id: &str,
        dep: &str,
        pri: &str,
        score: Score,
    ) -> Colocation {
        let idx = store
            .new_colocation(
                state,
                diags,
                NewColocation {
                    id: id.to_string(),
                    node_attribute: None,
                    score,
                    dependent: state.find_resource(dep),
                    primary: state.find_resource(pri),
                    dependent_role: Role::Unknown,
                    primary_role: Role::Unknown,
                    influence: true,
                },
            )
            .unwrap();
        store.colocation(idx).clone()
    }

    fn weights(state: &ClusterState, rsc: &str) -> Vec<Score> {
        let idx = state.find_resource(rsc).unwrap();
        state.resource(idx).allowed_nodes.iter().map(|(_, w)| w.weight).collect()
    }

    #[test]
    fn three_node_scenario() {
        let mut state = make_state(&["node1", "node2", "node3"], &["X", "Y", "Z"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        place(&mut state, "Y", 1);
        place(&mut state, "Z", 1);
        let x = state.find_resource("X").unwrap();

        let with_y = add(&state, &mut store, &mut diags, "x-with-y", "X", "Y", 100);
        assert_eq!(colocation_affects(&state, &with_y, false, &mut diags), Affects::Location);
        apply_coloc_to_weights(&mut state, &mut diags, x, &with_y);
        assert_eq!(weights(&state, "X"), vec![0, 100, 0]);

        let not_z = add(&state, &mut store, &mut diags, "x-not-z", "X", "Z", MINUS_INFINITY);
        apply_coloc_to_weights(&mut state, &mut diags, x, &not_z);
        assert_eq!(weights(&state, "X"), vec![0, MINUS_INFINITY, 0]);
        assert!(diags.is_empty());
    }

    #[test]
    fn attribute_matching_is_case_insensitive() {
        let mut state = make_state(&["n1", "n2", "n3"], &["X", "Y"]);
        state.node_mut(NodeIdx(0)).attrs.insert("rack".into(), "A".into());
        state.node_mut(NodeIdx(1)).attrs.insert("rack".into(), "a".into());
        state.node_mut(NodeIdx(2)).attrs.insert("rack".into(), "b".into());
        place(&mut state, "Y", 0);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let idx = store
            .new_colocation(
                &state,
                &mut diags,
                NewColocation {
                    id: "rack".into(),
                    node_attribute: Some("rack".into()),
                    score: 50,
                    dependent: state.find_resource("X"),
                    primary: state.find_resource("Y"),
                    dependent_role: Role::Unknown,
                    primary_role: Role::Unknown,
                    influence: true,
                },
            )
            .unwrap();
        let coloc = store.colocation(idx).clone();
        let x = state.find_resource("X").unwrap();
        apply_coloc_to_weights(&mut state, &mut diags, x, &coloc);
        assert_eq!(weights(&state, "X"), vec![50, 50, 0]);
    }

    #[test]
    fn anti_colocation_on_only_node_rolls_back() {
        let mut state = make_state(&["n1"], &["dep", "pri"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        place(&mut state, "pri", 0);
        let dep = state.find_resource("dep").unwrap();
        let before = state.resource(dep).allowed_nodes.clone();

        let coloc = add(&state, &mut store, &mut diags, "apart", "dep", "pri", MINUS_INFINITY);
        apply_coloc_to_weights(&mut state, &mut diags, dep, &coloc);

        assert_eq!(state.resource(dep).allowed_nodes, before);
        assert_eq!(diags.count(DiagnosticKind::Rollback), 1);
    }

    #[test]
    fn inactive_primary_bans_mandatory_dependent() {
        let mut state = make_state(&["n1", "n2"], &["dep", "pri"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let pri = state.find_resource("pri").unwrap();
        state.resource_mut(pri).provisional = false;
        let dep = state.find_resource("dep").unwrap();

        let coloc = add(&state, &mut store, &mut diags, "together", "dep", "pri", INFINITY);
        apply_coloc_to_weights(&mut state, &mut diags, dep, &coloc);
        assert_eq!(weights(&state, "dep"), vec![MINUS_INFINITY, MINUS_INFINITY]);
    }

    #[test]
    fn inactive_primary_ignores_anti_colocation() {
        let mut state = make_state(&["n1", "n2"], &["dep", "pri"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let dep = state.find_resource("dep").unwrap();
        let coloc = add(&state, &mut store, &mut diags, "apart", "dep", "pri", -500);
        apply_coloc_to_weights(&mut state, &mut diags, dep, &coloc);
        assert_eq!(weights(&state, "dep"), vec![0, 0]);
    }

    #[test]
    fn provisional_primary_affects_nothing() {
        let state = make_state(&["n1"], &["dep", "pri"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let coloc = add(&state, &mut store, &mut diags, "c", "dep", "pri", 10);
        assert_eq!(colocation_affects(&state, &coloc, false, &mut diags), Affects::Nothing);
        assert_eq!(colocation_affects(&state, &coloc, true, &mut diags), Affects::Location);
    }

    #[test]
    fn violated_mandatory_colocation_is_reported() {
        let mut state = make_state(&["n1", "n2"], &["dep", "pri"]);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        place(&mut state, "dep", 0);
        place(&mut state, "pri", 1);
        add(&state, &mut store, &mut diags, "together", "dep", "pri", INFINITY);
        verify_colocations(&state, &store, &mut diags);
        assert_eq!(diags.count(DiagnosticKind::Inconsistency), 1);
    }

    #[test]
    fn merge_cycle_terminates_and_counts_once() {
        let mut state = make_state(&["n1", "n2"], &["A", "B"]);
        let a = state.find_resource("A").unwrap();
        let b = state.find_resource("B").unwrap();
        state.resource_mut(a).allowed_nodes.set_weight(NodeIdx(0), 10);
        state.resource_mut(b).allowed_nodes.set_weight(NodeIdx(1), 20);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        add(&state, &mut store, &mut diags, "a-b", "A", "B", 100);
        add(&state, &mut store, &mut diags, "b-a", "B", "A", 100);

        let run = |diags: &mut Diagnostics| {
            let mut table = NodeWeights::new();
            let opts = MergeOptions {
                forward: true,
                ..MergeOptions::default()
            };
            NodeScoreMerger::new(&state, &store).add(diags, a, &mut table, "#uname", 1.0, opts);
            table
        };
        let first = run(&mut diags);
        let second = run(&mut diags);
        assert_eq!(first, second);
        // B's preference for n2 arrives once, scaled down to the minimum.
        assert_eq!(first.weight(NodeIdx(0)), Some(10));
        assert_eq!(first.weight(NodeIdx(1)), Some(1));
    }

    #[test]
    fn nonnegative_merge_marks_then_restores() {
        let mut state = make_state(&["n1", "n2"], &["owner", "dep"]);
        let dep = state.find_resource("dep").unwrap();
        state.resource_mut(dep).allowed_nodes.set_weight(NodeIdx(0), -50);
        let store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let mut table: NodeWeights = [(NodeIdx(0), 5), (NodeIdx(1), 0)].into_iter().collect();
        let opts = MergeOptions {
            nonnegative: true,
            rollback: true,
            ..MergeOptions::default()
        };
        NodeScoreMerger::new(&state, &store).add(&mut diags, dep, &mut table, "#uname", 1.0, opts);
        assert_eq!(table.weight(NodeIdx(0)), Some(1));
        assert_eq!(table.weight(NodeIdx(1)), Some(0));
        assert!(table.iter().all(|(_, w)| !w.unusable));
    }

    #[test]
    fn merge_rolls_back_when_nothing_remains() {
        let mut state = make_state(&["n1"], &["owner", "dep"]);
        let dep = state.find_resource("dep").unwrap();
        state.resource_mut(dep).allowed_nodes.set_weight(NodeIdx(0), MINUS_INFINITY);
        let store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let mut table: NodeWeights = [(NodeIdx(0), 0)].into_iter().collect();
        let opts = MergeOptions {
            rollback: true,
            ..MergeOptions::default()
        };
        NodeScoreMerger::new(&state, &store).add(&mut diags, dep, &mut table, "#uname", 1.0, opts);
        assert_eq!(table.weight(NodeIdx(0)), Some(0));
    }

    #[test]
    fn priority_follows_promoted_primary() {
        let mut state = make_state(&["n1", "n2"], &["inst", "ip"]);
        place(&mut state, "inst", 0);
        place(&mut state, "ip", 0);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let mut coloc = add(&state, &mut store, &mut diags, "c", "inst", "ip", 40);
        coloc.dependent_role = Role::Promoted;
        let inst = state.find_resource("inst").unwrap();

        let mut priority = 5;
        apply_coloc_to_priority(&state, &mut diags, inst, &coloc, &mut priority);
        assert_eq!(priority, 45);

        coloc.dependent_role = Role::Unpromoted;
        let mut priority = 5;
        apply_coloc_to_priority(&state, &mut diags, inst, &coloc, &mut priority);
        assert_eq!(priority, -35);
    }

    #[test]
    fn mandatory_promoted_colocation_away_from_primary_blocks() {
        let mut state = make_state(&["n1", "n2"], &["inst", "ip"]);
        place(&mut state, "inst", 0);
        place(&mut state, "ip", 1);
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let mut coloc = add(&state, &mut store, &mut diags, "c", "inst", "ip", INFINITY);
        coloc.dependent_role = Role::Promoted;
        let inst = state.find_resource("inst").unwrap();
        let mut priority = 5;
        apply_coloc_to_priority(&state, &mut diags, inst, &coloc, &mut priority);
        assert_eq!(priority, MINUS_INFINITY);
    }
}
