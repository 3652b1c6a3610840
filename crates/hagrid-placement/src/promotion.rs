//! Promotion engine — choosing which instances of a promotable clone take
//! the promoted role.
//!
//! Runs once per promotable clone, right after its instances have been
//! assigned:
//!
//! 1. each instance gets a promotion priority from the `master-<id>` node
//!    attribute, promoted-role location constraints and role-filtered
//!    colocations;
//! 2. priorities are folded into the clone's node table, together with
//!    colocated resources' preferences, and turned into sort keys;
//! 3. instances are walked in sort order and promoted while the clone
//!    and per-node caps allow;
//! 4. the promote/demote orderings between instances and the clone are
//!    recorded.
//!
//! Instance priorities live in a map local to one pass; the resource's
//! configured `allocation_priority` is never modified.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use hagrid_core::{
    Diagnostics, INFINITY, MINUS_INFINITY, NoQuorumPolicy, Role, SCORE_INFINITY, Score, Task,
    parse_score, readable_score,
};
use hagrid_state::{ClusterState, NodeIdx, RscIdx, RscVariant, clone_strip};
use tracing::{debug, info, trace};

use crate::colocation::{MergeOptions, NodeScoreMerger, apply_coloc_to_priority};
use crate::constraints::{ConstraintStore, OrderKind, cmp_resources};

type Priorities = BTreeMap<RscIdx, Score>;

/// Choose roles for every instance of the promotable clone `clone`.
pub fn promote_instances(
    state: &mut ClusterState,
    store: &mut ConstraintStore,
    diags: &mut Diagnostics,
    clone: RscIdx,
) {
    let instances = state.resource(clone).children.clone();
    let mut priorities = Priorities::new();
    for inst in &instances {
        set_instance_priority(state, store, diags, clone, *inst, &mut priorities);
    }
    let order = sort_promotable_instances(state, store, diags, clone, &instances);
    set_instance_role(state, clone, &order, &priorities);
    create_promotable_orderings(state, store, clone);
}

// ── Promotion scores ─────────────────────────────────────────────

/// Whether `inst`'s promotion score on `node` may be used.
fn promotion_score_applies(state: &ClusterState, inst: RscIdx, node: NodeIdx) -> bool {
    let r = state.resource(inst);
    let allowed = r.allowed_nodes.weight(node).is_some_and(|w| w >= 0);
    let Some(clone) = state.collective_parent(inst) else {
        return allowed;
    };
    let instances = &state.resource(clone).children;

    let none_probed = instances.iter().all(|i| {
        let h = &state.resource(*i).history;
        h.running_on.is_empty() && h.known_on.is_empty()
    });
    if none_probed {
        return allowed;
    }

    if state.is_anonymous_instance(inst) {
        let active = instances
            .iter()
            .copied()
            .find(|i| state.resource(*i).history.running_on.contains(&node));
        return match active {
            Some(active) if active == inst => allowed,
            None if r.history.known_on.contains(&node) => allowed,
            _ => false,
        };
    }
    (r.history.running_on.contains(&node) || r.history.known_on.contains(&node)) && allowed
}

fn lookup_promotion_attr(state: &ClusterState, rsc: RscIdx, node: NodeIdx) -> Option<Score> {
    let r = state.resource(rsc);
    let n = state.node(node);
    let value = n
        .attrs
        .get(&format!("master-{}", r.history_name()))
        .or_else(|| {
            state
                .is_anonymous_instance(rsc)
                .then(|| n.attrs.get(&format!("master-{}", clone_strip(&r.id))))
                .flatten()
        })?;
    Some(parse_score(value, &state.options))
}

/// Promotion score of `inst` on `node`, and whether it is a default.
///
/// A cloned group scores the sum of its members.
pub fn promotion_score(
    state: &ClusterState,
    diags: &mut Diagnostics,
    inst: RscIdx,
    node: Option<NodeIdx>,
) -> (Score, bool) {
    let Some(node) = node else {
        return (0, true);
    };
    if !promotion_score_applies(state, inst, node) {
        return (0, true);
    }

    let r = state.resource(inst);
    if r.variant == RscVariant::Group {
        let mut total = 0;
        let mut is_default = true;
        for member in &r.children {
            if let Some(score) = lookup_promotion_attr(state, *member, node) {
                total = diags.add_scores(total, score);
                is_default = false;
            }
        }
        return (total, is_default);
    }
    match lookup_promotion_attr(state, inst, node) {
        Some(score) => (score, false),
        None => (0, true),
    }
}

// ── Priorities and sorting ───────────────────────────────────────

pub fn set_instance_priority(
    state: &mut ClusterState,
    store: &ConstraintStore,
    diags: &mut Diagnostics,
    clone: RscIdx,
    inst: RscIdx,
    priorities: &mut Priorities,
) {
    let view: &ClusterState = state;
    let r = view.resource(inst);
    let node = r.assigned_to;
    let (score, is_default) = promotion_score(view, diags, inst, node);

    let mut priority = match r.next_role {
        Role::Unknown | Role::Started => {
            if is_default {
                -1
            } else {
                score
            }
        }
        Role::Unpromoted | Role::Stopped => MINUS_INFINITY,
        Role::Promoted => r.allocation_priority,
    };

    if let Some(node) = node {
        let promoted_locations = r
            .locations
            .iter()
            .chain(&view.resource(clone).locations)
            .filter(|loc| loc.role == Some(Role::Promoted) && loc.node == node);
        for loc in promoted_locations {
            priority = diags.add_scores(priority, loc.score);
        }

        for idx in store.this_with_inherited(view, inst) {
            let coloc = store.colocation(idx);
            if coloc.dependent_role >= Role::Unpromoted {
                apply_coloc_to_priority(view, diags, inst, coloc, &mut priority);
            }
        }
    }

    let sort_key = if r.next_role == Role::Promoted {
        INFINITY
    } else {
        priority
    };
    debug!(
        rsc = %r.id,
        score = %readable_score(score),
        priority = %readable_score(priority),
        "promotion priority"
    );
    priorities.insert(inst, priority);
    state.resource_mut(inst).promotion_sort_key = sort_key;
}

/// Fold instance priorities and colocated preferences into the clone's
/// node table, derive each instance's final sort key, and return the
/// instances in promotion order.
pub fn sort_promotable_instances(
    state: &mut ClusterState,
    store: &ConstraintStore,
    diags: &mut Diagnostics,
    clone: RscIdx,
    instances: &[RscIdx],
) -> Vec<RscIdx> {
    let mut table = std::mem::take(&mut state.resource_mut(clone).allowed_nodes);
    for inst in instances {
        let r = state.resource(*inst);
        if let Some(node) = r.assigned_to {
            if r.promotion_sort_key >= 0 {
                let entry = table.entry_or_insert(node, 0);
                entry.weight = diags.add_scores(entry.weight, r.promotion_sort_key);
            }
        }
    }

    if !table.is_empty() {
        let view: &ClusterState = state;
        for idx in store.this_with(clone) {
            let coloc = store.colocation(*idx);
            if coloc.dependent_role != Role::Promoted {
                continue;
            }
            let factor = coloc.score as f32 / SCORE_INFINITY as f32;
            let opts = MergeOptions {
                forward: true,
                ..MergeOptions::default()
            };
            NodeScoreMerger::new(view, store).exclude(clone).add(
                diags,
                coloc.primary,
                &mut table,
                &coloc.node_attribute,
                factor,
                opts,
            );
        }
        for idx in store.with_this(clone) {
            let coloc = store.colocation(*idx);
            if coloc.primary_role != Role::Promoted || !coloc.influence {
                continue;
            }
            let factor = coloc.score as f32 / SCORE_INFINITY as f32;
            let opts = MergeOptions {
                nonnegative: true,
                rollback: true,
                ..MergeOptions::default()
            };
            NodeScoreMerger::new(view, store).exclude(clone).add(
                diags,
                coloc.dependent,
                &mut table,
                &coloc.node_attribute,
                factor,
                opts,
            );
        }
    }

    for inst in instances {
        let r = state.resource(*inst);
        let key = if !r.flags.managed && r.history.role == Role::Promoted {
            INFINITY
        } else {
            match r.assigned_to {
                Some(node) if r.promotion_sort_key >= 0 => {
                    table.weight(node).unwrap_or(r.promotion_sort_key)
                }
                Some(_) => r.promotion_sort_key,
                // Will not be active at all.
                None => MINUS_INFINITY,
            }
        };
        trace!(rsc = %r.id, key = %readable_score(key), "promotion sort key");
        state.resource_mut(*inst).promotion_sort_key = key;
    }
    state.resource_mut(clone).allowed_nodes = table;

    let view: &ClusterState = state;
    let mut order = instances.to_vec();
    order.sort_by(|a, b| cmp_promotable_instance(view, *a, *b));
    order
}

fn cmp_promotable_instance(state: &ClusterState, a: RscIdx, b: RscIdx) -> Ordering {
    let ra = state.resource(a);
    let rb = state.resource(b);
    rb.promotion_sort_key
        .cmp(&ra.promotion_sort_key)
        .then_with(|| rb.history.role.cmp(&ra.history.role))
        .then_with(|| cmp_resources(state, a, b))
}

// ── Role selection ───────────────────────────────────────────────

/// Node `inst` may be promoted on, if any.
///
/// Panics if the instance is assigned to a node missing from the clone's
/// table; that can only result from a bug in assignment.
fn node_to_be_promoted_on(
    state: &ClusterState,
    clone: RscIdx,
    inst: RscIdx,
    priorities: &Priorities,
) -> Option<NodeIdx> {
    let r = state.resource(inst);

    for child in &r.children {
        let c = state.resource(*child);
        if c.assigned_to.is_none() || (!c.flags.managed && c.history.role != Role::Promoted) {
            trace!(rsc = %r.id, member = %c.id, "member cannot be promoted");
            return None;
        }
    }

    let Some(node) = r.assigned_to else {
        trace!(rsc = %r.id, "cannot be promoted: not assigned");
        return None;
    };
    let priority = priorities
        .get(&inst)
        .copied()
        .unwrap_or(r.allocation_priority);

    if !r.flags.managed {
        if r.history.role != Role::Promoted {
            trace!(rsc = %r.id, "cannot be promoted: unmanaged");
            return None;
        }
        info!(rsc = %r.id, node = %state.node(node).name, "unmanaged instance will be left promoted");
    } else if priority < 0 {
        trace!(rsc = %r.id, "cannot be promoted: priority below zero");
        return None;
    } else if !state.node_available(node) {
        trace!(rsc = %r.id, "cannot be promoted: node unavailable");
        return None;
    }

    let parent = state.resource(clone);
    let Some(entry) = parent.allowed_nodes.get(node) else {
        panic!(
            "{} is assigned to {} which is not in the allowed nodes of {}",
            r.id,
            state.node(node).name,
            parent.id
        );
    };
    if entry.count < parent.promoted_node_max {
        Some(node)
    } else {
        trace!(rsc = %r.id, node = %state.node(node).name, "cannot be promoted: node is at its limit");
        None
    }
}

fn set_next_role(state: &mut ClusterState, rsc: RscIdx, role: Role) {
    state.resource_mut(rsc).next_role = role;
    for child in state.resource(rsc).children.clone() {
        set_next_role(state, child, role);
    }
}

/// Walk instances in `order` and promote as many as the caps allow.
pub fn set_instance_role(
    state: &mut ClusterState,
    clone: RscIdx,
    order: &[RscIdx],
    priorities: &Priorities,
) {
    state.resource_mut(clone).allowed_nodes.reset_counts();
    let promoted_max = state.resource(clone).promoted_max;
    let managed = state.resource(clone).flags.managed;
    let freeze = !state.have_quorum && state.options.no_quorum_policy == NoQuorumPolicy::Freeze;
    let mut promoted = 0;

    for inst in order {
        let r = state.resource(*inst);
        let chosen = if r.promotion_sort_key < 0 {
            trace!(rsc = %r.id, "not promoted: sort key below zero");
            None
        } else if freeze && r.history.role < Role::Promoted {
            debug!(rsc = %r.id, "not promoted: no quorum");
            None
        } else if managed && promoted >= promoted_max {
            trace!(rsc = %r.id, "not promoted: clone is at its limit");
            None
        } else {
            node_to_be_promoted_on(state, clone, *inst, priorities)
        };

        match chosen {
            Some(node) => {
                if let Some(entry) = state.resource_mut(clone).allowed_nodes.get_mut(node) {
                    entry.count += 1;
                }
                promoted += 1;
                set_next_role(state, *inst, Role::Promoted);
                info!(
                    rsc = %state.resource(*inst).id,
                    node = %state.node(node).name,
                    "promoting"
                );
            }
            None => {
                let role = if state.resource(*inst).assigned_to.is_some() {
                    Role::Unpromoted
                } else {
                    Role::Stopped
                };
                set_next_role(state, *inst, role);
            }
        }
    }
    let clone_id = &state.resource(clone).id;
    debug!(clone = %clone_id, promoted, max = promoted_max, "promotion complete");
}

// ── Orderings ────────────────────────────────────────────────────

/// Orderings between instance and clone promote/demote actions.
pub fn create_promotable_orderings(state: &ClusterState, store: &mut ConstraintStore, clone: RscIdx) {
    let r = state.resource(clone);
    let mut prev: Option<RscIdx> = None;

    for inst in r.children.iter().copied() {
        store.add_ordering(inst, Task::Demote, inst, Task::Promote, OrderKind::Ordered);
        store.add_ordering(inst, Task::Demote, inst, Task::Stop, OrderKind::Ordered);
        store.add_ordering(inst, Task::Start, inst, Task::Promote, OrderKind::Ordered);

        store.add_ordering(clone, Task::Promote, inst, Task::Promote, OrderKind::Ordered);
        store.add_ordering(inst, Task::Promote, clone, Task::Promoted, OrderKind::Ordered);
        store.add_ordering(clone, Task::Demote, inst, Task::Demote, OrderKind::ThenImpliesFirst);
        store.add_ordering(inst, Task::Demote, clone, Task::Demoted, OrderKind::FirstImpliesThen);

        if r.flags.ordered {
            if let Some(prev) = prev {
                store.add_ordering(prev, Task::Promote, inst, Task::Promote, OrderKind::Ordered);
                store.add_ordering(inst, Task::Demote, prev, Task::Demote, OrderKind::Ordered);
            }
        }
        prev = Some(inst);
    }

    store.add_ordering(clone, Task::Demoted, clone, Task::Stop, OrderKind::Ordered);
    store.add_ordering(clone, Task::Running, clone, Task::Promote, OrderKind::Ordered);
    store.add_ordering(clone, Task::Demoted, clone, Task::Promote, OrderKind::Ordered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::{assign_resources, init_allowed_nodes};
    use hagrid_core::ClusterOptions;
    use hagrid_state::{LocationConstraint, Node, Resource};

    struct Fixture {
        state: ClusterState,
        clone: RscIdx,
        instances: Vec<RscIdx>,
    }

    fn make_promotable(nodes: usize, instances: usize, promoted_max: u32) -> Fixture {
        let mut state = ClusterState::new(ClusterOptions::default());
        for i in 1..=nodes {
            state.add_node(Node::new(format!("node{i}"))).unwrap();
        }
        let mut clone = Resource::new("db-clone", RscVariant::Clone);
        clone.flags.promotable = true;
        clone.promoted_max = promoted_max;
        clone.clone_max = instances as u32;
        let clone = state.add_resource(clone, None).unwrap();
        let instances = (0..instances)
            .map(|i| {
                let mut inst = Resource::new(format!("db:{i}"), RscVariant::Primitive);
                inst.clone_name = Some("db".to_string());
                state.add_resource(inst, Some(clone)).unwrap()
            })
            .collect();
        Fixture {
            state,
            clone,
            instances,
        }
    }

    fn set_attr(state: &mut ClusterState, node: usize, name: &str, value: &str) {
        state
            .node_mut(NodeIdx(node))
            .attrs
            .insert(name.to_string(), value.to_string());
    }

    fn run(fx: &mut Fixture) -> (ConstraintStore, Diagnostics) {
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        init_allowed_nodes(&mut fx.state, &mut diags);
        assign_resources(&mut fx.state, &mut store, &mut diags);
        (store, diags)
    }

    fn roles(fx: &Fixture) -> Vec<Role> {
        fx.instances
            .iter()
            .map(|i| fx.state.resource(*i).next_role)
            .collect()
    }

    #[test]
    fn scored_instance_beats_default() {
        let mut fx = make_promotable(2, 2, 1);
        set_attr(&mut fx.state, 0, "master-db", "10");
        run(&mut fx);
        assert_eq!(fx.state.resource(fx.instances[0]).assigned_to, Some(NodeIdx(0)));
        assert_eq!(roles(&fx), vec![Role::Promoted, Role::Unpromoted]);
    }

    #[test]
    fn scored_instance_wins_regardless_of_position() {
        let mut fx = make_promotable(2, 2, 1);
        set_attr(&mut fx.state, 1, "master-db", "10");
        run(&mut fx);
        assert_eq!(fx.state.resource(fx.instances[1]).assigned_to, Some(NodeIdx(1)));
        assert_eq!(roles(&fx), vec![Role::Unpromoted, Role::Promoted]);
    }

    #[test]
    fn equal_scores_promote_exactly_one() {
        let mut fx = make_promotable(2, 2, 1);
        set_attr(&mut fx.state, 0, "master-db", "10");
        set_attr(&mut fx.state, 1, "master-db", "10");
        run(&mut fx);
        let promoted = roles(&fx).iter().filter(|r| **r == Role::Promoted).count();
        assert_eq!(promoted, 1);
        assert_eq!(roles(&fx)[0], Role::Promoted);
    }

    #[test]
    fn promoted_max_two_promotes_two() {
        let mut fx = make_promotable(3, 3, 2);
        for n in 0..3 {
            set_attr(&mut fx.state, n, "master-db", "5");
        }
        run(&mut fx);
        let promoted = roles(&fx).iter().filter(|r| **r == Role::Promoted).count();
        assert_eq!(promoted, 2);
    }

    #[test]
    fn no_scores_promotes_nothing() {
        let mut fx = make_promotable(2, 2, 1);
        run(&mut fx);
        assert_eq!(roles(&fx), vec![Role::Unpromoted, Role::Unpromoted]);
    }

    #[test]
    fn per_node_cap_holds_with_two_instances_on_one_node() {
        let mut fx = make_promotable(1, 2, 2);
        fx.state.resource_mut(fx.clone).clone_node_max = 2;
        set_attr(&mut fx.state, 0, "master-db", "10");
        run(&mut fx);
        let promoted = roles(&fx).iter().filter(|r| **r == Role::Promoted).count();
        assert_eq!(promoted, 1);
    }

    #[test]
    fn promoted_location_adds_to_priority() {
        let mut fx = make_promotable(2, 2, 1);
        set_attr(&mut fx.state, 0, "master-db", "10");
        set_attr(&mut fx.state, 1, "master-db", "10");
        fx.state.resource_mut(fx.clone).locations.push(LocationConstraint {
            id: "prefer-node2".to_string(),
            node: NodeIdx(1),
            score: 50,
            role: Some(Role::Promoted),
        });
        run(&mut fx);
        assert_eq!(roles(&fx), vec![Role::Unpromoted, Role::Promoted]);
    }

    #[test]
    fn freeze_without_quorum_blocks_new_promotion() {
        let mut fx = make_promotable(2, 2, 1);
        set_attr(&mut fx.state, 0, "master-db", "10");
        fx.state.have_quorum = false;
        fx.state.options.no_quorum_policy = NoQuorumPolicy::Freeze;
        run(&mut fx);
        assert!(roles(&fx).iter().all(|r| *r != Role::Promoted));
    }

    #[test]
    fn unassigned_instance_is_stopped() {
        let mut fx = make_promotable(1, 2, 1);
        set_attr(&mut fx.state, 0, "master-db", "10");
        run(&mut fx);
        assert_eq!(roles(&fx), vec![Role::Promoted, Role::Stopped]);
    }

    #[test]
    fn active_anonymous_instance_reads_score_only_where_active() {
        let mut fx = make_promotable(2, 2, 1);
        let first = fx.instances[0];
        fx.state.resource_mut(first).history.running_on = vec![NodeIdx(1)];
        fx.state.resource_mut(first).history.role = Role::Started;
        set_attr(&mut fx.state, 0, "master-db", "100");
        set_attr(&mut fx.state, 1, "master-db", "5");
        run(&mut fx);
        // db:0 keeps node2 and scores 5 there; db:1 lands on node1, where
        // nothing has been probed, so its score does not apply.
        assert_eq!(fx.state.resource(first).assigned_to, Some(NodeIdx(1)));
        assert_eq!(roles(&fx), vec![Role::Promoted, Role::Unpromoted]);
    }

    #[test]
    fn unassigned_instance_sorts_last() {
        let mut fx = make_promotable(2, 2, 1);
        let (idle, placed) = (fx.instances[0], fx.instances[1]);
        fx.state.resource_mut(idle).promotion_sort_key = -1;
        let r = fx.state.resource_mut(placed);
        r.assigned_to = Some(NodeIdx(0));
        r.promotion_sort_key = -5;

        let store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        let instances = fx.instances.clone();
        let order =
            sort_promotable_instances(&mut fx.state, &store, &mut diags, fx.clone, &instances);
        assert_eq!(order, vec![placed, idle]);
        assert_eq!(fx.state.resource(idle).promotion_sort_key, MINUS_INFINITY);
        assert_eq!(fx.state.resource(placed).promotion_sort_key, -5);
    }

    #[test]
    fn unmanaged_clone_keeps_every_promoted_instance() {
        let mut fx = make_promotable(2, 2, 1);
        fx.state.resource_mut(fx.clone).flags.managed = false;
        for (n, inst) in fx.instances.clone().into_iter().enumerate() {
            fx.state.resource_mut(fx.clone).allowed_nodes.set_weight(NodeIdx(n), 0);
            let r = fx.state.resource_mut(inst);
            r.flags.managed = false;
            r.history.role = Role::Promoted;
            r.history.running_on = vec![NodeIdx(n)];
            r.assigned_to = Some(NodeIdx(n));
            r.promotion_sort_key = INFINITY;
        }

        let instances = fx.instances.clone();
        set_instance_role(&mut fx.state, fx.clone, &instances, &Priorities::new());
        assert_eq!(roles(&fx), vec![Role::Promoted, Role::Promoted]);
    }

    #[test]
    fn promotion_orderings_are_recorded() {
        let mut fx = make_promotable(2, 2, 1);
        fx.state.resource_mut(fx.clone).flags.ordered = true;
        let (store, _) = run(&mut fx);
        let (a, b) = (fx.instances[0], fx.instances[1]);
        let has = |first: RscIdx, ft: Task, then: RscIdx, tt: Task, kind: OrderKind| {
            store.orderings().iter().any(|o| {
                o.first == first
                    && o.first_task == ft
                    && o.then == then
                    && o.then_task == tt
                    && o.kind == kind
            })
        };
        assert!(has(a, Task::Demote, a, Task::Promote, OrderKind::Ordered));
        assert!(has(a, Task::Promote, b, Task::Promote, OrderKind::Ordered));
        assert!(has(b, Task::Demote, a, Task::Demote, OrderKind::Ordered));
        assert!(has(fx.clone, Task::Demote, b, Task::Demote, OrderKind::ThenImpliesFirst));
        assert!(has(b, Task::Demote, fx.clone, Task::Demoted, OrderKind::FirstImpliesThen));
    }
}
