//! Node assignment.
//!
//! Places every resource on at most one node (clones: each instance)
//! after its colocations have been applied. Resources are visited in
//! colocation priority order, and primaries are always assigned before
//! their dependents so that location-affecting colocations see where the
//! primary went. Promotable clones run the promotion engine as soon as
//! their instances are placed.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use hagrid_core::{Diagnostics, MINUS_INFINITY, Role, SCORE_INFINITY};
use hagrid_state::{ClusterState, NodeIdx, NodeWeights, RscIdx, RscVariant};
use tracing::{debug, info, trace};

use crate::colocation::{
    Affects, MergeOptions, NodeScoreMerger, apply_coloc_to_weights, colocation_affects,
    verify_colocations,
};
use crate::constraints::{Colocation, ConstraintStore, cmp_resources};
use crate::promotion;

/// Build every resource's allowed-node table from node availability and
/// location constraints, and reset per-run scheduling state.
///
/// Location constraints on a parent apply to its children as well.
/// Role-restricted constraints are left to the promotion engine.
pub fn init_allowed_nodes(state: &mut ClusterState, diags: &mut Diagnostics) {
    let symmetric = state.options.symmetric_cluster;
    let all_nodes: Vec<NodeIdx> = state.nodes().map(|(idx, _)| idx).collect();

    for i in 0..state.resource_count() {
        let rsc = RscIdx(i);
        let mut table: NodeWeights = if symmetric {
            all_nodes.iter().map(|node| (*node, 0)).collect()
        } else {
            NodeWeights::new()
        };

        let mut owner = Some(rsc);
        while let Some(current) = owner {
            let r = state.resource(current);
            let locations = r
                .locations
                .iter()
                .filter(|l| l.role.is_none_or(|role| role.as_filter() == Role::Unknown));
            for loc in locations {
                let entry = table.entry_or_insert(loc.node, 0);
                entry.weight = diags.add_scores(entry.weight, loc.score);
            }
            owner = r.parent;
        }

        for node in table.nodes().collect::<Vec<_>>() {
            if !state.node_available(node) {
                table.set_weight(node, MINUS_INFINITY);
            }
        }

        let r = state.resource_mut(rsc);
        r.allowed_nodes = table;
        r.assigned_to = None;
        r.provisional = true;
        r.next_role = Role::Unknown;
        r.promotion_sort_key = 0;
    }
}

/// Assign every resource, then report mandatory colocations the result
/// violates.
pub fn assign_resources(
    state: &mut ClusterState,
    store: &mut ConstraintStore,
    diags: &mut Diagnostics,
) {
    let view: &ClusterState = state;
    let mut top = view.top_level();
    top.sort_by(|a, b| cmp_resources(view, *a, *b));

    let mut assigner = Assigner::new(state, store, diags);
    for rsc in top {
        assigner.assign(rsc);
    }
    verify_colocations(assigner.state, assigner.store, assigner.diags);
}

pub struct Assigner<'a> {
    state: &'a mut ClusterState,
    store: &'a mut ConstraintStore,
    diags: &'a mut Diagnostics,
    in_progress: BTreeSet<RscIdx>,
}

impl<'a> Assigner<'a> {
    pub fn new(
        state: &'a mut ClusterState,
        store: &'a mut ConstraintStore,
        diags: &'a mut Diagnostics,
    ) -> Self {
        Self {
            state,
            store,
            diags,
            in_progress: BTreeSet::new(),
        }
    }

    /// Assign `rsc` (and its whole tree) if it is still provisional.
    pub fn assign(&mut self, rsc: RscIdx) -> Option<NodeIdx> {
        let top = self.state.top_parent(rsc);
        if top != rsc {
            self.assign(top);
            return self.state.resource(rsc).assigned_to;
        }

        let r = self.state.resource(rsc);
        if !r.provisional {
            return r.assigned_to;
        }
        if !self.in_progress.insert(rsc) {
            trace!(rsc = %r.id, "assignment dependency loop");
            return None;
        }

        let node = match r.variant {
            RscVariant::Primitive => self.assign_primitive(rsc),
            RscVariant::Group => self.assign_group(rsc),
            RscVariant::Clone | RscVariant::Bundle => {
                self.assign_clone(rsc);
                None
            }
        };
        self.in_progress.remove(&rsc);
        node
    }

    fn assign_primitive(&mut self, rsc: RscIdx) -> Option<NodeIdx> {
        self.assign_primaries(rsc);
        self.apply_location_colocations(rsc, rsc);
        self.apply_dependent_influence(rsc, rsc);

        let node = self.pinned_node(rsc).or_else(|| self.choose_node(rsc, None));
        self.commit(rsc, node);
        node
    }

    fn assign_group(&mut self, grp: RscIdx) -> Option<NodeIdx> {
        let members = self.state.resource(grp).children.clone();
        self.assign_primaries(grp);
        for member in &members {
            self.assign_primaries(*member);
        }

        self.build_group_table(grp);
        self.apply_location_colocations(grp, grp);
        self.apply_dependent_influence(grp, grp);
        for member in &members {
            self.apply_location_colocations(*member, grp);
            self.apply_dependent_influence(*member, grp);
        }

        let node = self.pinned_node(grp).or_else(|| self.choose_node(grp, None));
        self.commit_group(grp, node);
        node
    }

    fn assign_clone(&mut self, clone: RscIdx) {
        let mut instances = self.state.resource(clone).children.clone();
        self.assign_primaries(clone);

        for inst in &instances {
            if self.state.resource(*inst).variant == RscVariant::Group {
                self.build_group_table(*inst);
            }
        }

        let colocs = self.colocations_of(clone);
        for coloc in &colocs {
            if colocation_affects(self.state, coloc, false, self.diags) != Affects::Location {
                continue;
            }
            apply_coloc_to_weights(self.state, self.diags, clone, coloc);
            for inst in &instances {
                apply_coloc_to_weights(self.state, self.diags, *inst, coloc);
            }
        }
        self.apply_dependent_influence(clone, clone);
        for inst in &instances {
            self.apply_dependent_influence(clone, *inst);
        }

        // Active instances choose first so they can stay where they are.
        instances.sort_by_key(|inst| {
            let r = self.state.resource(*inst);
            (!r.is_active(), r.id.clone())
        });
        self.state.resource_mut(clone).allowed_nodes.reset_counts();

        let mut any = false;
        for inst in instances {
            let node = self
                .pinned_node(inst)
                .or_else(|| self.choose_node(inst, Some(clone)));
            if let Some(node) = node {
                let weight = self.state.resource(inst).allowed_nodes.weight(node).unwrap_or(0);
                self.state
                    .resource_mut(clone)
                    .allowed_nodes
                    .entry_or_insert(node, weight)
                    .count += 1;
                any = true;
            }
            if self.state.resource(inst).variant == RscVariant::Group {
                self.commit_group(inst, node);
            } else {
                self.commit(inst, node);
            }
        }

        if self.state.resource(clone).is_promotable_clone() {
            promotion::promote_instances(self.state, self.store, self.diags, clone);
        }
        let r = self.state.resource_mut(clone);
        r.provisional = false;
        r.assigned_to = None;
        r.next_role = if any { Role::Started } else { Role::Stopped };
        debug!(clone = %r.id, "clone instances assigned");
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn colocations_of(&self, rsc: RscIdx) -> Vec<Colocation> {
        self.store
            .this_with(rsc)
            .iter()
            .map(|idx| self.store.colocation(*idx).clone())
            .collect()
    }

    fn assign_primaries(&mut self, rsc: RscIdx) {
        let primaries: Vec<RscIdx> = self
            .store
            .this_with(rsc)
            .iter()
            .map(|idx| self.store.colocation(*idx).primary)
            .collect();
        for primary in primaries {
            self.assign(primary);
        }
    }

    /// Apply `owner`'s location-affecting colocations to `target`'s table.
    fn apply_location_colocations(&mut self, owner: RscIdx, target: RscIdx) {
        for coloc in self.colocations_of(owner) {
            if colocation_affects(self.state, &coloc, false, self.diags) == Affects::Location {
                apply_coloc_to_weights(self.state, self.diags, target, &coloc);
            }
        }
    }

    /// Let resources colocated with `owner` pull `target`'s table toward
    /// the nodes they prefer.
    fn apply_dependent_influence(&mut self, owner: RscIdx, target: RscIdx) {
        let colocs: Vec<Colocation> = self
            .store
            .with_this(owner)
            .iter()
            .map(|idx| self.store.colocation(*idx).clone())
            .filter(|coloc| coloc.influence)
            .collect();
        if colocs.is_empty() {
            return;
        }
        let mut table = std::mem::take(&mut self.state.resource_mut(target).allowed_nodes);
        if !table.is_empty() {
            for coloc in &colocs {
                let factor = coloc.score as f32 / SCORE_INFINITY as f32;
                NodeScoreMerger::new(self.state, self.store)
                    .exclude(owner)
                    .exclude(target)
                    .add(
                        self.diags,
                        coloc.dependent,
                        &mut table,
                        &coloc.node_attribute,
                        factor,
                        MergeOptions {
                            rollback: true,
                            ..MergeOptions::default()
                        },
                    );
            }
        }
        self.state.resource_mut(target).allowed_nodes = table;
    }

    /// Sum of the group's own table and its members' own location constraints.
    fn build_group_table(&mut self, grp: RscIdx) {
        let mut table = self.state.resource(grp).allowed_nodes.clone();
        for member in self.state.resource(grp).children.clone() {
            let locations = self.state.resource(member).locations.clone();
            for loc in locations
                .iter()
                .filter(|l| l.role.is_none_or(|role| role.as_filter() == Role::Unknown))
            {
                if !table.contains(loc.node) && self.state.options.symmetric_cluster {
                    continue;
                }
                let entry = table.entry_or_insert(loc.node, 0);
                entry.weight = self.diags.add_scores(entry.weight, loc.score);
            }
        }
        self.state.resource_mut(grp).allowed_nodes = table;
    }

    /// Unmanaged resources stay where they are.
    fn pinned_node(&self, rsc: RscIdx) -> Option<NodeIdx> {
        let r = self.state.resource(rsc);
        if r.flags.managed {
            return None;
        }
        r.current_node()
    }

    /// Best node for `rsc`: highest weight at or above zero on an available
    /// node, then the current node, then (for clone instances) the least
    /// loaded node, then the node name.
    fn choose_node(&self, rsc: RscIdx, clone: Option<RscIdx>) -> Option<NodeIdx> {
        let state = &*self.state;
        let r = state.resource(rsc);
        let current = r.current_node();
        let count_on = |node: NodeIdx| -> u32 {
            clone
                .and_then(|c| state.resource(c).allowed_nodes.get(node))
                .map_or(0, |w| w.count)
        };
        let node_max = clone.map_or(u32::MAX, |c| state.resource(c).clone_node_max);

        r.allowed_nodes
            .iter()
            .filter(|(node, w)| !w.unusable && w.weight >= 0 && state.node_available(**node))
            .filter(|(node, _)| count_on(**node) < node_max)
            .max_by_key(|(node, w)| {
                (
                    w.weight,
                    Some(**node) == current,
                    Reverse(count_on(**node)),
                    Reverse(state.node(**node).name.clone()),
                )
            })
            .map(|(node, _)| *node)
    }

    fn commit(&mut self, rsc: RscIdx, node: Option<NodeIdx>) {
        let name = node.map(|n| self.state.node(n).name.clone());
        let r = self.state.resource_mut(rsc);
        r.assigned_to = node;
        r.provisional = false;
        r.next_role = if node.is_some() { Role::Started } else { Role::Stopped };
        match name {
            Some(name) => debug!(rsc = %r.id, node = %name, "assigned"),
            None => info!(rsc = %r.id, "cannot run anywhere"),
        }
    }

    /// Assign a group and its members; a member that cannot run on the
    /// group's node stops, and so does every member after it.
    fn commit_group(&mut self, grp: RscIdx, node: Option<NodeIdx>) {
        self.commit(grp, node);
        let mut blocked = node.is_none();
        for member in self.state.resource(grp).children.clone() {
            let member_node = match node {
                Some(n) if !blocked => {
                    let ok = self
                        .state
                        .resource(member)
                        .allowed_nodes
                        .weight(n)
                        .is_some_and(|w| w >= 0);
                    ok.then_some(n)
                }
                _ => None,
            };
            blocked |= member_node.is_none();
            self.commit(member, member_node);
        }
    }
}
