//! Binding resource-level orderings to actions, and propagating flags.
//!
//! After binding, orderings are applied repeatedly until nothing changes:
//! required-ness flows along implication orderings and unrunnability flows
//! along runnable-first orderings. Starts of resources mandatorily
//! colocated with a resource that cannot start are blocked as well.

use std::collections::BTreeSet;

use hagrid_core::{INFINITY, Task};
use hagrid_placement::{OrderKind, OrderingConstraint};
use hagrid_state::RscIdx;
use tracing::{debug, trace};

use crate::action::{ActionIdx, ActionOrdering};
use crate::context::RunContext;

impl RunContext {
    /// Turn every recorded resource-level ordering into action orderings.
    pub fn bind_orderings(&mut self) {
        let orderings: Vec<OrderingConstraint> = self.store.orderings().to_vec();
        for o in &orderings {
            let firsts = self.actions.find_all(o.first, &o.first_task);
            let thens = self.actions.find_all(o.then, &o.then_task);
            if firsts.is_empty() || thens.is_empty() {
                trace!(
                    first = %self.state.resource(o.first).id,
                    then = %self.state.resource(o.then).id,
                    "ordering has no actions to bind"
                );
                continue;
            }
            for first in &firsts {
                for then in &thens {
                    if o.kind == OrderKind::AntiColocation && !self.share_node(*first, *then) {
                        continue;
                    }
                    self.actions.order(*first, *then, o.kind);
                }
            }
        }
        debug!(orderings = self.actions.orderings().len(), "orderings bound to actions");
    }

    fn share_node(&self, a: ActionIdx, b: ActionIdx) -> bool {
        match (self.actions.get(a).node(), self.actions.get(b).node()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        }
    }

    /// Apply orderings and colocation blocking until a fixpoint.
    ///
    /// Flags only ever move one way (optional to required, runnable to
    /// unrunnable), so this terminates.
    pub fn update_actions(&mut self) {
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            let orderings: Vec<ActionOrdering> = self.actions.orderings().to_vec();
            for ordering in orderings {
                changed |= self.apply_ordering(ordering);
            }
            changed |= self.block_colocated_starts();
            if !changed {
                break;
            }
        }
        debug!(rounds, "action flags settled");
    }

    fn apply_ordering(&mut self, o: ActionOrdering) -> bool {
        let first = self.actions.get(o.first).flags;
        let then = self.actions.get(o.then).flags;
        match o.kind {
            OrderKind::Ordered => false,
            OrderKind::FirstImpliesThen => {
                if first.optional || !then.optional {
                    return false;
                }
                let reason = format!("required by {}", self.action_uuid(o.first));
                let action = self.actions.get_mut(o.then);
                action.flags.optional = false;
                action.set_reason(&reason, false);
                true
            }
            OrderKind::ThenImpliesFirst => {
                if then.optional || !first.optional {
                    return false;
                }
                let reason = format!("required by {}", self.action_uuid(o.then));
                let action = self.actions.get_mut(o.first);
                action.flags.optional = false;
                action.set_reason(&reason, false);
                true
            }
            OrderKind::RunnableFirst => {
                if first.runnable || !then.runnable {
                    return false;
                }
                self.block(o.then, &format!("{} is unrunnable", self.action_uuid(o.first)))
            }
            OrderKind::AntiColocation => {
                if first.optional || first.runnable || !then.runnable {
                    return false;
                }
                self.block(o.then, &format!("{} cannot give up its role", self.action_uuid(o.first)))
            }
        }
    }

    fn block(&mut self, idx: ActionIdx, reason: &str) -> bool {
        let action = self.actions.get_mut(idx);
        if !action.flags.runnable {
            return false;
        }
        action.flags.runnable = false;
        action.set_reason(reason, false);
        trace!(action = %self.action_uuid(idx), reason, "blocked");
        true
    }

    /// Block starts of resources mandatorily colocated with a resource
    /// whose every start is unrunnable.
    fn block_colocated_starts(&mut self) -> bool {
        let tops: BTreeSet<RscIdx> = self
            .actions
            .iter()
            .filter(|a| *a.task() == Task::Start && !a.flags.runnable && !a.flags.pseudo)
            .filter_map(|a| a.rsc())
            .map(|rsc| self.state.top_parent(rsc))
            .collect();

        let mut changed = false;
        for top in tops {
            if !self.cannot_start_anywhere(top) {
                continue;
            }
            let dependents: Vec<RscIdx> = self
                .store
                .with_this(top)
                .iter()
                .map(|idx| self.store.colocation(*idx))
                .filter(|c| c.score >= INFINITY)
                .map(|c| c.dependent)
                .collect();
            let primary = self.state.resource(top).id.clone();
            for dependent in dependents {
                changed |= self.block_starts(dependent, &format!("colocation with {primary}"));
            }
        }
        changed
    }

    /// Whether no child of `rsc` (or `rsc` itself) has a runnable start.
    fn cannot_start_anywhere(&self, rsc: RscIdx) -> bool {
        let children = &self.state.resource(rsc).children;
        let units: Vec<RscIdx> = if children.is_empty() { vec![rsc] } else { children.clone() };
        units.iter().all(|unit| {
            let starts: Vec<ActionIdx> = self
                .state
                .primitives(*unit)
                .into_iter()
                .flat_map(|p| self.actions.find_all(p, &Task::Start))
                .collect();
            !starts.is_empty() && starts.iter().all(|s| !self.actions.get(*s).flags.runnable)
        })
    }

    fn block_starts(&mut self, rsc: RscIdx, reason: &str) -> bool {
        let mut subtree = vec![rsc];
        let mut i = 0;
        while i < subtree.len() {
            let children = self.state.resource(subtree[i]).children.clone();
            subtree.extend(children);
            i += 1;
        }
        let starts: Vec<ActionIdx> = subtree
            .into_iter()
            .flat_map(|r| self.actions.find_all(r, &Task::Start))
            .collect();
        let mut changed = false;
        for start in starts {
            changed |= self.block(start, reason);
        }
        changed
    }
}
