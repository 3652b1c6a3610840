//! Resource actions: what each resource must do to reach its next role.
//!
//! Primitives get real actions (stop, demote, start, promote, recurring
//! monitors). Groups and clones get pseudo-actions that bracket their
//! children's actions, plus the internal orderings between them.

use hagrid_core::{Role, Task};
use hagrid_placement::OrderKind;
use hagrid_state::{NodeIdx, Resource, RscIdx, RscVariant};
use tracing::{debug, trace};

use crate::action::{ActionIdx, ActionKey};
use crate::context::RunContext;

impl RunContext {
    /// Create the actions of every resource.
    pub fn create_resource_actions(&mut self) {
        for rsc in self.state.top_level() {
            self.create_actions(rsc);
        }
        debug!(actions = self.actions.len(), "resource actions created");
    }

    fn create_actions(&mut self, rsc: RscIdx) {
        match self.state.resource(rsc).variant {
            RscVariant::Primitive => self.create_primitive_actions(rsc),
            RscVariant::Group => self.create_group_actions(rsc),
            RscVariant::Clone | RscVariant::Bundle => self.create_clone_actions(rsc),
        }
    }

    fn create_primitive_actions(&mut self, rsc: RscIdx) {
        let r = self.state.resource(rsc);
        let target = r.assigned_to;
        let running = r.history.running_on.clone();
        let current_role = r.history.role;
        let failed_here = target.is_some_and(|t| {
            running.contains(&t) && r.history.failcount.get(&t).is_some_and(|c| *c > 0)
        });
        let stays = !failed_here && target.is_some_and(|t| running.as_slice() == [t]);
        trace!(
            rsc = %r.id,
            current = %current_role,
            next = %r.next_role,
            stays,
            "creating primitive actions"
        );

        let start = target.map(|node| self.rsc_action(rsc, Task::Start, Some(node), stays));
        // A start may cap the next role (no-quorum-policy=demote).
        let next_role = self.state.resource(rsc).next_role;

        for node in &running {
            let stop = self.rsc_action(rsc, Task::Stop, Some(*node), stays);
            if current_role == Role::Promoted {
                let keep_promoted = stays && next_role == Role::Promoted;
                let demote = self.rsc_action(rsc, Task::Demote, Some(*node), keep_promoted);
                self.actions.order(demote, stop, OrderKind::Ordered);
            }
            if let Some(start) = start {
                self.actions.order(stop, start, OrderKind::Ordered);
                self.actions.order(stop, start, OrderKind::FirstImpliesThen);
            }
        }

        if failed_here {
            if let (Some(node), Some(start)) = (target, start) {
                self.recover_in_place(rsc, node, start);
            }
        }

        let Some(node) = target else {
            return;
        };
        let promote = (next_role == Role::Promoted).then(|| {
            let already = stays && current_role == Role::Promoted;
            self.rsc_action(rsc, Task::Promote, Some(node), already)
        });
        if let (Some(start), Some(promote)) = (start, promote) {
            self.actions.order(start, promote, OrderKind::Ordered);
            self.actions.order(start, promote, OrderKind::RunnableFirst);
        }

        self.create_recurring_monitors(rsc, node, stays && current_role == next_role, start, promote);
    }

    /// Clear a failed resource's history between its stop and restart.
    fn recover_in_place(&mut self, rsc: RscIdx, node: NodeIdx, start: ActionIdx) {
        debug!(rsc = %self.state.resource(rsc).id, "recovering failed resource in place");
        let delete = self.clear_resource_history(rsc, node);
        if let Some(stop) = self.actions.find(&ActionKey::new(Task::Stop, Some(rsc), Some(node))) {
            self.actions.order(stop, delete, OrderKind::Ordered);
        }
        self.actions.order(delete, start, OrderKind::Ordered);
    }

    fn create_recurring_monitors(
        &mut self,
        rsc: RscIdx,
        node: NodeIdx,
        role_unchanged: bool,
        start: Option<ActionIdx>,
        promote: Option<ActionIdx>,
    ) {
        let r = self.state.resource(rsc);
        let next_role = r.next_role;
        let intervals: Vec<u64> = r
            .operations
            .iter()
            .filter(|op| op.name == "monitor" && op.interval_ms > 0 && op.enabled)
            .filter(|op| match op.role {
                Some(Role::Promoted) => next_role == Role::Promoted,
                Some(Role::Unpromoted) => next_role == Role::Unpromoted,
                _ => next_role != Role::Promoted || !has_promoted_monitor(r),
            })
            .map(|op| op.interval_ms)
            .collect();

        for interval in intervals {
            let key = ActionKey::new(Task::Monitor, Some(rsc), Some(node)).with_interval(interval);
            let monitor = self.get_or_create_action(key, role_unchanged);
            for first in [start, promote].into_iter().flatten() {
                self.actions.order(first, monitor, OrderKind::Ordered);
                self.actions.order(first, monitor, OrderKind::RunnableFirst);
            }
        }
    }

    fn create_group_actions(&mut self, grp: RscIdx) {
        let members = self.state.resource(grp).children.clone();
        for member in &members {
            self.create_actions(*member);
        }
        self.create_collective_pseudo_actions(grp, &members, &[Task::Start, Task::Stop]);

        let mut prev: Option<RscIdx> = None;
        for member in members {
            self.store.add_ordering(grp, Task::Start, member, Task::Start, OrderKind::Ordered);
            self.store.add_ordering(member, Task::Start, grp, Task::Running, OrderKind::Ordered);
            self.store.add_ordering(member, Task::Start, grp, Task::Running, OrderKind::RunnableFirst);
            self.store.add_ordering(grp, Task::Stop, member, Task::Stop, OrderKind::Ordered);
            self.store.add_ordering(member, Task::Stop, grp, Task::Stopped, OrderKind::Ordered);
            if let Some(prev) = prev {
                self.store.add_ordering(prev, Task::Start, member, Task::Start, OrderKind::Ordered);
                self.store.add_ordering(prev, Task::Start, member, Task::Start, OrderKind::RunnableFirst);
                self.store.add_ordering(member, Task::Stop, prev, Task::Stop, OrderKind::Ordered);
            }
            prev = Some(member);
        }
        self.store.add_ordering(grp, Task::Start, grp, Task::Running, OrderKind::RunnableFirst);
        self.store.add_ordering(grp, Task::Stopped, grp, Task::Start, OrderKind::Ordered);
    }

    fn create_clone_actions(&mut self, clone: RscIdx) {
        let r = self.state.resource(clone);
        let instances = r.children.clone();
        let (ordered, promotable) = (r.flags.ordered, r.flags.promotable);
        for inst in &instances {
            self.create_actions(*inst);
        }

        let mut tasks = vec![Task::Start, Task::Stop];
        if promotable {
            tasks.extend([Task::Promote, Task::Demote]);
        }
        self.create_collective_pseudo_actions(clone, &instances, &tasks);

        let mut prev: Option<RscIdx> = None;
        for inst in instances {
            self.store.add_ordering(clone, Task::Start, inst, Task::Start, OrderKind::Ordered);
            self.store.add_ordering(inst, Task::Start, clone, Task::Running, OrderKind::Ordered);
            self.store.add_ordering(clone, Task::Stop, inst, Task::Stop, OrderKind::Ordered);
            self.store.add_ordering(inst, Task::Stop, clone, Task::Stopped, OrderKind::Ordered);
            if ordered {
                if let Some(prev) = prev {
                    self.store.add_ordering(prev, Task::Start, inst, Task::Start, OrderKind::Ordered);
                    self.store.add_ordering(inst, Task::Stop, prev, Task::Stop, OrderKind::Ordered);
                }
            }
            prev = Some(inst);
        }
        self.store.add_ordering(clone, Task::Start, clone, Task::Running, OrderKind::RunnableFirst);
        self.store.add_ordering(clone, Task::Stop, clone, Task::Stopped, OrderKind::RunnableFirst);
        self.store.add_ordering(clone, Task::Stopped, clone, Task::Start, OrderKind::Ordered);
    }

    /// `task` and completion pseudo-actions for a group or clone.
    ///
    /// They are required when any child's `task` is, and the completion
    /// is runnable when any child's `task` can run.
    fn create_collective_pseudo_actions(&mut self, rsc: RscIdx, children: &[RscIdx], tasks: &[Task]) {
        for task in tasks {
            let child_actions: Vec<ActionIdx> = children
                .iter()
                .flat_map(|child| self.actions.find_all(*child, task))
                .collect();
            let required = child_actions.iter().any(|a| self.actions.get(*a).is_required());
            let runnable = child_actions.iter().any(|a| {
                let action = self.actions.get(*a);
                action.flags.runnable && action.is_required()
            });

            let action = self.new_rsc_pseudo_action(rsc, task.clone(), !required, true);
            if let Some(done) = task.completion() {
                let completion = self.new_rsc_pseudo_action(rsc, done, !required, false);
                if runnable || !required {
                    self.actions.get_mut(completion).flags.runnable = true;
                }
                self.actions.order(action, completion, OrderKind::Ordered);
            }
        }
    }
}

fn has_promoted_monitor(rsc: &Resource) -> bool {
    rsc.operations.iter().any(|op| {
        op.name == "monitor" && op.interval_ms > 0 && op.enabled && op.role == Some(Role::Promoted)
    })
}
