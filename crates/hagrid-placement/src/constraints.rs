//! Constraint store — colocation and ordering records for one run.
//!
//! Colocations live in an arena. Each resource keeps two index lists into
//! it: `this_with` (colocations where it is the dependent, sorted by
//! primary priority) and `with_this` (where it is the primary, sorted by
//! dependent priority). Both lists are kept sorted on insertion so every
//! consumer walks them in the same deterministic order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use hagrid_core::{Diagnostics, MINUS_INFINITY, Role, Score, Task, readable_score};
use hagrid_state::{ATTR_UNAME, ClusterState, RscIdx, RscVariant};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Index of a colocation in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColocIdx(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Colocation {
    pub id: String,
    pub dependent: RscIdx,
    pub primary: RscIdx,
    pub score: Score,
    /// `Unknown` means any role.
    pub dependent_role: Role,
    pub primary_role: Role,
    /// Node attribute compared instead of node identity.
    pub node_attribute: String,
    /// Whether the dependent may pull the primary toward itself.
    pub influence: bool,
}

/// Request for a new colocation. Unresolved resources are `None`.
#[derive(Debug, Clone)]
pub struct NewColocation {
    pub id: String,
    pub node_attribute: Option<String>,
    pub score: Score,
    pub dependent: Option<RscIdx>,
    pub primary: Option<RscIdx>,
    pub dependent_role: Role,
    pub primary_role: Role,
    pub influence: bool,
}

/// How the `first` action of an ordering affects the `then` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// `then` waits for `first` if both happen.
    Ordered,
    /// `then` is required whenever `first` is.
    FirstImpliesThen,
    /// `first` is required whenever `then` is.
    ThenImpliesFirst,
    /// `then` cannot run unless `first` can.
    RunnableFirst,
    /// `first` gives up a role `then` is about to take on a shared node.
    AntiColocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingConstraint {
    pub first: RscIdx,
    pub first_task: Task,
    pub then: RscIdx,
    pub then_task: Task,
    pub kind: OrderKind,
}

#[derive(Debug, Default)]
pub struct ConstraintStore {
    colocations: Vec<Colocation>,
    this_with: BTreeMap<RscIdx, Vec<ColocIdx>>,
    with_this: BTreeMap<RscIdx, Vec<ColocIdx>>,
    orderings: Vec<OrderingConstraint>,
}

impl ConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Colocations ────────────────────────────────────────────────

    /// Record a colocation.
    ///
    /// A score of 0 is a no-op and is not stored. A constraint naming a
    /// missing resource is reported and dropped. Anti-colocations
    /// (`score <= -INFINITY`) also add the orderings that keep the two
    /// resources from ever holding the filtered roles on one node at once.
    pub fn new_colocation(
        &mut self,
        state: &ClusterState,
        diags: &mut Diagnostics,
        def: NewColocation,
    ) -> Option<ColocIdx> {
        if def.score == 0 {
            trace!(constraint = %def.id, "ignoring colocation with score 0");
            return None;
        }
        let (Some(dependent), Some(primary)) = (def.dependent, def.primary) else {
            diags.config_error(
                def.id.as_str(),
                format!("ignoring colocation '{}' because resource does not exist", def.id),
            );
            return None;
        };

        let coloc = Colocation {
            id: def.id,
            dependent,
            primary,
            score: def.score,
            dependent_role: def.dependent_role.as_filter(),
            primary_role: def.primary_role.as_filter(),
            node_attribute: def.node_attribute.unwrap_or_else(|| ATTR_UNAME.to_string()),
            influence: def.influence,
        };
        debug!(
            constraint = %coloc.id,
            dependent = %state.resource(dependent).id,
            primary = %state.resource(primary).id,
            attribute = %coloc.node_attribute,
            score = %readable_score(coloc.score),
            "colocation added"
        );

        let idx = ColocIdx(self.colocations.len());
        let anti = coloc.score <= MINUS_INFINITY;
        let (dependent_role, primary_role) = (coloc.dependent_role, coloc.primary_role);
        self.colocations.push(coloc);

        let list = self.this_with.entry(dependent).or_default();
        let pos = insertion_point(list, |other| {
            cmp_primary_priority(state, &self.colocations[idx.0], &self.colocations[other.0])
        });
        list.insert(pos, idx);

        let list = self.with_this.entry(primary).or_default();
        let pos = insertion_point(list, |other| {
            cmp_dependent_priority(state, &self.colocations[idx.0], &self.colocations[other.0])
        });
        list.insert(pos, idx);

        if anti {
            self.anti_colocation_order(dependent, dependent_role, primary, primary_role);
            self.anti_colocation_order(primary, primary_role, dependent, dependent_role);
        }
        Some(idx)
    }

    pub fn colocation(&self, idx: ColocIdx) -> &Colocation {
        &self.colocations[idx.0]
    }

    pub fn colocations(&self) -> impl Iterator<Item = (ColocIdx, &Colocation)> {
        self.colocations
            .iter()
            .enumerate()
            .map(|(i, c)| (ColocIdx(i), c))
    }

    pub fn len(&self) -> usize {
        self.colocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colocations.is_empty()
    }

    /// Colocations with `rsc` as dependent.
    pub fn this_with(&self, rsc: RscIdx) -> &[ColocIdx] {
        self.this_with.get(&rsc).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Colocations with `rsc` as primary.
    pub fn with_this(&self, rsc: RscIdx) -> &[ColocIdx] {
        self.with_this.get(&rsc).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `this_with` of a resource followed by that of its collective parent.
    pub fn this_with_inherited(&self, state: &ClusterState, rsc: RscIdx) -> Vec<ColocIdx> {
        let mut list = self.this_with(rsc).to_vec();
        if let Some(parent) = state.resource(rsc).parent {
            if state.resource(parent).variant.is_collective() {
                list.extend_from_slice(self.this_with(parent));
            }
        }
        list
    }

    // ── Orderings ──────────────────────────────────────────────────

    pub fn add_ordering(
        &mut self,
        first: RscIdx,
        first_task: Task,
        then: RscIdx,
        then_task: Task,
        kind: OrderKind,
    ) {
        let ordering = OrderingConstraint {
            first,
            first_task,
            then,
            then_task,
            kind,
        };
        if !self.orderings.contains(&ordering) {
            self.orderings.push(ordering);
        }
    }

    pub fn orderings(&self) -> &[OrderingConstraint] {
        &self.orderings
    }

    /// Order every action that makes `first` lose `first_role` before every
    /// action that makes `then` gain `then_role`.
    pub fn anti_colocation_order(
        &mut self,
        first: RscIdx,
        first_role: Role,
        then: RscIdx,
        then_role: Role,
    ) {
        let first_tasks: &[Task] = match first_role {
            Role::Promoted => &[Task::Demote],
            Role::Unpromoted => &[Task::Stop, Task::Promote],
            _ => &[Task::Stop],
        };
        let then_tasks: &[Task] = match then_role {
            Role::Promoted => &[Task::Promote],
            Role::Unpromoted => &[Task::Start, Task::Demote],
            _ => &[Task::Start],
        };
        for first_task in first_tasks {
            for then_task in then_tasks {
                self.add_ordering(
                    first,
                    first_task.clone(),
                    then,
                    then_task.clone(),
                    OrderKind::AntiColocation,
                );
            }
        }
    }
}

fn insertion_point(list: &[ColocIdx], mut cmp: impl FnMut(ColocIdx) -> Ordering) -> usize {
    list.iter()
        .position(|other| cmp(*other) == Ordering::Less)
        .unwrap_or(list.len())
}

/// Order resources for colocation processing.
///
/// Higher priority first, then collective variants before simpler ones,
/// promotable clones before other clones, and finally by id.
pub fn cmp_resources(state: &ClusterState, a: RscIdx, b: RscIdx) -> Ordering {
    let ra = state.resource(a);
    let rb = state.resource(b);
    rb.allocation_priority
        .cmp(&ra.allocation_priority)
        .then_with(|| rb.variant.rank().cmp(&ra.variant.rank()))
        .then_with(|| {
            if ra.variant == RscVariant::Clone && rb.variant == RscVariant::Clone {
                rb.flags.promotable.cmp(&ra.flags.promotable)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| ra.id.cmp(&rb.id))
}

pub fn cmp_dependent_priority(state: &ClusterState, a: &Colocation, b: &Colocation) -> Ordering {
    cmp_resources(state, a.dependent, b.dependent)
}

pub fn cmp_primary_priority(state: &ClusterState, a: &Colocation, b: &Colocation) -> Ordering {
    cmp_resources(state, a.primary, b.primary)
}
