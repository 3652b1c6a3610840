//! Unpacking declared colocations into constraint-store records.
//!
//! A declared colocation is either a simple pair (`rsc` with `with-rsc`,
//! optionally naming clone instances) or a list of resource sets. A pair
//! that names a tag or template is rewritten into non-sequential sets,
//! which cross-join every member of one side with every member of the
//! other.
//!
//! Any problem with one declaration drops that declaration only; the
//! error is recorded as a configuration diagnostic.

use hagrid_core::{Diagnostics, Role, Score, parse_score};
use hagrid_state::{ClusterState, ColocationSpec, ResourceSetSpec, RscIdx};
use tracing::debug;

use crate::constraints::{ConstraintStore, NewColocation};
use crate::error::{PlacementError, PlacementResult};

/// Unpack every declared colocation.
pub fn unpack_colocations(
    state: &ClusterState,
    store: &mut ConstraintStore,
    diags: &mut Diagnostics,
    specs: &[ColocationSpec],
) {
    for spec in specs {
        if let Err(err) = unpack_colocation(state, store, diags, spec) {
            diags.config_error(spec.id.as_str(), format!("ignoring colocation '{}': {err}", spec.id));
        }
    }
}

pub fn unpack_colocation(
    state: &ClusterState,
    store: &mut ConstraintStore,
    diags: &mut Diagnostics,
    spec: &ColocationSpec,
) -> PlacementResult<()> {
    let score = spec
        .score
        .as_deref()
        .map(|s| parse_score(s, &state.options))
        .unwrap_or(0);

    let sets = if !spec.resource_sets.is_empty() {
        spec.resource_sets
            .iter()
            .map(|set| resolve_set(state, set))
            .collect::<PlacementResult<Vec<_>>>()?
    } else {
        match references_as_sets(state, spec)? {
            Some(sets) => sets,
            None => return unpack_simple(state, store, diags, spec, score),
        }
    };

    let mut unpacker = SetUnpacker {
        state,
        store,
        diags,
        id: &spec.id,
        node_attribute: spec.node_attribute.as_deref(),
        influence: spec.influence,
    };
    let mut last: Option<&ResolvedSet> = None;
    for set in &sets {
        unpacker.unpack_set(set, score);
        if let Some(prev) = last {
            unpacker.join_sets(prev, set, score);
        }
        last = Some(set);
    }
    Ok(())
}

// ── Simple pairs ─────────────────────────────────────────────────

fn unpack_simple(
    state: &ClusterState,
    store: &mut ConstraintStore,
    diags: &mut Diagnostics,
    spec: &ColocationSpec,
    score: Score,
) -> PlacementResult<()> {
    let (Some(rsc_id), Some(with_id)) = (spec.rsc.as_deref(), spec.with_rsc.as_deref()) else {
        return Err(PlacementError::EmptyConstraint);
    };
    let dependent = state
        .find_resource(rsc_id)
        .ok_or_else(|| PlacementError::MissingResource(rsc_id.to_string()))?;
    let primary = state
        .find_resource(with_id)
        .ok_or_else(|| PlacementError::MissingResource(with_id.to_string()))?;

    let dependent = match spec.rsc_instance.as_deref() {
        Some(instance) => find_instance(state, dependent, instance)?,
        None => dependent,
    };
    let primary = match spec.with_rsc_instance.as_deref() {
        Some(instance) => find_instance(state, primary, instance)?,
        None => primary,
    };

    let influence = spec
        .influence
        .unwrap_or(state.resource(dependent).flags.critical);
    store.new_colocation(
        state,
        diags,
        NewColocation {
            id: spec.id.clone(),
            node_attribute: spec.node_attribute.clone(),
            score,
            dependent: Some(dependent),
            primary: Some(primary),
            dependent_role: parse_role(spec.rsc_role.as_deref())?,
            primary_role: parse_role(spec.with_rsc_role.as_deref())?,
            influence,
        },
    );
    Ok(())
}

/// Resolve `rsc-instance` style references to one instance of a clone.
fn find_instance(state: &ClusterState, clone: RscIdx, instance: &str) -> PlacementResult<RscIdx> {
    let rsc = state.resource(clone);
    if !rsc.variant.is_collective() {
        return Err(PlacementError::NotAClone(rsc.id.clone()));
    }
    let suffix = format!(":{instance}");
    rsc.children
        .iter()
        .copied()
        .find(|child| state.resource(*child).id.ends_with(&suffix))
        .ok_or_else(|| PlacementError::NoSuchInstance {
            rsc: rsc.id.clone(),
            instance: instance.to_string(),
        })
}

fn parse_role(text: Option<&str>) -> PlacementResult<Role> {
    match text {
        None => Ok(Role::Unknown),
        Some(text) => text
            .parse::<Role>()
            .map(Role::as_filter)
            .map_err(|_| PlacementError::InvalidRole(text.to_string())),
    }
}

/// Rewrite a pair naming a tag or template as two non-sequential sets.
///
/// Returns `None` when neither side is a reference.
fn references_as_sets(
    state: &ClusterState,
    spec: &ColocationSpec,
) -> PlacementResult<Option<Vec<ResolvedSet>>> {
    let (Some(rsc_id), Some(with_id)) = (spec.rsc.as_deref(), spec.with_rsc.as_deref()) else {
        return Ok(None);
    };
    let rsc_is_ref = state.find_resource(rsc_id).is_none() && state.is_reference(rsc_id);
    let with_is_ref = state.find_resource(with_id).is_none() && state.is_reference(with_id);
    match (rsc_is_ref, with_is_ref) {
        (false, false) => Ok(None),
        (true, true) => Err(PlacementError::ReferencesColocated),
        _ => {
            let side = |id: &str, role: Option<&str>| -> PlacementResult<ResolvedSet> {
                Ok(ResolvedSet {
                    id: format!("{}-{id}", spec.id),
                    members: resolve_member(state, id)?,
                    sequential: false,
                    ordering_group: true,
                    role: parse_role(role)?,
                    score: None,
                })
            };
            Ok(Some(vec![
                side(rsc_id, spec.rsc_role.as_deref())?,
                side(with_id, spec.with_rsc_role.as_deref())?,
            ]))
        }
    }
}

// ── Resource sets ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ResolvedSet {
    id: String,
    members: Vec<RscIdx>,
    sequential: bool,
    /// `ordering="group"` (the default) rather than `"listed"`.
    ordering_group: bool,
    role: Role,
    score: Option<Score>,
}

fn resolve_member(state: &ClusterState, id: &str) -> PlacementResult<Vec<RscIdx>> {
    if let Some(rsc) = state.find_resource(id) {
        return Ok(vec![rsc]);
    }
    state
        .expand_reference(id)
        .map(<[RscIdx]>::to_vec)
        .ok_or_else(|| PlacementError::MissingResource(id.to_string()))
}

fn resolve_set(state: &ClusterState, set: &ResourceSetSpec) -> PlacementResult<ResolvedSet> {
    let mut members = Vec::new();
    for id in &set.resources {
        members.extend(resolve_member(state, id)?);
    }
    Ok(ResolvedSet {
        id: set.id.clone(),
        members,
        sequential: set.sequential.unwrap_or(true),
        ordering_group: set.ordering.as_deref().is_none_or(|o| o == "group"),
        role: parse_role(set.role.as_deref())?,
        score: set.score.as_deref().map(|s| parse_score(s, &state.options)),
    })
}

struct SetUnpacker<'a> {
    state: &'a ClusterState,
    store: &'a mut ConstraintStore,
    diags: &'a mut Diagnostics,
    id: &'a str,
    node_attribute: Option<&'a str>,
    influence: Option<bool>,
}

impl SetUnpacker<'_> {
    fn add_pair(
        &mut self,
        id: &str,
        score: Score,
        (dependent, dependent_role): (RscIdx, Role),
        (primary, primary_role): (RscIdx, Role),
    ) {
        let influence = self
            .influence
            .unwrap_or(self.state.resource(dependent).flags.critical);
        self.store.new_colocation(
            self.state,
            self.diags,
            NewColocation {
                id: id.to_string(),
                node_attribute: self.node_attribute.map(str::to_string),
                score,
                dependent: Some(dependent),
                primary: Some(primary),
                dependent_role,
                primary_role,
                influence,
            },
        );
    }

    /// Colocations among the members of one set.
    fn unpack_set(&mut self, set: &ResolvedSet, score: Score) {
        let score = set.score.unwrap_or(score);
        if score == 0 || !set.sequential {
            debug!(set = %set.id, "set produces no internal colocations");
            return;
        }
        let role = set.role;

        if score > 0 && set.ordering_group {
            // Each member with the one before it.
            for pair in set.members.windows(2) {
                self.add_pair(&set.id, score, (pair[1], role), (pair[0], role));
            }
        } else if score > 0 {
            // The last-seen member with each following one.
            let mut last: Option<RscIdx> = None;
            for &rsc in &set.members {
                if let Some(prev) = last {
                    self.add_pair(&set.id, score, (prev, role), (rsc, role));
                }
                last = Some(rsc);
            }
        } else {
            // Mutual exclusion: every member against every earlier one.
            for (i, &rsc) in set.members.iter().enumerate() {
                for &prior in &set.members[..i] {
                    self.add_pair(&set.id, score, (rsc, role), (prior, role));
                }
            }
        }
    }

    /// Colocations joining two adjacent sets; members of `set1` depend on `set2`.
    fn join_sets(&mut self, set1: &ResolvedSet, set2: &ResolvedSet, score: Score) {
        if score == 0 {
            return;
        }
        let id = self.id;
        let rsc_1 = set1.sequential.then(|| set1.members.first().copied()).flatten();
        let rsc_2 = set2.sequential.then(|| set2.members.last().copied()).flatten();
        let (role_1, role_2) = (set1.role, set2.role);

        match (rsc_1, rsc_2) {
            (Some(rsc_1), Some(rsc_2)) => {
                self.add_pair(id, score, (rsc_1, role_1), (rsc_2, role_2));
            }
            (Some(rsc_1), None) => {
                for &rsc in &set2.members {
                    self.add_pair(id, score, (rsc_1, role_1), (rsc, role_2));
                }
            }
            (None, Some(rsc_2)) => {
                for &rsc in &set1.members {
                    self.add_pair(id, score, (rsc, role_1), (rsc_2, role_2));
                }
            }
            (None, None) => {
                for &a in &set1.members {
                    for &b in &set2.members {
                        self.add_pair(id, score, (a, role_1), (b, role_2));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hagrid_core::{ClusterOptions, DiagnosticKind, INFINITY, MINUS_INFINITY};
    use hagrid_state::{Resource, RscVariant};

    fn make_state(ids: &[&str]) -> ClusterState {
        let mut state = ClusterState::new(ClusterOptions::default());
        for id in ids {
            state.add_resource(Resource::new(*id, RscVariant::Primitive), None).unwrap();
        }
        state
    }

    fn pair(id: &str, rsc: &str, with: &str, score: &str) -> ColocationSpec {
        ColocationSpec {
            id: id.to_string(),
            score: Some(score.to_string()),
            rsc: Some(rsc.to_string()),
            with_rsc: Some(with.to_string()),
            ..ColocationSpec::default()
        }
    }

    fn set(id: &str, members: &[&str]) -> ResourceSetSpec {
        ResourceSetSpec {
            id: id.to_string(),
            resources: members.iter().map(|m| m.to_string()).collect(),
            ..ResourceSetSpec::default()
        }
    }

    fn pairs(state: &ClusterState, store: &ConstraintStore) -> Vec<(String, String)> {
        store
            .colocations()
            .map(|(_, c)| {
                (
                    state.resource(c.dependent).id.clone(),
                    state.resource(c.primary).id.clone(),
                )
            })
            .collect()
    }

    fn unpack(state: &ClusterState, specs: &[ColocationSpec]) -> (ConstraintStore, Diagnostics) {
        let mut store = ConstraintStore::new();
        let mut diags = Diagnostics::new();
        unpack_colocations(state, &mut store, &mut diags, specs);
        (store, diags)
    }

    #[test]
    fn simple_pair() {
        let state = make_state(&["web", "ip"]);
        let mut spec = pair("c1", "web", "ip", "INFINITY");
        spec.rsc_role = Some("Started".to_string());
        let (store, diags) = unpack(&state, &[spec]);
        assert!(diags.is_empty());
        assert_eq!(pairs(&state, &store), vec![("web".into(), "ip".into())]);
        let (_, c) = store.colocations().next().unwrap();
        assert_eq!(c.score, INFINITY);
        assert_eq!(c.dependent_role, Role::Unknown);
        assert!(c.influence);
    }

    #[test]
    fn missing_resource_drops_constraint() {
        let state = make_state(&["web"]);
        let (store, diags) = unpack(&state, &[pair("c1", "web", "nope", "10")]);
        assert!(store.is_empty());
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn invalid_role_drops_constraint() {
        let state = make_state(&["a", "b"]);
        let mut spec = pair("c1", "a", "b", "10");
        spec.with_rsc_role = Some("Leader".to_string());
        let (store, diags) = unpack(&state, &[spec]);
        assert!(store.is_empty());
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn instance_requires_clone() {
        let state = make_state(&["a", "b"]);
        let mut spec = pair("c1", "a", "b", "10");
        spec.rsc_instance = Some("1".to_string());
        let (store, diags) = unpack(&state, &[spec]);
        assert!(store.is_empty());
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn instance_resolves_to_clone_child() {
        let mut state = make_state(&["a"]);
        let clone = state.add_resource(Resource::new("db-clone", RscVariant::Clone), None).unwrap();
        state.add_resource(Resource::new("db:0", RscVariant::Primitive), Some(clone)).unwrap();
        state.add_resource(Resource::new("db:1", RscVariant::Primitive), Some(clone)).unwrap();
        let mut spec = pair("c1", "a", "db-clone", "10");
        spec.with_rsc_instance = Some("1".to_string());
        let (store, _) = unpack(&state, &[spec]);
        assert_eq!(pairs(&state, &store), vec![("a".into(), "db:1".into())]);
    }

    #[test]
    fn group_ordered_set_chains_members() {
        let state = make_state(&["a", "b", "c"]);
        let spec = ColocationSpec {
            id: "chain".to_string(),
            score: Some("INFINITY".to_string()),
            resource_sets: vec![set("s1", &["a", "b", "c"])],
            ..ColocationSpec::default()
        };
        let (store, _) = unpack(&state, &[spec]);
        let mut got = pairs(&state, &store);
        got.sort();
        assert_eq!(got, vec![("b".into(), "a".into()), ("c".into(), "b".into())]);
    }

    #[test]
    fn listed_set_uses_last_seen_member() {
        let state = make_state(&["a", "b", "c"]);
        let mut s = set("s1", &["a", "b", "c"]);
        s.ordering = Some("listed".to_string());
        let spec = ColocationSpec {
            id: "star".to_string(),
            score: Some("50".to_string()),
            resource_sets: vec![s],
            ..ColocationSpec::default()
        };
        let (store, _) = unpack(&state, &[spec]);
        let mut got = pairs(&state, &store);
        got.sort();
        assert_eq!(got, vec![("a".into(), "b".into()), ("b".into(), "c".into())]);
    }

    #[test]
    fn negative_set_excludes_every_pair() {
        let state = make_state(&["a", "b", "c"]);
        let spec = ColocationSpec {
            id: "apart".to_string(),
            score: Some("-INFINITY".to_string()),
            resource_sets: vec![set("s1", &["a", "b", "c"])],
            ..ColocationSpec::default()
        };
        let (store, _) = unpack(&state, &[spec]);
        assert_eq!(store.len(), 3);
        assert!(store.colocations().all(|(_, c)| c.score == MINUS_INFINITY));
        // Each anti-colocation orders both directions.
        assert_eq!(store.orderings().len(), 6);
    }

    #[test]
    fn non_sequential_set_alone_produces_nothing() {
        let state = make_state(&["a", "b"]);
        let mut s = set("s1", &["a", "b"]);
        s.sequential = Some(false);
        let spec = ColocationSpec {
            id: "loose".to_string(),
            score: Some("INFINITY".to_string()),
            resource_sets: vec![s],
            ..ColocationSpec::default()
        };
        let (store, diags) = unpack(&state, &[spec]);
        assert!(store.is_empty());
        assert!(diags.is_empty());
    }

    #[test]
    fn per_set_score_overrides_constraint_score() {
        let state = make_state(&["a", "b"]);
        let mut s = set("s1", &["a", "b"]);
        s.score = Some("7".to_string());
        let spec = ColocationSpec {
            id: "c".to_string(),
            score: Some("INFINITY".to_string()),
            resource_sets: vec![s],
            ..ColocationSpec::default()
        };
        let (store, _) = unpack(&state, &[spec]);
        let (_, c) = store.colocations().next().unwrap();
        assert_eq!(c.score, 7);
    }

    #[test]
    fn sequential_sets_join_first_with_last() {
        let state = make_state(&["a", "b", "c", "d"]);
        let spec = ColocationSpec {
            id: "join".to_string(),
            score: Some("INFINITY".to_string()),
            resource_sets: vec![set("s1", &["a", "b"]), set("s2", &["c", "d"])],
            ..ColocationSpec::default()
        };
        let (store, _) = unpack(&state, &[spec]);
        let got = pairs(&state, &store);
        assert!(got.contains(&("a".into(), "d".into())));
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn missing_set_member_drops_whole_constraint() {
        let state = make_state(&["a", "b"]);
        let spec = ColocationSpec {
            id: "broken".to_string(),
            score: Some("INFINITY".to_string()),
            resource_sets: vec![set("s1", &["a", "b", "ghost"])],
            ..ColocationSpec::default()
        };
        let (store, diags) = unpack(&state, &[spec]);
        assert!(store.is_empty());
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn tag_cross_joins_members() {
        let mut state = make_state(&["web1", "web2", "ip"]);
        let members = vec![state.find_resource("web1").unwrap(), state.find_resource("web2").unwrap()];
        state.add_reference("webs", members);
        let (store, diags) = unpack(&state, &[pair("c1", "webs", "ip", "100")]);
        assert!(diags.is_empty());
        let mut got = pairs(&state, &store);
        got.sort();
        assert_eq!(got, vec![("web1".into(), "ip".into()), ("web2".into(), "ip".into())]);
    }

    #[test]
    fn two_tags_cannot_be_colocated() {
        let mut state = make_state(&["a", "b"]);
        let a = state.find_resource("a").unwrap();
        let b = state.find_resource("b").unwrap();
        state.add_reference("left", vec![a]);
        state.add_reference("right", vec![b]);
        let (store, diags) = unpack(&state, &[pair("c1", "left", "right", "100")]);
        assert!(store.is_empty());
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn influence_defaults_to_critical_flag() {
        let mut state = make_state(&["a", "b"]);
        let a = state.find_resource("a").unwrap();
        state.resource_mut(a).flags.critical = false;
        let (store, _) = unpack(&state, &[pair("c1", "a", "b", "10")]);
        let (_, c) = store.colocations().next().unwrap();
        assert!(!c.influence);
    }
}
