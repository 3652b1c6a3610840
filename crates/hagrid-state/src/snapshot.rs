//! Snapshot documents and their materialization into a [`ClusterState`].
//!
//! A snapshot is a JSON document describing nodes, the resource tree,
//! tags, constraints and per-node operation history. Clones carry a
//! single template child which is expanded into `clone-max` instances
//! named `<child>:<n>`.

use std::collections::BTreeMap;
use std::path::Path;

use hagrid_core::{ClusterOptions, Role, parse_score};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::ClusterState;
use crate::types::*;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterSnapshot {
    pub options: ClusterOptions,
    pub status: StatusSpec,
    pub nodes: Vec<NodeSpec>,
    pub resources: Vec<ResourceSpec>,
    /// Tag name → ids of the tagged resources.
    pub tags: BTreeMap<String, Vec<String>>,
    pub constraints: ConstraintsSpec,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusSpec {
    #[serde(default = "default_true")]
    pub have_quorum: bool,
    #[serde(default)]
    pub dc: Option<String>,
}

impl Default for StatusSpec {
    fn default() -> Self {
        Self {
            have_quorum: true,
            dc: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: NodeVariant,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub unclean: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub shutdown: bool,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub remote_requires_reset: bool,
    /// Host node of a guest.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: RscVariant,
    /// `class[:provider]:type`, required for primitives.
    pub agent: Option<String>,
    pub template: Option<String>,
    pub params: BTreeMap<String, String>,
    pub private_params: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub operations: Vec<OpSpec>,
    pub children: Vec<ResourceSpec>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpSpec {
    pub name: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub on_fail: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub start_delay: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConstraintsSpec {
    pub locations: Vec<LocationSpec>,
    pub colocations: Vec<ColocationSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocationSpec {
    pub id: String,
    pub rsc: String,
    pub node: String,
    pub score: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// A colocation as configured: either a simple pair or a list of sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ColocationSpec {
    pub id: String,
    pub score: Option<String>,
    pub rsc: Option<String>,
    pub with_rsc: Option<String>,
    pub rsc_role: Option<String>,
    pub with_rsc_role: Option<String>,
    /// Restrict a clone dependent to one instance number.
    pub rsc_instance: Option<String>,
    pub with_rsc_instance: Option<String>,
    pub node_attribute: Option<String>,
    pub influence: Option<bool>,
    pub resource_sets: Vec<ResourceSetSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceSetSpec {
    pub id: String,
    pub resources: Vec<String>,
    pub sequential: Option<bool>,
    pub ordering: Option<String>,
    pub role: Option<String>,
    pub score: Option<String>,
}

/// Last recorded state of a resource on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryEntry {
    pub resource: String,
    pub node: String,
    pub role: String,
    #[serde(default)]
    pub failcount: u32,
    #[serde(default)]
    pub last_failure: Option<u64>,
}

impl ClusterSnapshot {
    pub fn from_json_str(content: &str) -> StateResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

// ── Materialization ──────────────────────────────────────────────

impl ClusterState {
    pub fn from_snapshot(snapshot: &ClusterSnapshot) -> StateResult<Self> {
        let mut state = ClusterState::new(snapshot.options.clone());
        state.have_quorum = snapshot.status.have_quorum;

        for spec in &snapshot.nodes {
            state.add_node(node_from_spec(spec))?;
        }
        for spec in &snapshot.nodes {
            if let Some(host) = &spec.host {
                let host = state
                    .find_node(host)
                    .ok_or_else(|| StateError::NodeNotFound(host.clone()))?;
                let idx = state
                    .find_node(&spec.id)
                    .ok_or_else(|| StateError::NodeNotFound(spec.id.clone()))?;
                state.node_mut(idx).host = Some(host);
            }
        }
        if let Some(dc) = &snapshot.status.dc {
            state.dc = Some(
                state
                    .find_node(dc)
                    .ok_or_else(|| StateError::NodeNotFound(dc.clone()))?,
            );
        }

        let mut templates: BTreeMap<String, Vec<RscIdx>> = BTreeMap::new();
        let mut containers: Vec<(RscIdx, String)> = Vec::new();
        for spec in &snapshot.resources {
            let mut loader = Loader {
                state: &mut state,
                templates: &mut templates,
                containers: &mut containers,
            };
            loader.load(spec, None, None)?;
        }
        for (rsc, container) in containers {
            let target = state
                .find_resource(&container)
                .ok_or_else(|| StateError::ResourceNotFound(container.clone()))?;
            state.resource_mut(rsc).container = Some(target);
        }
        for (name, members) in templates {
            state.add_reference(name, members);
        }
        for (tag, ids) in &snapshot.tags {
            let members = ids
                .iter()
                .map(|id| {
                    state
                        .find_resource(id)
                        .ok_or_else(|| StateError::ResourceNotFound(id.clone()))
                })
                .collect::<StateResult<Vec<_>>>()?;
            state.add_reference(tag.clone(), members);
        }

        for spec in &snapshot.constraints.locations {
            apply_location(&mut state, spec)?;
        }
        for entry in &snapshot.history {
            apply_history(&mut state, entry)?;
        }
        roll_up_history(&mut state);
        state.accumulate_node_priorities();

        debug!(
            nodes = state.node_count(),
            resources = state.resource_count(),
            "cluster state materialized"
        );
        Ok(state)
    }
}

fn node_from_spec(spec: &NodeSpec) -> Node {
    let mut node = Node::new(spec.id.clone());
    if let Some(name) = &spec.name {
        node.name = name.clone();
    }
    node.variant = spec.kind;
    node.online = spec.online;
    node.pending = spec.pending;
    node.unclean = spec.unclean;
    node.standby = spec.standby;
    node.shutdown = spec.shutdown;
    node.maintenance = spec.maintenance;
    node.remote_requires_reset = spec.remote_requires_reset;
    node.priority = spec.priority;
    node.attrs = spec.attributes.clone();
    node
}

struct Loader<'a> {
    state: &'a mut ClusterState,
    templates: &'a mut BTreeMap<String, Vec<RscIdx>>,
    containers: &'a mut Vec<(RscIdx, String)>,
}

impl Loader<'_> {
    fn load(
        &mut self,
        spec: &ResourceSpec,
        parent: Option<RscIdx>,
        instance: Option<u32>,
    ) -> StateResult<RscIdx> {
        let id = match instance {
            Some(n) => format!("{}:{n}", spec.id),
            None => spec.id.clone(),
        };
        let mut rsc = Resource::new(id.clone(), spec.kind);

        // Children inherit their parent's meta attributes unless they set their own.
        rsc.meta = spec.meta.clone();
        if let Some(p) = parent {
            for (key, value) in &self.state.resource(p).meta {
                rsc.meta.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        rsc.params = spec.params.clone();
        rsc.private_params = spec.private_params.iter().cloned().collect();
        if let Some(agent) = &spec.agent {
            rsc.agent = Some(Agent::parse(agent).ok_or_else(|| StateError::InvalidResource {
                id: id.clone(),
                reason: format!("bad agent \"{agent}\""),
            })?);
        } else if spec.kind == RscVariant::Primitive {
            return Err(StateError::InvalidResource {
                id,
                reason: "primitive without agent".to_string(),
            });
        }
        rsc.operations = spec
            .operations
            .iter()
            .map(op_from_spec)
            .collect::<StateResult<Vec<_>>>()?;
        self.unpack_meta(&mut rsc)?;

        let idx = self.state.add_resource(rsc, parent)?;
        if let Some(template) = &spec.template {
            self.templates.entry(template.clone()).or_default().push(idx);
        }
        if let Some(container) = &spec.container {
            self.containers.push((idx, container.clone()));
        }

        match spec.kind {
            RscVariant::Primitive => {
                if !spec.children.is_empty() {
                    return Err(StateError::InvalidResource {
                        id,
                        reason: "primitive with children".to_string(),
                    });
                }
            }
            RscVariant::Group => {
                for child in &spec.children {
                    self.load(child, Some(idx), instance)?;
                }
            }
            RscVariant::Clone | RscVariant::Bundle => {
                let [child] = spec.children.as_slice() else {
                    return Err(StateError::InvalidResource {
                        id,
                        reason: "collective resource needs exactly one child".to_string(),
                    });
                };
                let count = self.state.resource(idx).clone_max;
                for n in 0..count {
                    self.load(child, Some(idx), Some(n))?;
                }
            }
        }
        Ok(idx)
    }

    fn unpack_meta(&self, rsc: &mut Resource) -> StateResult<()> {
        let meta = rsc.meta.clone();
        rsc.allocation_priority = meta_int(&meta, &["priority"], 0)?;
        rsc.flags.managed = meta_bool(&meta, "is-managed", true)?;
        rsc.flags.unique = meta_bool(&meta, "globally-unique", false)?;
        rsc.flags.promotable = meta_bool(&meta, "promotable", false)?;
        rsc.flags.critical = meta_bool(&meta, "critical", true)?;
        rsc.flags.ordered = meta_bool(&meta, "ordered", false)?;

        if rsc.variant.is_collective() {
            let default_max = match rsc.variant {
                RscVariant::Bundle => 1,
                _ => i32::try_from(self.state.node_count()).unwrap_or(i32::MAX),
            };
            rsc.clone_max = non_negative(meta_int(&meta, &["clone-max", "replicas"], default_max)?);
            rsc.clone_node_max = non_negative(meta_int(&meta, &["clone-node-max"], 1)?);
            rsc.promoted_max =
                non_negative(meta_int(&meta, &["promoted-max", "master-max"], 1)?);
            rsc.promoted_node_max =
                non_negative(meta_int(&meta, &["promoted-node-max", "master-node-max"], 1)?);
        }

        if let Some(agent) = &rsc.agent {
            rsc.flags.fence_device = agent.is_fence_agent();
            rsc.flags.remote_connection = agent.provider.as_deref() == Some("pacemaker")
                && agent.kind == "remote";
        }

        let options = &self.state.options;
        rsc.requires = match meta.get("requires").map(String::as_str) {
            _ if rsc.flags.fence_device => Requirement::Quorum,
            Some("nothing") => Requirement::Nothing,
            Some("quorum") => Requirement::Quorum,
            Some("fencing") if options.stonith_enabled => Requirement::Fencing,
            Some("unfencing") if options.stonith_enabled => Requirement::Unfencing,
            Some(other @ ("fencing" | "unfencing")) => {
                warn!(rsc = %rsc.id, requires = other, "fencing disabled, requiring quorum instead");
                Requirement::Quorum
            }
            Some(other) => {
                return Err(StateError::InvalidValue {
                    field: format!("{}.requires", rsc.id),
                    value: other.to_string(),
                });
            }
            None if options.stonith_enabled => Requirement::Fencing,
            None => Requirement::Quorum,
        };
        rsc.flags.needs_unfencing = rsc.requires == Requirement::Unfencing;
        Ok(())
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn meta_bool(meta: &BTreeMap<String, String>, key: &str, default: bool) -> StateResult<bool> {
    match meta.get(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(StateError::InvalidValue {
                field: key.to_string(),
                value: value.clone(),
            }),
        },
    }
}

fn meta_int(meta: &BTreeMap<String, String>, keys: &[&str], default: i32) -> StateResult<i32> {
    for key in keys {
        if let Some(value) = meta.get(*key) {
            return value.trim().parse().map_err(|_| StateError::InvalidValue {
                field: key.to_string(),
                value: value.clone(),
            });
        }
    }
    Ok(default)
}

/// Parse an interval or timeout: `500ms`, `10s`, `2m`, `1h`, or bare seconds.
pub fn parse_duration_ms(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let factor = match unit.trim() {
        "" | "s" | "sec" => 1000,
        "ms" | "msec" => 1,
        "m" | "min" => 60_000,
        "h" | "hr" => 3_600_000,
        _ => return None,
    };
    value.checked_mul(factor)
}

fn duration_field(field: &str, value: &Option<String>) -> StateResult<Option<u64>> {
    value
        .as_deref()
        .map(|v| {
            parse_duration_ms(v).ok_or_else(|| StateError::InvalidValue {
                field: field.to_string(),
                value: v.to_string(),
            })
        })
        .transpose()
}

fn op_from_spec(spec: &OpSpec) -> StateResult<OpConfig> {
    let role = spec.role.as_deref().map(str::parse::<Role>).transpose()?;
    Ok(OpConfig {
        name: spec.name.clone(),
        interval_ms: duration_field("interval", &spec.interval)?.unwrap_or(0),
        role,
        on_fail: spec.on_fail.clone(),
        timeout_ms: duration_field("timeout", &spec.timeout)?,
        start_delay_ms: duration_field("start-delay", &spec.start_delay)?,
        enabled: spec.enabled,
    })
}

fn apply_location(state: &mut ClusterState, spec: &LocationSpec) -> StateResult<()> {
    let rsc = state
        .find_resource(&spec.rsc)
        .ok_or_else(|| StateError::ResourceNotFound(spec.rsc.clone()))?;
    let node = state
        .find_node(&spec.node)
        .ok_or_else(|| StateError::NodeNotFound(spec.node.clone()))?;
    let score = parse_score(&spec.score, &state.options);
    let role = spec.role.as_deref().map(str::parse::<Role>).transpose()?;
    state.resource_mut(rsc).locations.push(LocationConstraint {
        id: spec.id.clone(),
        node,
        score,
        role,
    });
    Ok(())
}

fn apply_history(state: &mut ClusterState, entry: &HistoryEntry) -> StateResult<()> {
    let node = state
        .find_node(&entry.node)
        .ok_or_else(|| StateError::NodeNotFound(entry.node.clone()))?;
    let role: Role = entry.role.parse()?;

    let targets: Vec<RscIdx> = match state.find_resource(&entry.resource) {
        Some(rsc) => vec![rsc],
        None => {
            // History of an anonymous clone names the clone-stripped id.
            let instances: Vec<RscIdx> = state
                .resources()
                .filter(|(idx, r)| {
                    clone_strip(&r.id) == entry.resource && state.is_anonymous_instance(*idx)
                })
                .map(|(idx, _)| idx)
                .collect();
            if role.is_active() {
                let free = instances
                    .iter()
                    .copied()
                    .find(|idx| state.resource(*idx).history.running_on.is_empty());
                free.into_iter().collect()
            } else {
                instances
            }
        }
    };
    if targets.is_empty() {
        warn!(rsc = %entry.resource, node = %entry.node, "ignoring history for unknown resource");
        return Ok(());
    }

    let anonymous = state.find_resource(&entry.resource).is_none();
    for rsc in targets {
        let r = state.resource_mut(rsc);
        if anonymous {
            r.clone_name = Some(entry.resource.clone());
        }
        let history = &mut r.history;
        history.known_on.insert(node);
        if entry.failcount > 0 {
            history.failcount.insert(node, entry.failcount);
        }
        if let Some(ts) = entry.last_failure {
            history.last_failure.insert(node, ts);
        }
        if role.is_active() {
            if !history.running_on.contains(&node) {
                history.running_on.push(node);
            }
            history.role = history.role.max(role);
        } else {
            history.role = history.role.max(Role::Stopped);
        }
    }
    Ok(())
}

/// Propagate history from primitives to the groups and clones containing them.
fn roll_up_history(state: &mut ClusterState) {
    // Children always have higher indices than their parents.
    for i in (0..state.resource_count()).rev() {
        let idx = RscIdx(i);
        let children = state.resource(idx).children.clone();
        if !children.is_empty() {
            let mut merged = ResourceHistory::default();
            for child in children {
                let h = &state.resource(child).history;
                merged.role = merged.role.max(h.role);
                for node in &h.running_on {
                    if !merged.running_on.contains(node) {
                        merged.running_on.push(*node);
                    }
                }
                merged.known_on.extend(h.known_on.iter().copied());
            }
            let history = &mut state.resource_mut(idx).history;
            history.role = merged.role;
            history.running_on = merged.running_on;
            history.known_on = merged.known_on;
        }
        let history = &mut state.resource_mut(idx).history;
        if history.role == Role::Unknown || (!history.role.is_active() && history.running_on.is_empty()) {
            history.role = Role::Stopped;
        }
    }
}
