//! Domain types for a materialized cluster snapshot.
//!
//! Nodes and resources live in arenas owned by [`ClusterState`] and refer
//! to each other through index newtypes, never through references.
//!
//! [`ClusterState`]: crate::store::ClusterState

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use hagrid_core::{Role, Score};
use serde::{Deserialize, Serialize};

use crate::weights::NodeWeights;

/// Index of a node in the cluster arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdx(pub usize);

/// Index of a resource in the cluster arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RscIdx(pub usize);

impl fmt::Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for RscIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsc#{}", self.0)
    }
}

/// Node attribute holding the node's unique name.
pub const ATTR_UNAME: &str = "#uname";
/// Node attribute holding the node's stable id.
pub const ATTR_ID: &str = "#id";
/// Node attribute listing the last-known fence-device digests.
pub const ATTR_DIGESTS_ALL: &str = "#digests-all";
/// Same as [`ATTR_DIGESTS_ALL`] but computed without private parameters.
pub const ATTR_DIGESTS_SECURE: &str = "#digests-secure";

// ── Nodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeVariant {
    /// Full cluster member.
    #[default]
    Cluster,
    /// Remote node reached through a connection resource.
    Remote,
    /// Guest node running inside a container resource on a host node.
    Guest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub variant: NodeVariant,
    pub online: bool,
    /// Joining but not yet fully a member.
    pub pending: bool,
    /// Must be fenced before anything can be assumed about it.
    pub unclean: bool,
    pub standby: bool,
    pub shutdown: bool,
    pub maintenance: bool,
    /// Remote/guest node whose connection must be reset on recovery.
    pub remote_requires_reset: bool,
    /// Host of a guest node.
    pub host: Option<NodeIdx>,
    /// Membership priority used to bias fencing races.
    pub priority: i32,
    pub attrs: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            variant: NodeVariant::Cluster,
            online: true,
            pending: false,
            unclean: false,
            standby: false,
            shutdown: false,
            maintenance: false,
            remote_requires_reset: false,
            host: None,
            priority: 0,
            attrs: BTreeMap::new(),
        }
    }

    /// Look up a node attribute, resolving the built-in `#uname` and `#id`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        match name {
            ATTR_UNAME => Some(&self.name),
            ATTR_ID => Some(&self.id),
            _ => self.attrs.get(name).map(String::as_str),
        }
    }

    /// Whether resources may be placed here.
    pub fn available(&self) -> bool {
        self.online
            && !self.pending
            && !self.unclean
            && !self.standby
            && !self.shutdown
            && !self.maintenance
    }

    pub fn is_cluster_member(&self) -> bool {
        self.variant == NodeVariant::Cluster
    }

    pub fn is_guest(&self) -> bool {
        self.variant == NodeVariant::Guest
    }
}

// ── Resources ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RscVariant {
    #[default]
    Primitive,
    Group,
    Clone,
    Bundle,
}

impl RscVariant {
    /// Rank used when ordering colocations: collective resources first.
    pub fn rank(self) -> u8 {
        match self {
            RscVariant::Primitive => 0,
            RscVariant::Group => 1,
            RscVariant::Clone => 2,
            RscVariant::Bundle => 3,
        }
    }

    pub fn is_collective(self) -> bool {
        matches!(self, RscVariant::Clone | RscVariant::Bundle)
    }
}

/// What must hold before a resource may be started or promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Nothing,
    #[default]
    Quorum,
    Fencing,
    Unfencing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub class: String,
    pub provider: Option<String>,
    pub kind: String,
}

impl Agent {
    /// Parse `class[:provider]:type`.
    pub fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [class, kind] => Some(Self {
                class: class.to_string(),
                provider: None,
                kind: kind.to_string(),
            }),
            [class, provider, kind] => Some(Self {
                class: class.to_string(),
                provider: Some(provider.to_string()),
                kind: kind.to_string(),
            }),
            _ => None,
        }
    }

    pub fn is_fence_agent(&self) -> bool {
        self.class == "stonith"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceFlags {
    pub managed: bool,
    pub unique: bool,
    pub promotable: bool,
    /// Default `influence` for colocations with this resource as dependent.
    pub critical: bool,
    /// Clone instances promote and demote in instance order.
    pub ordered: bool,
    pub fence_device: bool,
    pub needs_unfencing: bool,
    pub remote_connection: bool,
}

/// A configured operation (monitor, start, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpConfig {
    pub name: String,
    pub interval_ms: u64,
    /// Role a recurring monitor is restricted to.
    pub role: Option<Role>,
    pub on_fail: Option<String>,
    pub timeout_ms: Option<u64>,
    pub start_delay_ms: Option<u64>,
    pub enabled: bool,
}

/// Location preference for a resource on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationConstraint {
    pub id: String,
    pub node: NodeIdx,
    pub score: Score,
    /// Applies only when deciding this role (promoted-role locations).
    pub role: Option<Role>,
}

/// What the cluster has recorded about a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHistory {
    pub role: Role,
    pub running_on: Vec<NodeIdx>,
    /// Nodes where the resource has been probed.
    pub known_on: BTreeSet<NodeIdx>,
    pub failcount: BTreeMap<NodeIdx, u32>,
    pub last_failure: BTreeMap<NodeIdx, u64>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    /// Name recorded in history when it differs from `id` (anonymous clones).
    pub clone_name: Option<String>,
    pub variant: RscVariant,
    pub parent: Option<RscIdx>,
    pub children: Vec<RscIdx>,
    pub agent: Option<Agent>,
    pub params: BTreeMap<String, String>,
    /// Parameters excluded from secure digests.
    pub private_params: BTreeSet<String>,
    pub meta: BTreeMap<String, String>,
    pub flags: ResourceFlags,
    pub requires: Requirement,
    pub container: Option<RscIdx>,
    pub operations: Vec<OpConfig>,
    pub locations: Vec<LocationConstraint>,
    /// Configured priority; orders resources during assignment.
    pub allocation_priority: i32,
    pub clone_max: u32,
    pub clone_node_max: u32,
    pub promoted_max: u32,
    pub promoted_node_max: u32,
    pub history: ResourceHistory,

    // Scheduling state, rebuilt every run.
    pub allowed_nodes: NodeWeights,
    pub assigned_to: Option<NodeIdx>,
    pub next_role: Role,
    /// Still waiting for node assignment.
    pub provisional: bool,
    /// Key instances of a promotable clone are sorted by.
    pub promotion_sort_key: Score,
    pub starting: bool,
    pub stopping: bool,
}

impl Resource {
    pub fn new(id: impl Into<String>, variant: RscVariant) -> Self {
        Self {
            id: id.into(),
            clone_name: None,
            variant,
            parent: None,
            children: Vec::new(),
            agent: None,
            params: BTreeMap::new(),
            private_params: BTreeSet::new(),
            meta: BTreeMap::new(),
            flags: ResourceFlags {
                managed: true,
                critical: true,
                ..ResourceFlags::default()
            },
            requires: Requirement::Quorum,
            container: None,
            operations: Vec::new(),
            locations: Vec::new(),
            allocation_priority: 0,
            clone_max: 0,
            clone_node_max: 1,
            promoted_max: 1,
            promoted_node_max: 1,
            history: ResourceHistory::default(),
            allowed_nodes: NodeWeights::new(),
            assigned_to: None,
            next_role: Role::Unknown,
            provisional: true,
            promotion_sort_key: 0,
            starting: false,
            stopping: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.history.running_on.is_empty()
    }

    /// Node the resource is currently running on, if exactly one.
    pub fn current_node(&self) -> Option<NodeIdx> {
        match self.history.running_on.as_slice() {
            [node] => Some(*node),
            _ => None,
        }
    }

    pub fn is_promotable_clone(&self) -> bool {
        self.variant == RscVariant::Clone && self.flags.promotable
    }

    /// Name used in history and node attributes for this resource.
    pub fn history_name(&self) -> &str {
        self.clone_name.as_deref().unwrap_or(&self.id)
    }
}

/// Strip a clone instance suffix: `db:2` → `db`.
pub fn clone_strip(id: &str) -> &str {
    match id.rfind(':') {
        Some(pos) if id[pos + 1..].bytes().all(|b| b.is_ascii_digit()) && pos + 1 < id.len() => {
            &id[..pos]
        }
        _ => id,
    }
}
