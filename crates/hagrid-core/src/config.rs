//! Cluster-wide scheduling options.
//!
//! Options are read from a TOML table using the same property names the
//! cluster configuration uses, e.g.
//!
//! ```toml
//! no-quorum-policy = "freeze"
//! stonith-enabled = true
//! priority-fencing-delay = 15
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::score::{MINUS_INFINITY, Score};

/// What to do with resources when the partition loses quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoQuorumPolicy {
    #[default]
    Stop,
    Freeze,
    Ignore,
    Demote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterOptions {
    pub no_quorum_policy: NoQuorumPolicy,
    pub stonith_enabled: bool,
    /// Fencing operation used when none is requested explicitly.
    pub stonith_action: String,
    /// Automatically unfence nodes whose fence-device definitions changed.
    pub unfencing_enabled: bool,
    /// Delay in seconds applied to fencing the higher-priority side of a split.
    pub priority_fencing_delay: u32,
    pub symmetric_cluster: bool,
    pub node_health_red: Score,
    pub node_health_yellow: Score,
    pub node_health_green: Score,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            no_quorum_policy: NoQuorumPolicy::Stop,
            stonith_enabled: true,
            stonith_action: "reboot".to_string(),
            unfencing_enabled: true,
            priority_fencing_delay: 0,
            symmetric_cluster: true,
            node_health_red: MINUS_INFINITY,
            node_health_yellow: 0,
            node_health_green: 0,
        }
    }
}

impl ClusterOptions {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let options: ClusterOptions = toml::from_str(content)?;
        Ok(options)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
