//! Resource roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Role a resource instance holds (or should hold) on a node.
///
/// Ordering is significant: a role compares greater than every role it
/// implies, so `Promoted > Unpromoted > Started > Stopped > Unknown`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Unknown,
    Stopped,
    Started,
    Unpromoted,
    Promoted,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "Unknown",
            Role::Stopped => "Stopped",
            Role::Started => "Started",
            Role::Unpromoted => "Unpromoted",
            Role::Promoted => "Promoted",
        }
    }

    /// Interpret a colocation role filter, where `Started` means "any role".
    pub fn as_filter(self) -> Role {
        if self == Role::Started { Role::Unknown } else { self }
    }

    pub fn is_active(self) -> bool {
        self > Role::Stopped
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(Role::Unknown),
            "stopped" => Ok(Role::Stopped),
            "started" => Ok(Role::Started),
            "unpromoted" | "slave" => Ok(Role::Unpromoted),
            "promoted" | "master" => Ok(Role::Promoted),
            other => Err(CoreError::InvalidRole(other.to_string())),
        }
    }
}
