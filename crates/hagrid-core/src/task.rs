//! Action task names shared by orderings and actions.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Start,
    Stop,
    Promote,
    Demote,
    Monitor,
    /// Clear a resource's recorded history on a node.
    LrmDelete,
    /// Pseudo-action completing a collective start.
    Running,
    /// Pseudo-action completing a collective stop.
    Stopped,
    Promoted,
    Demoted,
    /// Fence a node with the given operation (`reboot`, `off`, `on`).
    Fence(String),
    /// Any other cluster-wide pseudo-action.
    Pseudo(String),
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::Start => "start",
            Task::Stop => "stop",
            Task::Promote => "promote",
            Task::Demote => "demote",
            Task::Monitor => "monitor",
            Task::LrmDelete => "lrm_delete",
            Task::Running => "running",
            Task::Stopped => "stopped",
            Task::Promoted => "promoted",
            Task::Demoted => "demoted",
            Task::Fence(_) => "stonith",
            Task::Pseudo(name) => name,
        }
    }

    /// Pseudo-action that marks completion of this task for a collective.
    pub fn completion(&self) -> Option<Task> {
        match self {
            Task::Start => Some(Task::Running),
            Task::Stop => Some(Task::Stopped),
            Task::Promote => Some(Task::Promoted),
            Task::Demote => Some(Task::Demoted),
            _ => None,
        }
    }

    /// Parse a configured operation name.
    pub fn from_op_name(name: &str) -> Task {
        match name {
            "start" => Task::Start,
            "stop" => Task::Stop,
            "promote" => Task::Promote,
            "demote" => Task::Demote,
            "monitor" => Task::Monitor,
            "lrm_delete" | "delete" => Task::LrmDelete,
            "running" => Task::Running,
            "stopped" => Task::Stopped,
            "promoted" => Task::Promoted,
            "demoted" => Task::Demoted,
            other => Task::Pseudo(other.to_string()),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fence(op) => write!(f, "stonith-{op}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_pseudo_tasks() {
        assert_eq!(Task::Start.completion(), Some(Task::Running));
        assert_eq!(Task::Demote.completion(), Some(Task::Demoted));
        assert_eq!(Task::Monitor.completion(), None);
    }

    #[test]
    fn parses_op_names() {
        assert_eq!(Task::from_op_name("promote"), Task::Promote);
        assert_eq!(Task::from_op_name("delete"), Task::LrmDelete);
        assert_eq!(Task::from_op_name("migrate_to"), Task::Pseudo("migrate_to".to_string()));
        assert_eq!(Task::Fence("reboot".to_string()).to_string(), "stonith-reboot");
    }
}
