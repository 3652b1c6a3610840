//! Operation attributes of resource actions.
//!
//! Each resource action looks up its configured operation (by name and
//! interval), normalizes timeouts and delays, validates `on-fail` and
//! derives the failure handling and the role to recover to.

use std::collections::BTreeMap;

use hagrid_core::{Diagnostics, Role, Task};
use hagrid_state::{ClusterState, OpConfig, Requirement, Resource, RscIdx, parse_duration_ms};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

/// How to react when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFail {
    #[default]
    Ignore,
    Demote,
    Restart,
    /// Ban the resource from the node (`migrate`).
    Ban,
    Block,
    Stop,
    RestartContainer,
    /// Fence or reconnect the remote node whose connection failed.
    ResetRemote,
    StandbyNode,
    FenceNode,
}

impl OnFail {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnFail::Ignore => "ignore",
            OnFail::Demote => "demote",
            OnFail::Restart => "restart",
            OnFail::Ban => "migrate",
            OnFail::Block => "block",
            OnFail::Stop => "stop",
            OnFail::RestartContainer => "restart-container",
            OnFail::ResetRemote => "reset-remote",
            OnFail::StandbyNode => "standby",
            OnFail::FenceNode => "fence",
        }
    }
}

/// Values a stop operation's `on-fail` may take.
const STOP_ON_FAIL: &[&str] = &["block", "fence", "standby", "stop", "migrate", "ignore", "nothing"];

/// Everything a new action takes from its resource's configuration.
#[derive(Debug, Clone)]
pub struct OpDetails {
    pub meta: BTreeMap<String, String>,
    pub needs: Requirement,
    pub on_fail: OnFail,
    pub fail_role: Role,
}

impl Default for OpDetails {
    fn default() -> Self {
        Self {
            meta: BTreeMap::new(),
            needs: Requirement::Nothing,
            on_fail: OnFail::Ignore,
            fail_role: Role::Unknown,
        }
    }
}

/// Configured operation matching `task` at `interval_ms`, enabled or not.
pub fn find_op_config<'a>(rsc: &'a Resource, task: &Task, interval_ms: u64) -> Option<&'a OpConfig> {
    rsc.operations
        .iter()
        .find(|op| op.name == task.name() && op.interval_ms == interval_ms)
}

pub fn unpack_operation(
    state: &ClusterState,
    diags: &mut Diagnostics,
    rsc: RscIdx,
    task: &Task,
    interval_ms: u64,
) -> OpDetails {
    let r = state.resource(rsc);
    let op = find_op_config(r, task, interval_ms);
    let meta = unpack_meta(diags, r, task, interval_ms, op);

    let needs = match task {
        Task::Start | Task::Promote => match r.requires {
            Requirement::Nothing => Requirement::Nothing,
            Requirement::Quorum => Requirement::Quorum,
            Requirement::Fencing | Requirement::Unfencing => Requirement::Fencing,
        },
        _ => Requirement::Nothing,
    };

    let (on_fail, mut fail_role) = unpack_on_fail(state, diags, r, task, interval_ms, &meta);
    if fail_role == Role::Unknown {
        fail_role = role_after_failure(r, task);
    }

    OpDetails {
        meta,
        needs,
        on_fail,
        fail_role,
    }
}

fn unpack_meta(
    diags: &mut Diagnostics,
    rsc: &Resource,
    task: &Task,
    interval_ms: u64,
    op: Option<&OpConfig>,
) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert("name".to_string(), task.name().to_string());
    if interval_ms > 0 {
        meta.insert("interval".to_string(), interval_ms.to_string());
    }

    let mut timeout = op.and_then(|op| op.timeout_ms);
    let is_probe = *task == Task::Monitor && interval_ms == 0;
    if timeout.is_none() && is_probe {
        // Probes default to the timeout of the most frequent monitor.
        timeout = rsc
            .operations
            .iter()
            .filter(|op| op.name == "monitor" && op.enabled && op.interval_ms > 0)
            .min_by_key(|op| op.interval_ms)
            .and_then(|op| op.timeout_ms);
    }
    if rsc.flags.fence_device && matches!(task, Task::Start | Task::Monitor) {
        if let Some(device_timeout) = rsc
            .params
            .get("pcmk_monitor_timeout")
            .and_then(|v| parse_duration_ms(v))
        {
            timeout = Some(device_timeout);
        }
    }
    meta.insert(
        "timeout".to_string(),
        timeout.unwrap_or(DEFAULT_TIMEOUT_MS).to_string(),
    );

    if let Some(op) = op {
        if let Some(delay) = op.start_delay_ms {
            meta.insert("start-delay".to_string(), delay.to_string());
        }
        if let Some(role) = op.role {
            meta.insert("role".to_string(), role.to_string());
        }
        if let Some(on_fail) = &op.on_fail {
            meta.insert("on-fail".to_string(), on_fail.clone());
        }
        if !op.enabled {
            meta.insert("enabled".to_string(), "false".to_string());
        }
    }

    validate_on_fail(diags, rsc, task, interval_ms, op, &mut meta);
    meta
}

/// Drop or default `on-fail` values that make no sense for the action.
fn validate_on_fail(
    diags: &mut Diagnostics,
    rsc: &Resource,
    task: &Task,
    interval_ms: u64,
    op: Option<&OpConfig>,
    meta: &mut BTreeMap<String, String>,
) {
    let value = meta.get("on-fail").cloned();

    if *task == Task::Stop {
        if let Some(value) = value {
            let allowed = STOP_ON_FAIL.iter().any(|v| value.eq_ignore_ascii_case(v));
            if !allowed {
                diags.config_error(
                    rsc.id.clone(),
                    format!("resetting on-fail for stop to default: '{value}' is not allowed for stop"),
                );
                meta.remove("on-fail");
            }
        }
        return;
    }

    if *task == Task::Demote && value.is_none() {
        // Inherit from the promoted-role monitor, unless it demotes too.
        let inherited = rsc
            .operations
            .iter()
            .filter(|op| {
                op.name == "monitor"
                    && op.enabled
                    && op.interval_ms > 0
                    && op.role == Some(Role::Promoted)
            })
            .filter_map(|op| op.on_fail.as_deref())
            .find(|v| !v.eq_ignore_ascii_case("demote"));
        if let Some(inherited) = inherited {
            debug!(rsc = %rsc.id, on_fail = inherited, "demote inherits on-fail from promoted monitor");
            meta.insert("on-fail".to_string(), inherited.to_string());
        }
        return;
    }

    if *task == Task::LrmDelete {
        meta.insert("on-fail".to_string(), "ignore".to_string());
        return;
    }

    if value.is_some_and(|v| v.eq_ignore_ascii_case("demote")) {
        let promoted_monitor = *task == Task::Monitor
            && interval_ms > 0
            && op.is_some_and(|op| op.role == Some(Role::Promoted));
        if *task != Task::Promote && !promoted_monitor {
            diags.config_error(
                rsc.id.clone(),
                format!(
                    "resetting on-fail for {} to default: 'demote' is only allowed for promote and promoted-role monitors",
                    task.name()
                ),
            );
            meta.remove("on-fail");
        }
    }
}

fn unpack_on_fail(
    state: &ClusterState,
    diags: &mut Diagnostics,
    rsc: &Resource,
    task: &Task,
    interval_ms: u64,
    meta: &BTreeMap<String, String>,
) -> (OnFail, Role) {
    let fencing = state.options.stonith_enabled;
    let mut fail_role = Role::Unknown;

    let configured = meta.get("on-fail").map(|v| v.to_ascii_lowercase());
    let explicit = match configured.as_deref() {
        None => None,
        Some("block") => Some(OnFail::Block),
        Some("fence") if fencing => Some(OnFail::FenceNode),
        Some("fence") => {
            diags.config_error(
                rsc.id.clone(),
                format!("resetting on-fail for {} to 'stop': fencing is disabled", task.name()),
            );
            fail_role = Role::Stopped;
            Some(OnFail::Stop)
        }
        Some("standby") => Some(OnFail::StandbyNode),
        Some("ignore" | "nothing") => Some(OnFail::Ignore),
        Some("migrate") => Some(OnFail::Ban),
        Some("stop") => {
            fail_role = Role::Stopped;
            Some(OnFail::Stop)
        }
        Some("restart") => Some(OnFail::Restart),
        Some("restart-container") if rsc.container.is_some() => Some(OnFail::RestartContainer),
        Some("restart-container") => {
            diags.config_error(
                rsc.id.clone(),
                "ignoring on-fail 'restart-container' for a resource without a container",
            );
            None
        }
        Some("demote") => Some(OnFail::Demote),
        Some(other) => {
            diags.config_error(
                rsc.id.clone(),
                format!("ignoring unknown on-fail '{other}' for {}", task.name()),
            );
            None
        }
    };

    let is_probe = *task == Task::Monitor && interval_ms == 0;
    let on_fail = if explicit.is_none() && rsc.container.is_some() {
        OnFail::RestartContainer
    } else if (explicit.is_none() || !rsc.flags.managed)
        && rsc.flags.remote_connection
        && !is_probe
        && *task != Task::Start
    {
        // A failed remote connection is handled through the remote node.
        if !rsc.flags.managed {
            fail_role = Role::Stopped;
            OnFail::Stop
        } else {
            let reconnect = rsc
                .meta
                .get("reconnect_interval")
                .and_then(|v| parse_duration_ms(v))
                .unwrap_or(0);
            if reconnect > 0 {
                fail_role = Role::Stopped;
            }
            OnFail::ResetRemote
        }
    } else if let Some(on_fail) = explicit {
        on_fail
    } else if *task == Task::Stop {
        if fencing { OnFail::FenceNode } else { OnFail::Block }
    } else {
        OnFail::Restart
    };
    (on_fail, fail_role)
}

fn role_after_failure(rsc: &Resource, task: &Task) -> Role {
    if let Some(value) = rsc.meta.get("role_after_failure") {
        match value.parse::<Role>() {
            Ok(role) => {
                warn!(rsc = %rsc.id, "role_after_failure is deprecated, use on-fail=demote");
                return role;
            }
            Err(_) => warn!(rsc = %rsc.id, value = %value, "ignoring invalid role_after_failure"),
        }
    }
    if *task == Task::Promote {
        Role::Unpromoted
    } else {
        Role::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hagrid_core::{ClusterOptions, DiagnosticKind};
    use hagrid_state::{Agent, RscVariant};

    fn op(name: &str, interval_ms: u64) -> OpConfig {
        OpConfig {
            name: name.to_string(),
            interval_ms,
            role: None,
            on_fail: None,
            timeout_ms: None,
            start_delay_ms: None,
            enabled: true,
        }
    }

    fn setup(rsc: Resource, options: ClusterOptions) -> (ClusterState, RscIdx) {
        let mut state = ClusterState::new(options);
        let idx = state.add_resource(rsc, None).unwrap();
        (state, idx)
    }

    fn unpack(state: &ClusterState, rsc: RscIdx, task: Task, interval_ms: u64) -> (OpDetails, Diagnostics) {
        let mut diags = Diagnostics::new();
        let details = unpack_operation(state, &mut diags, rsc, &task, interval_ms);
        (details, diags)
    }

    #[test]
    fn defaults_for_plain_start() {
        let (state, rsc) = setup(Resource::new("web", RscVariant::Primitive), ClusterOptions::default());
        let (details, diags) = unpack(&state, rsc, Task::Start, 0);
        assert_eq!(details.on_fail, OnFail::Restart);
        assert_eq!(details.fail_role, Role::Started);
        assert_eq!(details.needs, Requirement::Quorum);
        assert_eq!(details.meta["timeout"], "20000");
        assert!(diags.is_empty());
    }

    #[test]
    fn stop_defaults_depend_on_fencing() {
        let (state, rsc) = setup(Resource::new("web", RscVariant::Primitive), ClusterOptions::default());
        let (details, _) = unpack(&state, rsc, Task::Stop, 0);
        assert_eq!(details.on_fail, OnFail::FenceNode);
        assert_eq!(details.needs, Requirement::Nothing);

        let options = ClusterOptions {
            stonith_enabled: false,
            ..ClusterOptions::default()
        };
        let (state, rsc) = setup(Resource::new("web", RscVariant::Primitive), options);
        let (details, _) = unpack(&state, rsc, Task::Stop, 0);
        assert_eq!(details.on_fail, OnFail::Block);
    }

    #[test]
    fn disallowed_stop_on_fail_is_reset() {
        let mut r = Resource::new("web", RscVariant::Primitive);
        let mut stop = op("stop", 0);
        stop.on_fail = Some("restart".to_string());
        r.operations.push(stop);
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (details, diags) = unpack(&state, rsc, Task::Stop, 0);
        assert_eq!(details.on_fail, OnFail::FenceNode);
        assert!(!details.meta.contains_key("on-fail"));
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn demote_inherits_from_promoted_monitor() {
        let mut r = Resource::new("db", RscVariant::Primitive);
        let mut demoting = op("monitor", 5_000);
        demoting.role = Some(Role::Promoted);
        demoting.on_fail = Some("demote".to_string());
        let mut blocking = op("monitor", 10_000);
        blocking.role = Some(Role::Promoted);
        blocking.on_fail = Some("block".to_string());
        r.operations.extend([demoting, blocking]);
        let (state, rsc) = setup(r, ClusterOptions::default());

        let (details, _) = unpack(&state, rsc, Task::Demote, 0);
        assert_eq!(details.on_fail, OnFail::Block);

        let (monitor, diags) = unpack(&state, rsc, Task::Monitor, 5_000);
        assert_eq!(monitor.on_fail, OnFail::Demote);
        assert!(diags.is_empty());
    }

    #[test]
    fn demote_on_fail_rejected_for_start() {
        let mut r = Resource::new("db", RscVariant::Primitive);
        let mut start = op("start", 0);
        start.on_fail = Some("demote".to_string());
        r.operations.push(start);
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (details, diags) = unpack(&state, rsc, Task::Start, 0);
        assert_eq!(details.on_fail, OnFail::Restart);
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn fence_on_fail_without_fencing_becomes_stop() {
        let mut r = Resource::new("db", RscVariant::Primitive);
        let mut monitor = op("monitor", 10_000);
        monitor.on_fail = Some("fence".to_string());
        r.operations.push(monitor);
        let options = ClusterOptions {
            stonith_enabled: false,
            ..ClusterOptions::default()
        };
        let (state, rsc) = setup(r, options);
        let (details, diags) = unpack(&state, rsc, Task::Monitor, 10_000);
        assert_eq!(details.on_fail, OnFail::Stop);
        assert_eq!(details.fail_role, Role::Stopped);
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn probe_uses_most_frequent_monitor_timeout() {
        let mut r = Resource::new("db", RscVariant::Primitive);
        let mut slow = op("monitor", 60_000);
        slow.timeout_ms = Some(90_000);
        let mut fast = op("monitor", 10_000);
        fast.timeout_ms = Some(30_000);
        r.operations.extend([slow, fast]);
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (details, _) = unpack(&state, rsc, Task::Monitor, 0);
        assert_eq!(details.meta["timeout"], "30000");

        let (details, _) = unpack(&state, rsc, Task::Monitor, 60_000);
        assert_eq!(details.meta["timeout"], "90000");
        assert_eq!(details.meta["interval"], "60000");
    }

    #[test]
    fn fence_device_monitor_timeout_param() {
        let mut r = Resource::new("fence1", RscVariant::Primitive);
        r.agent = Agent::parse("stonith:fence_ipmilan");
        r.flags.fence_device = true;
        r.params.insert("pcmk_monitor_timeout".to_string(), "2m".to_string());
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (details, _) = unpack(&state, rsc, Task::Start, 0);
        assert_eq!(details.meta["timeout"], "120000");
    }

    #[test]
    fn promote_recovers_to_unpromoted() {
        let (state, rsc) = setup(Resource::new("db", RscVariant::Primitive), ClusterOptions::default());
        let (details, _) = unpack(&state, rsc, Task::Promote, 0);
        assert_eq!(details.fail_role, Role::Unpromoted);
    }

    #[test]
    fn remote_connection_failure_resets_remote() {
        let mut r = Resource::new("remote1", RscVariant::Primitive);
        r.agent = Agent::parse("ocf:pacemaker:remote");
        r.flags.remote_connection = true;
        r.meta.insert("reconnect_interval".to_string(), "60s".to_string());
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (monitor, _) = unpack(&state, rsc, Task::Monitor, 30_000);
        assert_eq!(monitor.on_fail, OnFail::ResetRemote);
        assert_eq!(monitor.fail_role, Role::Stopped);

        let (start, _) = unpack(&state, rsc, Task::Start, 0);
        assert_eq!(start.on_fail, OnFail::Restart);
    }

    #[test]
    fn unknown_on_fail_is_reported() {
        let mut r = Resource::new("db", RscVariant::Primitive);
        let mut monitor = op("monitor", 10_000);
        monitor.on_fail = Some("explode".to_string());
        r.operations.push(monitor);
        let (state, rsc) = setup(r, ClusterOptions::default());
        let (details, diags) = unpack(&state, rsc, Task::Monitor, 10_000);
        assert_eq!(details.on_fail, OnFail::Restart);
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }
}
