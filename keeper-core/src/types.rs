//! Domain types for the keeper supervisor.
//!
//! Everything here is plain data: serializable, cloneable, and free of any
//! runtime handles. Runtime ownership (process handles, locks, timers) lives
//! in `keeper-daemon`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed unit name. Unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitName(pub String);

impl UnitName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UnitName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UnitName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Governs automatic relaunch after an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Always,
    Never,
    /// Behaves as `Never` until configuration re-enables the unit.
    DisabledTemporarily,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::DisabledTemporarily => write!(f, "disabled temporarily"),
        }
    }
}

/// Verdict of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    /// No data yet, probe not configured, or probing infrastructure failed.
    #[default]
    Undefined,
    Alive,
    Dead,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeState::Undefined => write!(f, "undefined"),
            ProbeState::Alive => write!(f, "alive"),
            ProbeState::Dead => write!(f, "dead"),
        }
    }
}

/// The supervisor's view of a unit's run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Starting,
    Running,
    RunningAndHealthy,
    RunningButDegraded,
    Stopping,
    #[default]
    Stopped,
}

impl UnitState {
    /// `Running`, `RunningAndHealthy` or `RunningButDegraded`.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            UnitState::Running | UnitState::RunningAndHealthy | UnitState::RunningButDegraded
        )
    }

    /// States in which a pid is meaningful.
    pub fn holds_process(self) -> bool {
        !matches!(self, UnitState::Stopped)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Starting => write!(f, "starting"),
            UnitState::Running => write!(f, "running"),
            UnitState::RunningAndHealthy => write!(f, "running (healthy)"),
            UnitState::RunningButDegraded => write!(f, "running (degraded)"),
            UnitState::Stopping => write!(f, "stopping"),
            UnitState::Stopped => write!(f, "stopped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// External command used as a liveness probe. Exit code 0 means alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCommand {
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_probe_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_probe_timeout_s")]
    pub timeout_s: u64,
}

fn default_probe_interval_s() -> u64 {
    60
}

fn default_probe_timeout_s() -> u64 {
    10
}

impl ProbeCommand {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

/// Static, immutable description of a unit after configuration resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub name: UnitName,
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<UnitName>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub uid: u32,
    pub gid: u32,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeCommand>,
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// One unit as reported over RPC: static definition plus a runtime snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: UnitName,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<UnitName>,
    pub restart_policy: RestartPolicy,
    pub uid: u32,
    pub gid: u32,
    pub enabled: bool,
    pub process_probe_state: ProbeState,
    pub liveness_probe_state: ProbeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the last successful start; 0 when stopped.
    pub uptime_s: u64,
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Unit {
    /// A record for a unit that has never run.
    pub fn stopped(definition: &UnitDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            executable: definition.executable.clone(),
            arguments: definition.arguments.clone(),
            dependencies: definition.dependencies.clone(),
            restart_policy: definition.restart_policy,
            uid: definition.uid,
            gid: definition.gid,
            enabled: definition.enabled,
            process_probe_state: ProbeState::Undefined,
            liveness_probe_state: ProbeState::Undefined,
            pid: None,
            uptime_s: 0,
            state: UnitState::Stopped,
            started_at: None,
            restart_count: 0,
            last_error: None,
        }
    }
}

/// A unit together with its dependencies expanded one level.
///
/// Nested records still list their own dependencies by name only, so shared
/// or cyclic graphs never recurse when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUnit {
    pub unit: Unit,
    #[serde(default)]
    pub dependencies: Vec<Unit>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
