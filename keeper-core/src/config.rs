//! Supervisor configuration: daemon settings plus unit definitions.
//!
//! # File format
//!
//! ```yaml
//! log_level: info
//! socket: /run/keeper.sock
//! probe: { interval_ms: 1000, deadline_ms: 5000 }
//! stop_grace_ms: 5000
//! restart: { window_s: 60, base_delay_ms: 1000, max_delay_ms: 60000 }
//! units:
//!   - name: db
//!     executable: /usr/bin/postgres
//!   - name: web
//!     executable: /usr/bin/web
//!     dependencies: [db]
//!     restart_policy: always
//! ```
//!
//! Loading resolves users/groups to numeric ids and rejects duplicate names,
//! unknown dependencies and dependency cycles, so everything downstream can
//! treat the unit graph as a valid DAG.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{ProbeCommand, RestartPolicy, UnitDefinition, UnitName};

// ---------------------------------------------------------------------------
// 1. Settings
// ---------------------------------------------------------------------------

/// Probe loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound for any single probe, whatever the probe's own timeout.
    #[serde(default = "default_probe_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval_ms(),
            deadline_ms: default_probe_deadline_ms(),
        }
    }
}

impl ProbeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.max(1))
    }
}

/// Restart backoff tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RestartSettings {
    #[serde(default = "default_restart_window_s")]
    pub window_s: u64,
    #[serde(default = "default_restart_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            window_s: default_restart_window_s(),
            base_delay_ms: default_restart_base_delay_ms(),
            max_delay_ms: default_restart_max_delay_ms(),
        }
    }
}

impl RestartSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_s)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

fn default_probe_deadline_ms() -> u64 {
    5_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_restart_window_s() -> u64 {
    60
}

fn default_restart_base_delay_ms() -> u64 {
    1_000
}

fn default_restart_max_delay_ms() -> u64 {
    60_000
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// 2. Raw file shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    socket: Option<PathBuf>,
    #[serde(default)]
    probe: ProbeSettings,
    #[serde(default = "default_stop_grace_ms")]
    stop_grace_ms: u64,
    #[serde(default)]
    restart: RestartSettings,
    #[serde(default)]
    units: Vec<RawUnit>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    name: String,
    executable: PathBuf,
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    restart_policy: RestartPolicy,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    uid: Option<u32>,
    #[serde(default)]
    gid: Option<u32>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    liveness_probe: Option<ProbeCommand>,
}

impl RawUnit {
    /// Explicit `uid` wins, then a `user` lookup, then our own uid.
    fn resolve_uid(&self) -> Result<u32, ConfigError> {
        if let Some(uid) = self.uid {
            return Ok(uid);
        }
        match self.user.as_deref().filter(|user| !user.is_empty()) {
            Some(user) => match User::from_name(user) {
                Ok(Some(found)) => Ok(found.uid.as_raw()),
                _ => Err(ConfigError::UnknownUser {
                    unit: self.name.clone(),
                    user: user.to_string(),
                }),
            },
            None => Ok(Uid::current().as_raw()),
        }
    }

    fn resolve_gid(&self) -> Result<u32, ConfigError> {
        if let Some(gid) = self.gid {
            return Ok(gid);
        }
        match self.group.as_deref().filter(|group| !group.is_empty()) {
            Some(group) => match Group::from_name(group) {
                Ok(Some(found)) => Ok(found.gid.as_raw()),
                _ => Err(ConfigError::UnknownGroup {
                    unit: self.name.clone(),
                    group: group.to_string(),
                }),
            },
            None => Ok(Gid::current().as_raw()),
        }
    }

    fn into_definition(self) -> Result<UnitDefinition, ConfigError> {
        let uid = self.resolve_uid()?;
        let gid = self.resolve_gid()?;
        Ok(UnitDefinition {
            name: UnitName::from(self.name),
            executable: self.executable,
            arguments: self.arguments,
            dependencies: self.dependencies.into_iter().map(UnitName::from).collect(),
            restart_policy: self.restart_policy,
            uid,
            gid,
            enabled: self.enabled,
            liveness_probe: self.liveness_probe,
        })
    }
}

// ---------------------------------------------------------------------------
// 3. Validated configuration
// ---------------------------------------------------------------------------

/// A loaded and validated supervisor configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub log_level: String,
    pub socket: Option<PathBuf>,
    pub probe: ProbeSettings,
    pub stop_grace_ms: u64,
    pub restart: RestartSettings,
    units: Vec<UnitDefinition>,
}

impl Configuration {
    /// Load from a YAML file. Parse errors carry the file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfiguration =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw)
    }

    /// Load from in-memory YAML.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfiguration = serde_yaml::from_str(contents)?;
        Self::from_raw(raw)
    }

    /// Build a configuration from already-resolved definitions, with default settings.
    pub fn with_units(units: Vec<UnitDefinition>) -> Result<Self, ConfigError> {
        validate_graph(&units)?;
        Ok(Self {
            log_level: default_log_level(),
            socket: None,
            probe: ProbeSettings::default(),
            stop_grace_ms: default_stop_grace_ms(),
            restart: RestartSettings::default(),
            units,
        })
    }

    fn from_raw(raw: RawConfiguration) -> Result<Self, ConfigError> {
        let units = raw
            .units
            .into_iter()
            .map(RawUnit::into_definition)
            .collect::<Result<Vec<_>, _>>()?;
        validate_graph(&units)?;
        Ok(Self {
            log_level: raw.log_level,
            socket: raw.socket,
            probe: raw.probe,
            stop_grace_ms: raw.stop_grace_ms,
            restart: raw.restart,
            units,
        })
    }

    /// Unit definitions in file order.
    pub fn units(&self) -> &[UnitDefinition] {
        &self.units
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Dependencies before dependents; ties keep file order.
    pub fn start_order(&self) -> Vec<UnitName> {
        let mut placed: HashSet<&UnitName> = HashSet::new();
        let mut order = Vec::with_capacity(self.units.len());

        while order.len() < self.units.len() {
            let next = self.units.iter().find(|unit| {
                !placed.contains(&unit.name)
                    && unit.dependencies.iter().all(|dep| placed.contains(dep))
            });
            // validate_graph guarantees a DAG, so a candidate always exists.
            let Some(next) = next else { break };
            placed.insert(&next.name);
            order.push(next.name.clone());
        }
        order
    }
}

/// Reject duplicate names, dangling dependency names and cycles.
fn validate_graph(units: &[UnitDefinition]) -> Result<(), ConfigError> {
    let mut by_name: HashMap<&UnitName, &UnitDefinition> = HashMap::new();
    for unit in units {
        if by_name.insert(&unit.name, unit).is_some() {
            return Err(ConfigError::DuplicateUnit(unit.name.0.clone()));
        }
    }

    for unit in units {
        for dep in &unit.dependencies {
            if !by_name.contains_key(dep) {
                return Err(ConfigError::UnknownDependency {
                    unit: unit.name.0.clone(),
                    dependency: dep.0.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a UnitName,
        by_name: &HashMap<&'a UnitName, &'a UnitDefinition>,
        marks: &mut HashMap<&'a UnitName, Mark>,
        path: &mut Vec<&'a UnitName>,
    ) -> Result<(), ConfigError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.0.clone()).collect();
                cycle.push(name.0.clone());
                return Err(ConfigError::DependencyCycle(cycle));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(unit) = by_name.get(name).copied() {
            for dep in &unit.dependencies {
                visit(dep, by_name, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for unit in units {
        visit(&unit.name, &by_name, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
