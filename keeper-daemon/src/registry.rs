//! In-memory unit registry.
//!
//! The unit set is fixed after load, so the table itself sits behind a
//! std `RwLock` that is only ever held for map lookups. Each unit's mutable
//! runtime has its own async mutex; operations on different units never
//! contend. The current state of every unit is also published on a `watch`
//! channel so dependency checks and stop waiters can read it without
//! taking another unit's lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use keeper_core::{ProbeState, ResolvedUnit, Unit, UnitDefinition, UnitName, UnitState};
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::launcher::ProcessHandle;
use crate::restart::ExitHistory;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unit '{0}' not found")]
    NotFound(UnitName),

    #[error("unit '{0}' is already registered")]
    Duplicate(UnitName),
}

/// Mutable runtime half of a unit. Only touched under the unit's lock.
#[derive(Debug, Default)]
pub struct UnitRuntime {
    pub state: UnitState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub started_instant: Option<Instant>,
    pub process_probe: ProbeState,
    pub liveness_probe: ProbeState,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub exits: ExitHistory,
    /// Bumped on every launch and stop; probe verdicts carry the value they
    /// were issued under and are dropped if it moved on.
    pub generation: u64,
    /// Token of the backoff timer allowed to relaunch this unit.
    pub pending_restart: Option<u64>,
    pub handle: Option<Box<dyn ProcessHandle>>,
}

/// Partial update of a unit's runtime fields.
///
/// Name, executable, arguments and dependencies are fixed after load and
/// have no field here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeUpdate {
    pub state: Option<UnitState>,
    pub pid: Option<Option<u32>>,
    pub process_probe: Option<ProbeState>,
    pub liveness_probe: Option<ProbeState>,
    pub last_error: Option<Option<String>>,
}

impl RuntimeUpdate {
    pub fn state(state: UnitState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

pub struct UnitSlot {
    definition: UnitDefinition,
    runtime: Mutex<UnitRuntime>,
    state_tx: watch::Sender<UnitState>,
}

impl std::fmt::Debug for UnitSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSlot")
            .field("name", &self.definition.name)
            .field("state", &self.current_state())
            .finish()
    }
}

impl UnitSlot {
    fn new(definition: UnitDefinition) -> Self {
        let (state_tx, _) = watch::channel(UnitState::Stopped);
        Self {
            definition,
            runtime: Mutex::new(UnitRuntime::default()),
            state_tx,
        }
    }

    pub fn definition(&self) -> &UnitDefinition {
        &self.definition
    }

    pub fn name(&self) -> &UnitName {
        &self.definition.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, UnitRuntime> {
        self.runtime.lock().await
    }

    /// Last committed state, readable without the unit lock.
    pub fn current_state(&self) -> UnitState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnitState> {
        self.state_tx.subscribe()
    }

    /// Apply `update` to a runtime the caller has locked.
    ///
    /// Entering `Stopped` always clears the pid and start time, so a
    /// snapshot can never show a stopped unit with a process.
    pub fn apply(&self, runtime: &mut UnitRuntime, update: RuntimeUpdate) {
        if let Some(pid) = update.pid {
            runtime.pid = pid;
        }
        if let Some(state) = update.process_probe {
            runtime.process_probe = state;
        }
        if let Some(state) = update.liveness_probe {
            runtime.liveness_probe = state;
        }
        if let Some(error) = update.last_error {
            runtime.last_error = error;
        }
        if let Some(state) = update.state {
            runtime.state = state;
            if state == UnitState::Stopped {
                runtime.pid = None;
                runtime.started_at = None;
                runtime.started_instant = None;
            }
            self.state_tx.send_if_modified(|current| {
                if *current == state {
                    false
                } else {
                    *current = state;
                    true
                }
            });
        }
    }

    pub fn snapshot_of(&self, runtime: &UnitRuntime) -> Unit {
        let uptime_s = runtime
            .started_instant
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);
        Unit {
            process_probe_state: runtime.process_probe,
            liveness_probe_state: runtime.liveness_probe,
            pid: runtime.pid,
            uptime_s,
            state: runtime.state,
            started_at: runtime.started_at,
            restart_count: runtime.restart_count,
            last_error: runtime.last_error.clone(),
            ..Unit::stopped(&self.definition)
        }
    }

    pub async fn snapshot(&self) -> Unit {
        let runtime = self.lock().await;
        self.snapshot_of(&runtime)
    }
}

#[derive(Default)]
struct Table {
    order: Vec<Arc<UnitSlot>>,
    by_name: HashMap<UnitName, Arc<UnitSlot>>,
}

/// Name-keyed set of units, iterated in insertion order.
#[derive(Default)]
pub struct UnitRegistry {
    table: RwLock<Table>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = UnitDefinition>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for definition in definitions {
            registry.insert(definition)?;
        }
        Ok(registry)
    }

    pub fn insert(&self, definition: UnitDefinition) -> Result<Arc<UnitSlot>, RegistryError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.by_name.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        let slot = Arc::new(UnitSlot::new(definition));
        table.order.push(Arc::clone(&slot));
        table
            .by_name
            .insert(slot.name().clone(), Arc::clone(&slot));
        Ok(slot)
    }

    pub fn get(&self, name: &UnitName) -> Result<Arc<UnitSlot>, RegistryError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.clone()))
    }

    pub fn slots(&self) -> Vec<Arc<UnitSlot>> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.order.clone()
    }

    pub fn names(&self) -> Vec<UnitName> {
        self.slots().iter().map(|slot| slot.name().clone()).collect()
    }

    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn snapshot(&self, name: &UnitName) -> Result<Unit, RegistryError> {
        Ok(self.get(name)?.snapshot().await)
    }

    /// Snapshots of every unit in registration order.
    pub async fn list(&self) -> Vec<Unit> {
        let mut units = Vec::new();
        for slot in self.slots() {
            units.push(slot.snapshot().await);
        }
        units
    }

    pub async fn upsert_runtime_state(
        &self,
        name: &UnitName,
        update: RuntimeUpdate,
    ) -> Result<Unit, RegistryError> {
        let slot = self.get(name)?;
        let mut runtime = slot.lock().await;
        slot.apply(&mut runtime, update);
        Ok(slot.snapshot_of(&runtime))
    }

    /// The unit plus one level of dependency snapshots.
    ///
    /// Locks are taken one unit at a time, never nested.
    pub async fn resolve_dependencies(&self, name: &UnitName) -> Result<ResolvedUnit, RegistryError> {
        let slot = self.get(name)?;
        let unit = slot.snapshot().await;
        let mut dependencies = Vec::with_capacity(slot.definition().dependencies.len());
        for dependency in &slot.definition().dependencies {
            match self.get(dependency) {
                Ok(dep) => dependencies.push(dep.snapshot().await),
                Err(err) => {
                    tracing::warn!(unit = %name, error = %err, "skipping unresolvable dependency");
                }
            }
        }
        Ok(ResolvedUnit { unit, dependencies })
    }

    pub async fn resolve_all(&self) -> Vec<ResolvedUnit> {
        let mut resolved = Vec::new();
        for name in self.names() {
            if let Ok(unit) = self.resolve_dependencies(&name).await {
                resolved.push(unit);
            }
        }
        resolved
    }
}
