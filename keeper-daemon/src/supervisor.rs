//! Unit supervision: explicit start/stop, probe verdicts and automatic
//! restarts.
//!
//! Every state change of a unit happens while holding that unit's lock, and
//! the state machine in [`crate::lifecycle`] decides what each event means.
//! The only work done outside the lock is waiting for a process to die
//! during a stop, so listing units never blocks on a grace period.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keeper_core::{Configuration, ProbeState, UnitName, UnitState};
use thiserror::Error;
use tokio::time::Instant;

use crate::launcher::{LaunchError, LaunchSpec, Launcher, ProcessHandle, Termination};
use crate::lifecycle::{next_state, Trigger};
use crate::probe::{ProbeError, ProbeReport, ProbeTarget};
use crate::registry::{RegistryError, RuntimeUpdate, UnitRegistry, UnitRuntime, UnitSlot};
use crate::restart::{RestartDecision, RestartEngine};

/// Floor for retrying a restart that was blocked by a stopped dependency.
const MIN_DEPENDENCY_RETRY: Duration = Duration::from_millis(100);

/// How long a probe round waits for a unit lock held by someone else.
const PROBE_LOCK_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unit '{0}' not found")]
    NotFound(UnitName),

    #[error("unit '{0}' is disabled")]
    Disabled(UnitName),

    #[error("unit '{unit}' cannot start: dependency '{dependency}' is not running")]
    DependencyUnsatisfied { unit: UnitName, dependency: UnitName },

    #[error("unit '{unit}' failed to launch: {source}")]
    LaunchFailure {
        unit: UnitName,
        #[source]
        source: LaunchError,
    },

    #[error("registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for SupervisorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => SupervisorError::NotFound(name),
            other => SupervisorError::Registry(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// The unit was not stopped; nothing was launched.
    AlreadyActive(UnitState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(Termination),
    AlreadyStopped,
    /// Another caller was already stopping the unit; this one waited for it.
    StoppedConcurrently,
    /// Signalling or reaping failed. The unit is recorded as stopped.
    StoppedWithError(String),
}

enum StopPlan {
    Terminate(Box<dyn ProcessHandle>),
    WaitForOther,
}

pub struct Supervisor {
    registry: Arc<UnitRegistry>,
    launcher: Arc<dyn Launcher>,
    engine: RestartEngine,
    stop_grace: Duration,
    next_restart_token: AtomicU64,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(
        registry: Arc<UnitRegistry>,
        launcher: Arc<dyn Launcher>,
        engine: RestartEngine,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            launcher,
            engine,
            stop_grace,
            next_restart_token: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn from_configuration(
        config: &Configuration,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Arc<Self>, RegistryError> {
        let registry = UnitRegistry::from_definitions(config.units().iter().cloned())?;
        Ok(Self::new(
            Arc::new(registry),
            launcher,
            RestartEngine::from_settings(&config.restart),
            config.stop_grace(),
        ))
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Explicit operations
    // -----------------------------------------------------------------------

    /// Start a stopped unit. Starting a unit in any other state is a no-op.
    pub async fn start_unit(&self, name: &UnitName) -> Result<StartOutcome, SupervisorError> {
        let slot = self.registry.get(name)?;
        let mut runtime = slot.lock().await;

        if runtime.state != UnitState::Stopped {
            return Ok(StartOutcome::AlreadyActive(runtime.state));
        }
        if !slot.definition().enabled {
            return Err(SupervisorError::Disabled(name.clone()));
        }
        self.check_dependencies(&slot)?;

        runtime.pending_restart = None;
        let pid = self
            .launch_locked(&slot, &mut runtime)
            .await
            .map_err(|source| SupervisorError::LaunchFailure {
                unit: name.clone(),
                source,
            })?;
        Ok(StartOutcome::Started { pid })
    }

    /// Stop a unit: SIGTERM, wait for the grace period, then SIGKILL.
    ///
    /// Concurrent calls on the same unit signal the process once; later
    /// callers wait until it is stopped.
    pub async fn stop_unit(&self, name: &UnitName) -> Result<StopOutcome, SupervisorError> {
        let slot = self.registry.get(name)?;

        let plan = {
            let mut runtime = slot.lock().await;
            match runtime.state {
                UnitState::Stopped => {
                    if runtime.pending_restart.take().is_some() {
                        tracing::info!(unit = %name, "cancelled pending restart");
                    }
                    return Ok(StopOutcome::AlreadyStopped);
                }
                UnitState::Starting | UnitState::Stopping => StopPlan::WaitForOther,
                UnitState::Running
                | UnitState::RunningAndHealthy
                | UnitState::RunningButDegraded => {
                    fire(&slot, &mut runtime, Trigger::StopRequested);
                    runtime.generation += 1;
                    match runtime.handle.take() {
                        Some(handle) => StopPlan::Terminate(handle),
                        None => {
                            finish_stop(&slot, &mut runtime);
                            return Ok(StopOutcome::Stopped(Termination::AlreadyExited));
                        }
                    }
                }
            }
        };

        let mut handle = match plan {
            StopPlan::Terminate(handle) => handle,
            StopPlan::WaitForOther => {
                let mut state_rx = slot.subscribe();
                // The sender lives in the slot we hold, so this cannot close.
                let _ = state_rx
                    .wait_for(|state| *state == UnitState::Stopped)
                    .await;
                return Ok(StopOutcome::StoppedConcurrently);
            }
        };

        tracing::info!(
            unit = %name,
            pid = handle.pid(),
            grace_ms = self.stop_grace.as_millis() as u64,
            "stopping unit",
        );
        let result = handle.terminate(self.stop_grace).await;

        let mut runtime = slot.lock().await;
        let outcome = match result {
            Ok(termination) => {
                tracing::info!(unit = %name, %termination, "unit stopped");
                StopOutcome::Stopped(termination)
            }
            Err(err) => {
                tracing::error!(unit = %name, error = %err, "failed to stop unit cleanly");
                slot.apply(
                    &mut runtime,
                    RuntimeUpdate {
                        last_error: Some(Some(format!("stop failed: {err}"))),
                        ..RuntimeUpdate::default()
                    },
                );
                StopOutcome::StoppedWithError(err.to_string())
            }
        };
        finish_stop(&slot, &mut runtime);
        Ok(outcome)
    }

    /// Start every enabled unit in `order`, logging failures.
    pub async fn start_all(&self, order: &[UnitName]) {
        for name in order {
            match self.start_unit(name).await {
                Ok(StartOutcome::Started { .. }) => {}
                Ok(StartOutcome::AlreadyActive(state)) => {
                    tracing::debug!(unit = %name, %state, "unit already active");
                }
                Err(SupervisorError::Disabled(_)) => {
                    tracing::info!(unit = %name, "unit disabled, not starting");
                }
                Err(err) => {
                    tracing::error!(unit = %name, error = %err, "failed to start unit");
                }
            }
        }
    }

    /// Stop every unit in reverse `order`. No automatic restarts happen
    /// once this has been called.
    pub async fn stop_all(&self, order: &[UnitName]) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for name in order.iter().rev() {
            if let Err(err) = self.stop_unit(name).await {
                tracing::error!(unit = %name, error = %err, "failed to stop unit");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Probing
    // -----------------------------------------------------------------------

    /// Running units, each with the generation it is probed against.
    ///
    /// A unit whose lock stays busy past a short wait is skipped for this
    /// round; that only happens while a start or stop holds it.
    pub async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let mut targets = Vec::new();
        for slot in self.registry.slots() {
            if !slot.current_state().is_running() {
                continue;
            }
            let Ok(runtime) = tokio::time::timeout(PROBE_LOCK_WAIT, slot.lock()).await else {
                tracing::debug!(unit = %slot.name(), "unit busy, probing next round");
                continue;
            };
            if !runtime.state.is_running() {
                continue;
            }
            targets.push(ProbeTarget {
                name: slot.name().clone(),
                generation: runtime.generation,
                liveness: slot.definition().liveness_probe.clone(),
            });
        }
        targets
    }

    /// Process probe: non-blocking exit check on the unit's handle.
    pub async fn probe_process(
        &self,
        name: &UnitName,
        generation: u64,
    ) -> Result<ProbeState, ProbeError> {
        let Ok(slot) = self.registry.get(name) else {
            return Ok(ProbeState::Undefined);
        };
        let mut runtime = slot.lock().await;
        if runtime.generation != generation {
            return Ok(ProbeState::Undefined);
        }
        let Some(handle) = runtime.handle.as_mut() else {
            return Ok(ProbeState::Undefined);
        };
        match handle.poll_exit() {
            Ok(None) => Ok(ProbeState::Alive),
            Ok(Some(_)) => Ok(ProbeState::Dead),
            Err(err) => Err(ProbeError::Process(err)),
        }
    }

    /// Record a probe round and act on it.
    ///
    /// Verdicts issued for an earlier generation of the unit are discarded.
    /// A dead process wins over any liveness verdict.
    pub async fn apply_probe(
        self: &Arc<Self>,
        name: &UnitName,
        generation: u64,
        report: ProbeReport,
    ) -> Result<(), SupervisorError> {
        let slot = self.registry.get(name)?;
        let mut runtime = slot.lock().await;
        if runtime.generation != generation || !runtime.state.is_running() {
            tracing::debug!(unit = %name, "discarding stale probe verdict");
            return Ok(());
        }

        slot.apply(
            &mut runtime,
            RuntimeUpdate {
                process_probe: Some(report.process),
                liveness_probe: report.liveness,
                ..RuntimeUpdate::default()
            },
        );

        if report.process == ProbeState::Dead {
            self.handle_exit(&slot, &mut runtime).await;
            return Ok(());
        }

        match report.liveness {
            Some(ProbeState::Alive) => {
                if fire(&slot, &mut runtime, Trigger::LivenessAlive) {
                    tracing::info!(unit = %name, "liveness probe passed, unit healthy");
                }
            }
            Some(ProbeState::Dead) if report.process == ProbeState::Alive => {
                if fire(&slot, &mut runtime, Trigger::LivenessDead) {
                    tracing::warn!(unit = %name, "liveness probe failed, unit degraded");
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_dependencies(&self, slot: &UnitSlot) -> Result<(), SupervisorError> {
        for dependency in &slot.definition().dependencies {
            let running = self
                .registry
                .get(dependency)
                .map(|dep| dep.current_state().is_running())
                .unwrap_or(false);
            if !running {
                return Err(SupervisorError::DependencyUnsatisfied {
                    unit: slot.name().clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    /// Stopped -> Starting -> Running, or back to Stopped if the launch
    /// fails. Caller holds the unit lock.
    async fn launch_locked(
        &self,
        slot: &UnitSlot,
        runtime: &mut UnitRuntime,
    ) -> Result<u32, LaunchError> {
        fire(slot, runtime, Trigger::StartRequested);
        let spec = LaunchSpec::from(slot.definition());

        match self.launcher.launch(&spec).await {
            Ok(handle) => {
                let pid = handle.pid();
                runtime.handle = Some(handle);
                runtime.generation += 1;
                runtime.started_at = Some(Utc::now());
                runtime.started_instant = Some(Instant::now());
                slot.apply(
                    runtime,
                    RuntimeUpdate {
                        pid: Some(Some(pid)),
                        process_probe: Some(ProbeState::Undefined),
                        liveness_probe: Some(ProbeState::Undefined),
                        ..RuntimeUpdate::default()
                    },
                );
                fire(slot, runtime, Trigger::Launched);
                tracing::info!(
                    unit = %slot.name(),
                    pid,
                    executable = %spec.executable.display(),
                    "unit started",
                );
                Ok(pid)
            }
            Err(err) => {
                slot.apply(
                    runtime,
                    RuntimeUpdate {
                        last_error: Some(Some(err.to_string())),
                        ..RuntimeUpdate::default()
                    },
                );
                fire(slot, runtime, Trigger::LaunchFailed);
                tracing::error!(unit = %slot.name(), error = %err, "unit failed to launch");
                Err(err)
            }
        }
    }

    /// The process died on its own. Caller holds the unit lock.
    async fn handle_exit(self: &Arc<Self>, slot: &Arc<UnitSlot>, runtime: &mut UnitRuntime) {
        let status = runtime
            .handle
            .take()
            .and_then(|mut handle| handle.poll_exit().ok().flatten());
        let reason = match status {
            Some(status) => format!("process exited unexpectedly: {status}"),
            None => "process exited unexpectedly".to_string(),
        };
        tracing::warn!(unit = %slot.name(), reason = %reason, "unit process died");

        fire(slot, runtime, Trigger::ProcessDead);
        if runtime.state == UnitState::Stopping {
            fire(slot, runtime, Trigger::Terminated);
        }
        slot.apply(
            runtime,
            RuntimeUpdate {
                last_error: Some(Some(reason)),
                ..RuntimeUpdate::default()
            },
        );
        runtime.generation += 1;
        runtime.exits.record(Instant::now());

        self.restart_locked(slot, runtime, false).await;
    }

    /// Consult the restart engine and act on its decision. `due` skips the
    /// first consultation because a backoff timer already decided.
    ///
    /// A failed relaunch counts as another exit and the engine is asked
    /// again; the growing exit count turns repeated failures into backoff.
    async fn restart_locked(
        self: &Arc<Self>,
        slot: &Arc<UnitSlot>,
        runtime: &mut UnitRuntime,
        mut due: bool,
    ) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) || !slot.definition().enabled {
                return;
            }

            let decision = if std::mem::take(&mut due) {
                RestartDecision::RestartNow
            } else {
                let policy = slot.definition().restart_policy;
                self.engine.decide(policy, &runtime.exits, Instant::now())
            };
            match decision {
                RestartDecision::DoNotRestart => {
                    tracing::info!(
                        unit = %slot.name(),
                        policy = %slot.definition().restart_policy,
                        "not restarting unit",
                    );
                    return;
                }
                RestartDecision::RestartAfter(delay) => {
                    self.schedule_restart(slot, runtime, delay);
                    return;
                }
                RestartDecision::RestartNow => {}
            }

            if let Err(err) = self.check_dependencies(slot) {
                tracing::warn!(unit = %slot.name(), error = %err, "restart deferred");
                let delay = self.engine.base_delay().max(MIN_DEPENDENCY_RETRY);
                self.schedule_restart(slot, runtime, delay);
                return;
            }

            runtime.restart_count += 1;
            match self.launch_locked(slot, runtime).await {
                Ok(pid) => {
                    tracing::info!(
                        unit = %slot.name(),
                        pid,
                        restart_count = runtime.restart_count,
                        "unit restarted",
                    );
                    return;
                }
                Err(_) => runtime.exits.record(Instant::now()),
            }
        }
    }

    fn schedule_restart(
        self: &Arc<Self>,
        slot: &Arc<UnitSlot>,
        runtime: &mut UnitRuntime,
        delay: Duration,
    ) {
        let token = self.next_restart_token.fetch_add(1, Ordering::Relaxed);
        runtime.pending_restart = Some(token);
        tracing::info!(
            unit = %slot.name(),
            delay_ms = delay.as_millis() as u64,
            "restart scheduled",
        );

        let supervisor = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.restart_due(&slot, token).await;
        });
    }

    async fn restart_due(self: &Arc<Self>, slot: &Arc<UnitSlot>, token: u64) {
        let mut runtime = slot.lock().await;
        if runtime.pending_restart != Some(token) {
            tracing::debug!(unit = %slot.name(), "restart timer superseded");
            return;
        }
        runtime.pending_restart = None;
        if runtime.state != UnitState::Stopped {
            return;
        }
        self.restart_locked(slot, &mut runtime, true).await;
    }
}

/// Stopping -> Stopped after an explicit stop. Probing ends with the
/// process, so both verdicts go back to `Undefined`.
fn finish_stop(slot: &UnitSlot, runtime: &mut UnitRuntime) {
    fire(slot, runtime, Trigger::Terminated);
    slot.apply(
        runtime,
        RuntimeUpdate {
            process_probe: Some(ProbeState::Undefined),
            liveness_probe: Some(ProbeState::Undefined),
            ..RuntimeUpdate::default()
        },
    );
}

/// Feed `trigger` to the state machine and commit the result. Returns
/// whether the state changed.
fn fire(slot: &UnitSlot, runtime: &mut UnitRuntime, trigger: Trigger) -> bool {
    match next_state(runtime.state, trigger) {
        Some(next) => {
            tracing::debug!(
                unit = %slot.name(),
                from = %runtime.state,
                to = %next,
                ?trigger,
                "state transition",
            );
            slot.apply(runtime, RuntimeUpdate::state(next));
            true
        }
        None => false,
    }
}
