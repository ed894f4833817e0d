//! Health probing.
//!
//! Each round the [`Prober`] snapshots the running units and spawns one
//! probe task per unit, skipping units whose previous probe has not
//! finished. A task checks the process (non-blocking) and, when due, runs
//! the unit's liveness command, then hands the verdicts to the supervisor.
//! Each probe is bounded by the configured deadline, stretched for liveness
//! commands whose own timeout is longer; a miss is reported as `Undefined`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::{ProbeCommand, ProbeSettings, ProbeState, UnitName};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::DaemonError;
use crate::supervisor::Supervisor;

const LIVENESS_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run liveness probe {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for liveness probe {}: {source}", executable.display())]
    Wait {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process check failed: {0}")]
    Process(#[source] io::Error),

    #[error("probe missed its {}ms deadline", .0.as_millis())]
    Deadline(Duration),
}

/// Verdicts from one probe round. `liveness` is `None` when no liveness
/// probe ran this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub process: ProbeState,
    pub liveness: Option<ProbeState>,
}

/// A running unit as seen when the round started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: UnitName,
    pub generation: u64,
    pub liveness: Option<ProbeCommand>,
}

#[async_trait]
pub trait LivenessCheck: Send + Sync + 'static {
    async fn check(&self, probe: &ProbeCommand) -> Result<ProbeState, ProbeError>;
}

/// Runs the probe command: exit 0 is alive, anything else or a timeout is
/// dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLivenessCheck;

#[async_trait]
impl LivenessCheck for CommandLivenessCheck {
    async fn check(&self, probe: &ProbeCommand) -> Result<ProbeState, ProbeError> {
        let mut child = Command::new(&probe.executable)
            .args(&probe.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                executable: probe.executable.clone(),
                source,
            })?;

        match tokio::time::timeout(probe.timeout(), child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(ProbeState::Alive),
            Ok(Ok(_)) => Ok(ProbeState::Dead),
            Ok(Err(source)) => Err(ProbeError::Wait {
                executable: probe.executable.clone(),
                source,
            }),
            Err(_) => {
                let _ = child.kill().await;
                Ok(ProbeState::Dead)
            }
        }
    }
}

async fn within<F>(deadline: Duration, probe: F) -> Result<ProbeState, ProbeError>
where
    F: Future<Output = Result<ProbeState, ProbeError>>,
{
    tokio::time::timeout(deadline, probe)
        .await
        .unwrap_or(Err(ProbeError::Deadline(deadline)))
}

/// A liveness command always gets its own timeout plus a margin, so a hung
/// command reads as `Dead` rather than as a missed deadline.
fn liveness_budget(deadline: Duration, command: &ProbeCommand) -> Duration {
    deadline.max(command.timeout() + LIVENESS_MARGIN)
}

fn verdict(unit: &UnitName, kind: &str, result: Result<ProbeState, ProbeError>) -> ProbeState {
    result.unwrap_or_else(|err| {
        tracing::warn!(unit = %unit, probe = kind, error = %err, "probe inconclusive");
        ProbeState::Undefined
    })
}

/// Probe one unit. Liveness only runs when asked to and the process is
/// known to be alive.
pub async fn probe_unit(
    supervisor: &Supervisor,
    liveness: &dyn LivenessCheck,
    target: &ProbeTarget,
    deadline: Duration,
    check_liveness: bool,
) -> ProbeReport {
    let process = verdict(
        &target.name,
        "process",
        within(
            deadline,
            supervisor.probe_process(&target.name, target.generation),
        )
        .await,
    );

    let liveness = match (&target.liveness, check_liveness, process) {
        (Some(command), true, ProbeState::Alive) => Some(verdict(
            &target.name,
            "liveness",
            within(liveness_budget(deadline, command), liveness.check(command)).await,
        )),
        _ => None,
    };

    ProbeReport { process, liveness }
}

pub async fn probe_and_apply(
    supervisor: Arc<Supervisor>,
    liveness: Arc<dyn LivenessCheck>,
    target: ProbeTarget,
    deadline: Duration,
    check_liveness: bool,
) {
    let report = probe_unit(
        &supervisor,
        liveness.as_ref(),
        &target,
        deadline,
        check_liveness,
    )
    .await;
    if let Err(err) = supervisor
        .apply_probe(&target.name, target.generation, report)
        .await
    {
        tracing::warn!(unit = %target.name, error = %err, "failed to apply probe verdict");
    }
}

pub struct Prober {
    supervisor: Arc<Supervisor>,
    liveness: Arc<dyn LivenessCheck>,
    interval: Duration,
    deadline: Duration,
    in_flight: HashMap<UnitName, JoinHandle<()>>,
    /// Generation and time of the last liveness run per unit.
    last_liveness: HashMap<UnitName, (u64, Instant)>,
}

impl Prober {
    pub fn new(
        supervisor: Arc<Supervisor>,
        liveness: Arc<dyn LivenessCheck>,
        settings: &ProbeSettings,
    ) -> Self {
        Self {
            supervisor,
            liveness,
            interval: settings.interval(),
            deadline: settings.deadline(),
            in_flight: HashMap::new(),
            last_liveness: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    let spawned = self.tick().await;
                    if spawned > 0 {
                        tracing::trace!(spawned, "probe round");
                    }
                }
            }
        }

        self.settle().await;
        Ok(())
    }

    /// Start one probe round. Returns how many probe tasks were spawned.
    pub async fn tick(&mut self) -> usize {
        self.in_flight.retain(|_, handle| !handle.is_finished());

        let targets = self.supervisor.probe_targets().await;
        self.last_liveness
            .retain(|name, _| targets.iter().any(|target| &target.name == name));

        let now = Instant::now();
        let mut spawned = 0;
        for target in targets {
            if self.in_flight.contains_key(&target.name) {
                tracing::debug!(unit = %target.name, "previous probe still running, skipping");
                continue;
            }

            let check_liveness = match &target.liveness {
                Some(command) => match self.last_liveness.get(&target.name) {
                    Some((generation, at))
                        if *generation == target.generation
                            && now.saturating_duration_since(*at) < command.interval() =>
                    {
                        false
                    }
                    _ => true,
                },
                None => false,
            };
            if check_liveness {
                self.last_liveness
                    .insert(target.name.clone(), (target.generation, now));
            }

            let name = target.name.clone();
            let handle = tokio::spawn(probe_and_apply(
                Arc::clone(&self.supervisor),
                Arc::clone(&self.liveness),
                target,
                self.deadline,
                check_liveness,
            ));
            self.in_flight.insert(name, handle);
            spawned += 1;
        }
        spawned
    }

    /// Wait for every outstanding probe task.
    pub async fn settle(&mut self) {
        for (name, handle) in self.in_flight.drain() {
            if let Err(err) = handle.await {
                tracing::warn!(unit = %name, error = %err, "probe task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(executable: &str, arguments: &[&str], timeout_s: u64) -> ProbeCommand {
        ProbeCommand {
            executable: PathBuf::from(executable),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            interval_s: 1,
            timeout_s,
        }
    }

    #[tokio::test]
    async fn zero_exit_is_alive() {
        let state = CommandLivenessCheck
            .check(&command("true", &[], 2))
            .await
            .expect("probe");
        assert_eq!(state, ProbeState::Alive);
    }

    #[tokio::test]
    async fn nonzero_exit_is_dead() {
        let state = CommandLivenessCheck
            .check(&command("sh", &["-c", "exit 3"], 2))
            .await
            .expect("probe");
        assert_eq!(state, ProbeState::Dead);
    }

    #[tokio::test]
    async fn timeout_is_dead() {
        let state = CommandLivenessCheck
            .check(&command("sleep", &["5"], 1))
            .await
            .expect("probe");
        assert_eq!(state, ProbeState::Dead);
    }

    #[tokio::test]
    async fn missing_probe_binary_is_inconclusive() {
        let result = CommandLivenessCheck
            .check(&command("/nonexistent/keeper-probe", &[], 1))
            .await;
        assert!(matches!(result, Err(ProbeError::Spawn { .. })));
        assert_eq!(
            verdict(&UnitName::from("web"), "liveness", result),
            ProbeState::Undefined
        );
    }

    #[test]
    fn liveness_budget_outlasts_the_command_timeout() {
        let hung = command("sleep", &["30"], 3);
        assert_eq!(
            liveness_budget(Duration::from_secs(1), &hung),
            Duration::from_secs(4)
        );
        let quick = command("true", &[], 1);
        assert_eq!(
            liveness_budget(Duration::from_secs(5), &quick),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_miss_is_reported() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ProbeState::Alive)
        };
        let result = within(Duration::from_secs(1), slow).await;
        assert!(matches!(result, Err(ProbeError::Deadline(_))));
    }
}
