//! In-memory launcher and liveness fakes shared by the daemon tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::{ProbeCommand, ProbeState, RestartPolicy, UnitDefinition, UnitName};
use keeper_daemon::probe::{self, ProbeError};
use keeper_daemon::{
    LaunchError, LaunchSpec, Launcher, LivenessCheck, ProcessHandle, RestartEngine, Supervisor,
    Termination, UnitRegistry,
};

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Test-side control over one fake process.
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    exited: Arc<AtomicBool>,
    terminations: Arc<AtomicUsize>,
}

impl ProcessControl {
    pub fn crash(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    control: ProcessControl,
    term_delay: Duration,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.control.has_exited() {
            // Raw wait status for "exited with code 1".
            Ok(Some(ExitStatus::from_raw(1 << 8)))
        } else {
            Ok(None)
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> io::Result<Termination> {
        if self.control.has_exited() {
            return Ok(Termination::AlreadyExited);
        }
        self.control.terminations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.term_delay).await;
        self.control.crash();
        Ok(Termination::Graceful)
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

pub struct FakeLauncher {
    next_pid: AtomicU32,
    attempts: AtomicUsize,
    launched: Mutex<Vec<(PathBuf, ProcessControl)>>,
    failing: Mutex<HashSet<PathBuf>>,
    term_delay: Duration,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Self::with_term_delay(Duration::ZERO)
    }

    pub fn with_term_delay(term_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            attempts: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            term_delay,
        })
    }

    pub fn fail(&self, executable: &str) {
        self.failing.lock().unwrap().insert(PathBuf::from(executable));
    }

    pub fn heal(&self, executable: &str) {
        self.failing.lock().unwrap().remove(&PathBuf::from(executable));
    }

    /// Launch attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful launches of `executable`.
    pub fn launches_of(&self, executable: &str) -> usize {
        let executable = PathBuf::from(executable);
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| *path == executable)
            .count()
    }

    /// Control of the most recent process started from `executable`.
    pub fn latest(&self, executable: &str) -> ProcessControl {
        let executable = PathBuf::from(executable);
        self.launched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(path, _)| *path == executable)
            .map(|(_, control)| control.clone())
            .unwrap_or_else(|| panic!("{} was never launched", executable.display()))
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&spec.executable) {
            return Err(LaunchError::Spawn {
                executable: spec.executable.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        let control = ProcessControl::default();
        self.launched
            .lock()
            .unwrap()
            .push((spec.executable.clone(), control.clone()));
        Ok(Box::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            control,
            term_delay: self.term_delay,
        }))
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

pub struct FakeLiveness {
    verdict: Mutex<ProbeState>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeLiveness {
    pub fn new(verdict: ProbeState) -> Arc<Self> {
        Self::slow(verdict, Duration::ZERO)
    }

    pub fn slow(verdict: ProbeState, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            verdict: Mutex::new(verdict),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, verdict: ProbeState) {
        *self.verdict.lock().unwrap() = verdict;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessCheck for FakeLiveness {
    async fn check(&self, _probe: &ProbeCommand) -> Result<ProbeState, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let verdict = *self.verdict.lock().unwrap();
        Ok(verdict)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn unit(name: &str, dependencies: &[&str], policy: RestartPolicy) -> UnitDefinition {
    UnitDefinition {
        name: UnitName::from(name),
        executable: PathBuf::from(format!("/bin/{name}")),
        arguments: vec![],
        dependencies: dependencies.iter().map(|d| UnitName::from(*d)).collect(),
        restart_policy: policy,
        uid: 0,
        gid: 0,
        enabled: true,
        liveness_probe: None,
    }
}

pub fn with_liveness(mut definition: UnitDefinition) -> UnitDefinition {
    definition.liveness_probe = Some(ProbeCommand {
        executable: PathBuf::from("/bin/check"),
        arguments: vec![],
        interval_s: 1,
        timeout_s: 1,
    });
    definition
}

pub fn disabled(mut definition: UnitDefinition) -> UnitDefinition {
    definition.enabled = false;
    definition
}

/// Window 60s, backoff 1s doubling up to 10s, 1s stop grace.
pub fn supervisor(units: Vec<UnitDefinition>, launcher: &Arc<FakeLauncher>) -> Arc<Supervisor> {
    let registry = UnitRegistry::from_definitions(units).expect("registry");
    Supervisor::new(
        Arc::new(registry),
        Arc::clone(launcher) as Arc<dyn Launcher>,
        RestartEngine::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(10),
        ),
        Duration::from_secs(1),
    )
}

/// Run one probe round over every running unit, waiting for each verdict.
pub async fn probe_round(supervisor: &Arc<Supervisor>, liveness: &Arc<FakeLiveness>) {
    for target in supervisor.probe_targets().await {
        probe::probe_and_apply(
            Arc::clone(supervisor),
            Arc::clone(liveness) as Arc<dyn LivenessCheck>,
            target,
            Duration::from_secs(1),
            true,
        )
        .await;
    }
}

pub fn name(name: &str) -> UnitName {
    UnitName::from(name)
}
