//! Process launching.
//!
//! The supervisor talks to processes only through [`Launcher`] and
//! [`ProcessHandle`], so tests substitute in-memory fakes and the daemon
//! uses [`CommandLauncher`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use keeper_core::UnitDefinition;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getgid, getuid, Pid};
use thiserror::Error;
use tokio::process::{Child, Command};

/// Everything needed to start one unit process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}

impl From<&UnitDefinition> for LaunchSpec {
    fn from(definition: &UnitDefinition) -> Self {
        Self {
            executable: definition.executable.clone(),
            arguments: definition.arguments.clone(),
            uid: definition.uid,
            gid: definition.gid,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spawned {} but it exited before a pid was assigned", executable.display())]
    MissingPid { executable: PathBuf },
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Still alive after the grace period; SIGKILL sent.
    Forced,
    /// Had already exited before any signal was sent.
    AlreadyExited,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Graceful => write!(f, "terminated"),
            Termination::Forced => write!(f, "killed after grace period"),
            Termination::AlreadyExited => write!(f, "already exited"),
        }
    }
}

/// A live process owned by the supervisor.
#[async_trait]
pub trait ProcessHandle: Send + fmt::Debug {
    fn pid(&self) -> u32;

    /// Non-blocking exit check. `Ok(None)` while the process runs.
    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>>;

    /// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the process.
    async fn terminate(&mut self, grace: Duration) -> io::Result<Termination>;
}

#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Switching identity needs privileges; only ask when it differs.
        if spec.gid != getgid().as_raw() {
            command.gid(spec.gid);
        }
        if spec.uid != getuid().as_raw() {
            command.uid(spec.uid);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            executable: spec.executable.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| LaunchError::MissingPid {
            executable: spec.executable.clone(),
        })?;

        Ok(Box::new(ChildHandle { child, pid }))
    }
}

#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    pid: u32,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<Termination> {
        if self.child.try_wait()?.is_some() {
            return Ok(Termination::AlreadyExited);
        }

        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.child.wait().await?;
                return Ok(Termination::AlreadyExited);
            }
            Err(errno) => return Err(io::Error::from(errno)),
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
                Ok(Termination::Graceful)
            }
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed, sending SIGKILL",
                );
                self.child.kill().await?;
                Ok(Termination::Forced)
            }
        }
    }
}
