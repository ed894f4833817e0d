//! keeper daemon: unit registry, supervision engine, health probing and the
//! Unix socket control protocol.

pub mod dispatch;
mod error;
pub mod launcher;
pub mod lifecycle;
pub mod paths;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod restart;
mod runtime;
pub mod supervisor;

pub use dispatch::Dispatcher;
pub use error::DaemonError;
pub use launcher::{CommandLauncher, LaunchError, LaunchSpec, Launcher, ProcessHandle, Termination};
pub use probe::{CommandLivenessCheck, LivenessCheck, ProbeReport, ProbeTarget, Prober};
pub use protocol::{
    get_units, list_units, ping, request_shutdown, send_request, start_unit, stop_unit,
    FailureKind, RpcFailure, RpcMethod, RpcRequest, RpcResponse,
};
pub use registry::{RegistryError, RuntimeUpdate, UnitRegistry};
pub use restart::{ExitHistory, RestartDecision, RestartEngine};
pub use runtime::{init_tracing, run, run_with, start_blocking};
pub use supervisor::{StartOutcome, StopOutcome, Supervisor, SupervisorError};
