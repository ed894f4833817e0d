//! Maps protocol requests onto supervisor operations.

use std::sync::Arc;

use keeper_core::{UnitName, UnitState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::protocol::{
    FailureKind, GetUnitsResponse, ListUnitsResponse, PingRequest, PingResponse, RpcFailure,
    RpcMethod, RpcResponse, ShutdownResponse, UnitActionResponse, UnitRequest,
};
use crate::supervisor::{StartOutcome, StopOutcome, Supervisor, SupervisorError};

pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            supervisor,
            shutdown_tx,
        }
    }

    /// Handle one raw request line. Malformed input becomes a failure
    /// response, never an error.
    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        let request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return RpcResponse::failure(
                    None,
                    RpcFailure::new(
                        FailureKind::InvalidRequest,
                        format!("invalid request JSON: {err}"),
                    ),
                )
            }
        };

        let Some(method_name) = request.get("method").and_then(Value::as_str) else {
            return RpcResponse::failure(
                None,
                RpcFailure::new(FailureKind::InvalidRequest, "request has no method"),
            );
        };
        let method: RpcMethod = match serde_json::from_value(Value::String(method_name.into())) {
            Ok(method) => method,
            Err(_) => {
                tracing::debug!(method = method_name, "unknown rpc method");
                return RpcResponse::failure(
                    None,
                    RpcFailure::new(
                        FailureKind::UnknownMethod,
                        format!("unknown method '{method_name}'"),
                    ),
                );
            }
        };

        let data = match request.get("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data.clone(),
        };
        self.dispatch(method, data).await
    }

    pub async fn dispatch(&self, method: RpcMethod, data: Value) -> RpcResponse {
        tracing::debug!(%method, "rpc request");
        let result = match method {
            RpcMethod::Ping => self.ping(data),
            RpcMethod::ListUnits => self.list_units().await,
            RpcMethod::StartUnit => self.start_unit(data).await,
            RpcMethod::StopUnit => self.stop_unit(data).await,
            RpcMethod::GetUnits => self.get_units().await,
            RpcMethod::Shutdown => self.shutdown(),
        };
        match result {
            Ok(data) => RpcResponse::ok(method, data),
            Err(failure) => {
                tracing::debug!(%method, kind = ?failure.kind, message = %failure.message, "rpc failed");
                RpcResponse::failure(Some(method), failure)
            }
        }
    }

    fn ping(&self, data: Value) -> Result<Value, RpcFailure> {
        let PingRequest { message } = decode(RpcMethod::Ping, data)?;
        encode(&PingResponse { message })
    }

    async fn list_units(&self) -> Result<Value, RpcFailure> {
        let units = self.supervisor.registry().list().await;
        encode(&ListUnitsResponse { units })
    }

    async fn get_units(&self) -> Result<Value, RpcFailure> {
        let units = self.supervisor.registry().resolve_all().await;
        encode(&GetUnitsResponse { units })
    }

    async fn start_unit(&self, data: Value) -> Result<Value, RpcFailure> {
        let UnitRequest { unit_name } = decode(RpcMethod::StartUnit, data)?;
        let response = match self.supervisor.start_unit(&unit_name).await {
            Ok(StartOutcome::Started { pid }) => UnitActionResponse {
                message: format!("unit {unit_name} started (pid {pid})"),
                state: UnitState::Running,
                pid: Some(pid),
            },
            Ok(StartOutcome::AlreadyActive(state)) => UnitActionResponse {
                message: format!("unit {unit_name} is already {state}"),
                state,
                pid: self.current_pid(&unit_name).await,
            },
            Err(err) => return Err(failure_for(&err)),
        };
        encode(&response)
    }

    async fn stop_unit(&self, data: Value) -> Result<Value, RpcFailure> {
        let UnitRequest { unit_name } = decode(RpcMethod::StopUnit, data)?;
        let message = match self.supervisor.stop_unit(&unit_name).await {
            Ok(StopOutcome::Stopped(termination)) => {
                format!("unit {unit_name} stopped ({termination})")
            }
            Ok(StopOutcome::AlreadyStopped) => format!("unit {unit_name} is already stopped"),
            Ok(StopOutcome::StoppedConcurrently) => {
                format!("unit {unit_name} stopped by a concurrent request")
            }
            Ok(StopOutcome::StoppedWithError(err)) => {
                format!("unit {unit_name} stopped with error: {err}")
            }
            Err(err) => return Err(failure_for(&err)),
        };
        encode(&UnitActionResponse {
            message,
            state: UnitState::Stopped,
            pid: None,
        })
    }

    fn shutdown(&self) -> Result<Value, RpcFailure> {
        tracing::info!("shutdown requested over socket");
        let _ = self.shutdown_tx.send(());
        encode(&ShutdownResponse { stopping: true })
    }

    async fn current_pid(&self, name: &UnitName) -> Option<u32> {
        self.supervisor
            .registry()
            .snapshot(name)
            .await
            .ok()
            .and_then(|unit| unit.pid)
    }
}

pub fn failure_for(err: &SupervisorError) -> RpcFailure {
    let kind = match err {
        SupervisorError::NotFound(_) => FailureKind::NotFound,
        SupervisorError::Disabled(_) => FailureKind::Disabled,
        SupervisorError::DependencyUnsatisfied { .. } => FailureKind::DependencyUnsatisfied,
        SupervisorError::LaunchFailure { .. } => FailureKind::LaunchFailure,
        SupervisorError::Registry(_) => FailureKind::Internal,
    };
    RpcFailure::new(kind, err.to_string())
}

fn decode<T: DeserializeOwned>(method: RpcMethod, data: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(data).map_err(|err| {
        RpcFailure::new(
            FailureKind::InvalidRequest,
            format!("invalid {method} request: {err}"),
        )
    })
}

fn encode<T: Serialize>(payload: &T) -> Result<Value, RpcFailure> {
    serde_json::to_value(payload).map_err(|err| {
        RpcFailure::new(
            FailureKind::Internal,
            format!("failed to encode response: {err}"),
        )
    })
}
