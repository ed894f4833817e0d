//! Newline-delimited JSON protocol between `keeper` clients and the daemon.
//!
//! Every request is one line `{"method": ..., "data": {...}}` and gets
//! exactly one response line.

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use keeper_core::{ResolvedUnit, Unit, UnitName, UnitState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    Ping,
    ListUnits,
    StartUnit,
    StopUnit,
    GetUnits,
    Shutdown,
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcMethod::Ping => "ping",
            RpcMethod::ListUnits => "list_units",
            RpcMethod::StartUnit => "start_unit",
            RpcMethod::StopUnit => "stop_unit",
            RpcMethod::GetUnits => "get_units",
            RpcMethod::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: RpcMethod,
    #[serde(default)]
    pub data: Value,
}

impl RpcRequest {
    pub fn new<T: Serialize>(method: RpcMethod, payload: &T) -> Result<Self, DaemonError> {
        Ok(Self {
            method,
            data: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Disabled,
    DependencyUnsatisfied,
    LaunchFailure,
    InvalidRequest,
    UnknownMethod,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RpcFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echo of the request method; absent when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RpcMethod>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFailure>,
}

impl RpcResponse {
    pub fn ok(method: RpcMethod, data: Value) -> Self {
        Self {
            method: Some(method),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(method: Option<RpcMethod>, failure: RpcFailure) -> Self {
        Self {
            method,
            ok: false,
            data: None,
            error: Some(failure),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUnitsRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUnitsResponse {
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub unit_name: UnitName,
}

/// Result of a successful start or stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitActionResponse {
    pub message: String,
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUnitsRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUnitsResponse {
    pub units: Vec<ResolvedUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub stopping: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &RpcRequest) -> Result<RpcResponse, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: RpcResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Typed round trip: encode `payload`, send it, decode the success data.
pub fn call<Req, Resp>(socket: &Path, method: RpcMethod, payload: &Req) -> Result<Resp, DaemonError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let response = send_request(socket, &RpcRequest::new(method, payload)?)?;
    let data = response_into_data(response)?;
    Ok(serde_json::from_value(data)?)
}

/// Ping, retrying briefly while the daemon is still binding its socket.
pub fn ping(socket: &Path, message: &str) -> Result<PingResponse, DaemonError> {
    let request = PingRequest {
        message: message.to_string(),
    };

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match call(socket, RpcMethod::Ping, &request) {
            Ok(response) => return Ok(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon ping retry loop exited unexpectedly".to_string())
    }))
}

pub fn list_units(socket: &Path) -> Result<Vec<Unit>, DaemonError> {
    let response: ListUnitsResponse = call(socket, RpcMethod::ListUnits, &ListUnitsRequest {})?;
    Ok(response.units)
}

pub fn start_unit(socket: &Path, unit: &UnitName) -> Result<UnitActionResponse, DaemonError> {
    call(
        socket,
        RpcMethod::StartUnit,
        &UnitRequest {
            unit_name: unit.clone(),
        },
    )
}

pub fn stop_unit(socket: &Path, unit: &UnitName) -> Result<UnitActionResponse, DaemonError> {
    call(
        socket,
        RpcMethod::StopUnit,
        &UnitRequest {
            unit_name: unit.clone(),
        },
    )
}

pub fn get_units(socket: &Path) -> Result<Vec<ResolvedUnit>, DaemonError> {
    let response: GetUnitsResponse = call(socket, RpcMethod::GetUnits, &GetUnitsRequest {})?;
    Ok(response.units)
}

pub fn request_shutdown(socket: &Path) -> Result<(), DaemonError> {
    let _: ShutdownResponse = call(socket, RpcMethod::Shutdown, &serde_json::json!({}))?;
    Ok(())
}

fn response_into_data(response: RpcResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(match response.error {
            Some(failure) => DaemonError::Rpc {
                kind: failure.kind,
                message: failure.message,
            },
            None => DaemonError::Protocol("daemon reported failure without detail".to_string()),
        })
    }
}
