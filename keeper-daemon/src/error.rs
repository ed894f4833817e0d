use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::FailureKind;
use crate::registry::RegistryError;

/// Error surface for the daemon runtime, socket protocol and client helpers.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] keeper_core::ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered, but with a failure.
    #[error("{message}")]
    Rpc { kind: FailureKind, message: String },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("cannot determine home directory; pass --socket explicitly")]
    HomeNotFound,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
