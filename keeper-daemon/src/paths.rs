use std::path::{Path, PathBuf};

use crate::error::DaemonError;

pub const KEEPER_DIR: &str = ".keeper";
pub const DAEMON_SOCKET: &str = "keeper.sock";

pub fn keeper_root(home: &Path) -> PathBuf {
    home.join(KEEPER_DIR)
}

pub fn socket_path(home: &Path) -> PathBuf {
    keeper_root(home).join(DAEMON_SOCKET)
}

/// `~/.keeper/keeper.sock`.
pub fn default_socket_path() -> Result<PathBuf, DaemonError> {
    dirs::home_dir()
        .map(|home| socket_path(&home))
        .ok_or(DaemonError::HomeNotFound)
}

/// Explicit path if given, otherwise the per-user default.
pub fn resolve_socket(explicit: Option<&Path>) -> Result<PathBuf, DaemonError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => default_socket_path(),
    }
}
