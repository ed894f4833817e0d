pub mod control;
pub mod daemon;
pub mod units;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// `--socket` if given, otherwise `~/.keeper/keeper.sock`.
pub fn socket_path(explicit: Option<&Path>) -> Result<PathBuf> {
    keeper_daemon::paths::resolve_socket(explicit).context("could not determine daemon socket")
}
