//! `keeper daemon`: run the supervisor in the foreground or control it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use keeper_core::Configuration;
use keeper_daemon::{list_units, ping, request_shutdown, start_blocking, DaemonError};

use super::socket_path;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until stopped.
    Start(DaemonStartArgs),
    /// Ask the daemon to stop its units and exit.
    Stop,
    /// Report whether the daemon is reachable, as JSON.
    Status,
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// YAML file describing the units to supervise.
    #[arg(long, short, value_name = "FILE")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

pub fn run(command: DaemonCommand, socket: Option<&Path>) -> Result<()> {
    match command {
        DaemonCommand::Start(args) => {
            let config = Configuration::from_file(&args.config).with_context(|| {
                format!("failed to load configuration from {}", args.config.display())
            })?;
            start_blocking(config, socket.map(Path::to_path_buf), args.json_logs)
                .context("daemon exited with error")?;
        }
        DaemonCommand::Stop => {
            let socket = socket_path(socket)?;
            match request_shutdown(&socket) {
                Ok(()) => println!("daemon stop requested"),
                Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
                Err(err) => return Err(err).context("failed to stop daemon"),
            }
        }
        DaemonCommand::Status => {
            let socket = socket_path(socket)?;
            let payload = match ping(&socket, "status") {
                Ok(_) => {
                    let units = list_units(&socket).context("failed to list units")?;
                    let running = units.iter().filter(|u| u.state.is_running()).count();
                    serde_json::json!({
                        "running": true,
                        "socket": socket.display().to_string(),
                        "units": units.len(),
                        "units_running": running,
                    })
                }
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket.display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
    }

    Ok(())
}
