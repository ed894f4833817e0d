//! keeper: process supervisor CLI.
//!
//! # Usage
//!
//! ```text
//! keeper daemon start --config <file> [--json-logs]
//! keeper daemon stop|status
//! keeper ping [message]
//! keeper list [--json]
//! keeper units [--json]
//! keeper start <unit>
//! keeper stop <unit>
//! ```
//!
//! Every command accepts `--socket <path>`; the default is
//! `~/.keeper/keeper.sock`.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    control::{PingArgs, UnitArgs},
    daemon::DaemonCommand,
    units::{ListArgs, UnitsArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "keeper",
    version,
    about = "Supervise long-running processes and control them over a local socket",
    long_about = None,
)]
struct Cli {
    /// Daemon control socket.
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the supervisor daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Check that the daemon answers.
    Ping(PingArgs),

    /// List every unit with its current state.
    List(ListArgs),

    /// Show units together with the state of their dependencies.
    Units(UnitsArgs),

    /// Start a stopped unit.
    Start(UnitArgs),

    /// Stop a running unit.
    Stop(UnitArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.as_deref();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, socket),
        Commands::Ping(args) => args.run(socket),
        Commands::List(args) => args.run(socket),
        Commands::Units(args) => args.run(socket),
        Commands::Start(args) => args.start(socket),
        Commands::Stop(args) => args.stop(socket),
    }
}
