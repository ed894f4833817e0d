//! `keeper list` and `keeper units`: unit state views.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use colored::{ColoredString, Colorize};
use tabled::{settings::Style, Table, Tabled};

use keeper_core::{ProbeState, ResolvedUnit, Unit, UnitState};

use super::socket_path;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListArgs {
    pub fn run(self, socket: Option<&Path>) -> Result<()> {
        let socket = socket_path(socket)?;
        let units = keeper_daemon::list_units(&socket).context("failed to list units")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&units).context("failed to serialize units JSON")?
            );
            return Ok(());
        }
        print_table(&units);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct UnitsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl UnitsArgs {
    pub fn run(self, socket: Option<&Path>) -> Result<()> {
        let socket = socket_path(socket)?;
        let resolved = keeper_daemon::get_units(&socket).context("failed to get units")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&resolved)
                    .context("failed to serialize units JSON")?
            );
            return Ok(());
        }
        print_tree(&resolved);
        Ok(())
    }
}

#[derive(Tabled)]
struct UnitTableRow {
    #[tabled(rename = "unit")]
    name: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "pid")]
    pid: String,
    #[tabled(rename = "uptime")]
    uptime: String,
    #[tabled(rename = "restarts")]
    restarts: u32,
    #[tabled(rename = "policy")]
    policy: String,
    #[tabled(rename = "process")]
    process: ProbeState,
    #[tabled(rename = "liveness")]
    liveness: ProbeState,
    #[tabled(rename = "started")]
    started: String,
}

impl From<&Unit> for UnitTableRow {
    fn from(unit: &Unit) -> Self {
        let state = if unit.enabled {
            unit.state.to_string()
        } else {
            format!("{} (disabled)", unit.state)
        };
        Self {
            name: unit.name.to_string(),
            state,
            pid: unit.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            uptime: if unit.state == UnitState::Stopped {
                "-".into()
            } else {
                format_uptime(unit.uptime_s)
            },
            restarts: unit.restart_count,
            policy: unit.restart_policy.to_string(),
            process: unit.process_probe_state,
            liveness: unit.liveness_probe_state,
            started: unit
                .started_at
                .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into()),
        }
    }
}

fn print_table(units: &[Unit]) {
    let running = units.iter().filter(|u| u.state.is_running()).count();
    println!(
        "keeper v{} | {} units | {} running",
        env!("CARGO_PKG_VERSION"),
        units.len(),
        running,
    );

    if units.is_empty() {
        println!("No units configured.");
        return;
    }

    let mut table = Table::new(units.iter().map(UnitTableRow::from));
    table.with(Style::rounded());
    println!("{table}");

    for unit in units.iter().filter(|u| u.last_error.is_some()) {
        if let Some(error) = &unit.last_error {
            println!("{} {}: {}", "!".yellow(), unit.name.to_string().bold(), error);
        }
    }
}

fn print_tree(resolved: &[ResolvedUnit]) {
    for entry in resolved {
        println!(
            "{}  {}",
            entry.unit.name.to_string().bold(),
            paint_state(entry.unit.state)
        );
        let count = entry.dependencies.len();
        for (index, dependency) in entry.dependencies.iter().enumerate() {
            let branch = if index + 1 == count { "└─" } else { "├─" };
            println!(
                "  {} {}  {}",
                branch,
                dependency.name,
                paint_state(dependency.state)
            );
        }
    }
}

fn paint_state(state: UnitState) -> ColoredString {
    let label = state.to_string();
    match state {
        UnitState::Running | UnitState::RunningAndHealthy => label.green(),
        UnitState::RunningButDegraded => label.yellow(),
        UnitState::Starting | UnitState::Stopping => label.cyan(),
        UnitState::Stopped => label.bright_black(),
    }
}

/// `59s`, `4m 05s`, `2h 03m 00s`, `3d 01h 00m`.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{days}d {hours:02}h {minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}
