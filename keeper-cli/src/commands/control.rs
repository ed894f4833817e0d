//! `keeper ping`, `keeper start`, `keeper stop`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use keeper_core::UnitName;

use super::socket_path;

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Text for the daemon to echo back.
    #[arg(default_value = "ping")]
    pub message: String,
}

impl PingArgs {
    pub fn run(self, socket: Option<&Path>) -> Result<()> {
        let socket = socket_path(socket)?;
        let response = keeper_daemon::ping(&socket, &self.message)
            .context("ping failed")?;
        println!("{}", response.message);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct UnitArgs {
    /// Unit name as written in the configuration.
    pub unit: String,
}

impl UnitArgs {
    pub fn start(self, socket: Option<&Path>) -> Result<()> {
        let socket = socket_path(socket)?;
        let unit = UnitName::from(self.unit);
        let response = keeper_daemon::start_unit(&socket, &unit)
            .with_context(|| format!("failed to start unit '{unit}'"))?;
        println!("{} {}", "✓".green(), response.message);
        Ok(())
    }

    pub fn stop(self, socket: Option<&Path>) -> Result<()> {
        let socket = socket_path(socket)?;
        let unit = UnitName::from(self.unit);
        let response = keeper_daemon::stop_unit(&socket, &unit)
            .with_context(|| format!("failed to stop unit '{unit}'"))?;
        println!("{} {}", "✓".green(), response.message);
        Ok(())
    }
}
