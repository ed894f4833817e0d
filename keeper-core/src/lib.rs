//! keeper core library: domain types and configuration.
//!
//! Public API surface:
//! - [`types`]: unit names, states, definitions and wire records
//! - [`config`]: YAML configuration loading and dependency validation
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Configuration, ProbeSettings, RestartSettings};
pub use error::ConfigError;
pub use types::{
    ProbeCommand, ProbeState, ResolvedUnit, RestartPolicy, Unit, UnitDefinition, UnitName,
    UnitState,
};
