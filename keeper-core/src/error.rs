//! Error types for keeper-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading and validating unit configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the file involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML parse error for in-memory content.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unit '{0}' is defined more than once")]
    DuplicateUnit(String),

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    /// Names along the cycle, first name repeated at the end.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("unit '{unit}' runs as unknown user '{user}'")]
    UnknownUser { unit: String, user: String },

    #[error("unit '{unit}' runs as unknown group '{group}'")]
    UnknownGroup { unit: String, group: String },
}
