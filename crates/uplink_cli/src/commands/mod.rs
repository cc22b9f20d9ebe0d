//! CLI command implementations.

pub mod classify;
pub mod config;
pub mod simulate;

use std::path::PathBuf;
use thiserror::Error;
use uplink_engine::SyncError;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The uplink configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] SyncError),

    /// A simulation plan could not be parsed.
    #[error("invalid plan: {0}")]
    Plan(#[from] serde_json::Error),

    /// A command-line argument could not be parsed.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The output format is not known.
    #[error("unknown format: {0} (expected text or json)")]
    Format(String),
}

/// Output format of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses `text` or `json`.
    pub fn parse(s: &str) -> Result<Self, CliError> {
        match s {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(CliError::Format(other.to_string())),
        }
    }
}

/// Reads a whole file.
pub fn read_file(path: &std::path::Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}
