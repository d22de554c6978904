//! Error types for obligationd

use obligation_engine::{EngineError, ExternalError};
use thiserror::Error;

/// Daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Seed file could not be read
    #[error("Failed to read seed file {path}: {source}")]
    SeedIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Seed file is not a JSON array of obligations
    #[error("Invalid seed data: {0}")]
    SeedFormat(#[from] serde_json::Error),

    /// Seed record rejected
    #[error("Invalid seed record {index}: {reason}")]
    SeedRecord { index: usize, reason: String },

    /// Drafter backend could not be built
    #[error("Drafter error: {0}")]
    Drafter(#[from] ExternalError),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        DaemonError::Config(err.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
