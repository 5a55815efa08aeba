//! CLI error type.

use std::fmt;

use shardfetch::logging::LoggingError;
use shardfetch::{CoordinatorError, StoreError};

/// Errors surfaced by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Invalid configuration or command-line input.
    Config(String),
    /// A `--shard` argument could not be parsed.
    InvalidShard(String),
    /// Logging could not be set up.
    Logging(LoggingError),
    /// The coordinator could not be opened.
    Coordinator(CoordinatorError),
    /// The state directory could not be read.
    Store(StoreError),
    /// The async runtime could not be built.
    Runtime(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::InvalidShard(msg) => write!(f, "Invalid shard: {}", msg),
            CliError::Logging(e) => write!(f, "Logging error: {}", e),
            CliError::Coordinator(e) => write!(f, "Downloader error: {}", e),
            CliError::Store(e) => write!(f, "State directory error: {}", e),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Logging(e) => Some(e),
            CliError::Coordinator(e) => Some(e),
            CliError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<CoordinatorError> for CliError {
    fn from(e: CoordinatorError) -> Self {
        CliError::Coordinator(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        CliError::Store(e)
    }
}
