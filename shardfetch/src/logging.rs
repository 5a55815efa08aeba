//! Tracing subscriber setup.
//!
//! Events go to stderr and, optionally, to a daily-rolling file. The filter
//! comes from `RUST_LOG` when set, otherwise from [`LogConfig::filter`].
//!
//! ```ignore
//! let _guard = shardfetch::logging::init_logging(LogConfig::default())?;
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directive.
pub const DEFAULT_FILTER: &str = "shardfetch=info";

/// Filter directive used for verbose output.
pub const VERBOSE_FILTER: &str = "shardfetch=debug";

/// Default file name prefix for rolling log files.
pub const DEFAULT_FILE_PREFIX: &str = "shardfetch.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },

    #[error("failed to create log directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives, e.g. `shardfetch=debug,reqwest=warn`.
    pub filter: String,
    /// Directory for daily-rolling log files; stderr only when `None`.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rolling files.
    pub file_prefix: String,
    /// Colour stderr output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            log_dir: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Switches to the verbose filter.
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.filter = VERBOSE_FILTER.to_string();
        }
        self
    }

    /// Also writes to daily-rolling files in `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Sets the filter directives.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter).map_err(|e| LoggingError::Filter {
            filter: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Keeps the file writer flushing. Drop it only at exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber.
pub fn init_logging(config: LogConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = config.env_filter()?;

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi)
                .with_target(false),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}
