//! Configuration for the shard downloader.

use std::path::PathBuf;
use std::time::Duration;

use crate::policy::{RetryPolicy, ValidationPolicy};
use crate::store::{SinkKind, CHUNK_LIMIT};
use crate::transport::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT};

/// Default per-read timeout while streaming a body.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

const TASK_TABLE_DIR: &str = "tasks";
const CHUNK_TABLE_DIR: &str = "chunks";

/// Configuration for a [`TaskCoordinator`](crate::TaskCoordinator).
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Directory holding the task table.
    pub state_dir: PathBuf,

    /// Directory holding the in-flight file.
    ///
    /// Defaults to `chunks` under the state directory.
    pub chunk_dir: Option<PathBuf>,

    /// Which body sink stores the in-flight file.
    pub sink: SinkKind,

    /// Maximum size of a single stored chunk.
    pub chunk_limit: u32,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for a single body read.
    ///
    /// An expired read is treated as a dropped connection.
    pub read_timeout: Duration,

    /// Reconnect policy for transient faults.
    pub retry: RetryPolicy,

    /// Re-download policy for validation and consistency faults.
    pub validation: ValidationPolicy,

    /// Whether `http` locators are accepted in addition to `https`.
    pub allow_plain_http: bool,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            state_dir: std::env::temp_dir().join("shardfetch"),
            chunk_dir: None,
            sink: SinkKind::default(),
            chunk_limit: CHUNK_LIMIT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            validation: ValidationPolicy::default(),
            allow_plain_http: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DownloaderConfig {
    /// Create a new configuration with the given state directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Set a separate directory for the in-flight file.
    pub fn with_chunk_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.chunk_dir = Some(path.into());
        self
    }

    /// Select the body sink.
    pub fn with_sink(mut self, sink: SinkKind) -> Self {
        self.sink = sink;
        self
    }

    /// Set the maximum chunk size.
    pub fn with_chunk_limit(mut self, limit: u32) -> Self {
        self.chunk_limit = limit;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the re-download policy.
    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = validation;
        self
    }

    /// Accept or refuse plain `http` locators.
    pub fn with_allow_plain_http(mut self, allow: bool) -> Self {
        self.allow_plain_http = allow;
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Location of the task table.
    pub fn task_table_path(&self) -> PathBuf {
        self.state_dir.join(TASK_TABLE_DIR)
    }

    /// Location of the in-flight file's storage.
    pub fn chunk_table_path(&self) -> PathBuf {
        self.chunk_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join(CHUNK_TABLE_DIR))
    }
}
