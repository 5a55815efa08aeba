//! Error types for the shard downloader.
//!
//! Errors are grouped by the layer that raises them. Faults inside a session
//! are resolved by the engine and coordinator (retry, reset or advance); only
//! a fault that settles the fate of a specific task becomes user-visible.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

/// Result type for durable storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the task table or a body sink.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The embedded database reported an error.
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("failed to encode record: {0}")]
    Encoding(#[from] bincode::Error),

    /// Filesystem I/O failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The stored chunk set violates its layout invariants.
    #[error("corrupt chunk layout: {0}")]
    Corrupt(String),

    /// The chunk limit is unusable.
    #[error("invalid chunk limit {0}")]
    InvalidChunkLimit(u32),

    /// A blocking storage job could not be completed.
    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while talking to the remote server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect or TLS handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The request or a single read exceeded its deadline.
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// The server answered with an unexpected status.
    #[error("{method} {url} returned status {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    /// The requested range starts at or past the end of the resource (416).
    #[error("range requested from {url} starts past its end (complete length {complete_length:?})")]
    RangeNotSatisfiable {
        url: String,
        /// Complete length from `Content-Range: bytes */<length>`, if sent.
        complete_length: Option<u64>,
    },

    /// The response body could not be read to completion.
    #[error("error reading body from {url}: {reason}")]
    Body { url: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl TransportError {
    /// Whether reconnecting and resuming may succeed.
    ///
    /// Connection failures, timeouts, broken bodies and the 408/429/5xx
    /// statuses are transient. Every other status is a fault of the task
    /// itself (missing archive, forbidden, ...).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } | Self::Body { .. } => true,
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Self::RangeNotSatisfiable { .. } | Self::Client(_) => false,
        }
    }
}

/// Errors that end a download session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Network-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The stored partial file is larger than the remote resource.
    #[error("stored {downloaded} bytes but the server reports {total}")]
    Consistency { downloaded: u64, total: u64 },

    /// The remote resource changed size between requests.
    #[error("remote size changed from {previous} to {current} bytes")]
    SizeChanged { previous: u64, current: u64 },

    /// A 206 response did not start at the requested offset.
    #[error("requested bytes from offset {requested}, server sent from {actual}")]
    RangeMismatch { requested: u64, actual: u64 },

    /// Durable storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transient faults persisted past the retry budget.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },
}

impl SessionError {
    /// Whether the stored bytes and the remote source have diverged.
    ///
    /// Such faults require the sink to be reset before any retry.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::Consistency { .. } | Self::SizeChanged { .. } | Self::RangeMismatch { .. }
        )
    }

    /// Whether a reconnect may clear the fault.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retriable(),
            _ => false,
        }
    }
}

/// Errors reported by the validation/import collaborator.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The archive's digest did not match the expected one.
    #[error("checksum mismatch for shard {task}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        task: TaskId,
        expected: String,
        actual: String,
    },

    /// The archive could not be imported.
    #[error("failed to import shard {task}: {reason}")]
    ImportFailed { task: TaskId, reason: String },

    /// The downloaded content could not be read back.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reasons a task registration is refused.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A task with the same id is already queued.
    #[error("shard {0} is already queued")]
    Duplicate(TaskId),

    /// Registration is closed while a download is active.
    #[error("cannot register shards while a download is active")]
    DownloadActive,

    /// The source locator is not an acceptable URL.
    #[error("invalid source locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    /// The task table could not be updated.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the download engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another session is already running on this engine.
    #[error("a download session is already running")]
    Busy,
}

/// Errors raised while constructing a coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The task table or chunk table could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP transport could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The coordinator was created outside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),
}
