//! Download tasks.
//!
//! A task is one requested shard archive: its index and the URL it is
//! fetched from. Tasks are owned by the [`TaskQueue`](crate::queue::TaskQueue);
//! everything else works on clones.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Identifier of a download task (the shard index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Creates a task id from a shard index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the shard index.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Big-endian key bytes, used for durable tables.
    pub(crate) fn to_key(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = key.try_into().ok()?;
        Some(Self(u32::from_be_bytes(bytes)))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TaskId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Lifecycle status of a queued task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for its turn.
    Queued,
    /// Currently being downloaded (always the queue head).
    Active,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// One requested shard archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// Where the archive is downloaded from.
    pub source: Url,
    /// Current status.
    pub status: TaskStatus,
}

impl Task {
    /// Creates a queued task.
    pub fn new(id: TaskId, source: Url) -> Self {
        Self {
            id,
            source,
            status: TaskStatus::Queued,
        }
    }

    /// Whether the task is the one being downloaded.
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// Parses and checks a source locator.
///
/// Only `https` locators are accepted unless `allow_plain_http` is set.
pub fn parse_locator(raw: &str, allow_plain_http: bool) -> Result<Url, RegistrationError> {
    let invalid = |reason: String| RegistrationError::InvalidLocator {
        locator: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "https" => {}
        "http" if allow_plain_http => {}
        scheme => return Err(invalid(format!("unsupported scheme '{}'", scheme))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
