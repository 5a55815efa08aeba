//! Progress state of the active download.
//!
//! [`DownloadState`] is the in-memory view of one task's transfer. Its
//! durable shadow is the byte count held by the body sink, which is what
//! recovery reads back after a crash.

use crate::error::SessionError;
use crate::task::TaskId;

/// Download state for the active task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadState {
    /// Task being downloaded.
    pub task: TaskId,
    /// Size of the remote archive, once a response has revealed it.
    pub total_size: Option<u64>,
    /// Bytes durably stored so far.
    pub downloaded_size: u64,
    /// Whether the transfer is paused.
    pub paused: bool,
}

impl DownloadState {
    /// Creates the state for a task resuming at `downloaded_size`.
    pub fn new(task: TaskId, downloaded_size: u64) -> Self {
        Self {
            task,
            total_size: None,
            downloaded_size,
            paused: false,
        }
    }

    /// Whether every byte of a known-size archive is stored.
    pub fn is_complete(&self) -> bool {
        self.total_size == Some(self.downloaded_size)
    }

    /// Bytes still to fetch, if the total is known.
    pub fn remaining(&self) -> Option<u64> {
        self.total_size
            .map(|total| total.saturating_sub(self.downloaded_size))
    }

    /// Progress as a ratio (0.0 to 1.0), if the total is known.
    pub fn progress_ratio(&self) -> Option<f64> {
        self.total_size.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.downloaded_size as f64 / total as f64
            }
        })
    }

    /// Records the remote size.
    ///
    /// Fails if the stored bytes already exceed it, or if a different size
    /// was learned earlier in this session.
    pub fn set_total(&mut self, total: u64) -> Result<(), SessionError> {
        if let Some(previous) = self.total_size {
            if previous != total {
                return Err(SessionError::SizeChanged {
                    previous,
                    current: total,
                });
            }
        }
        self.total_size = Some(total);
        self.check()
    }

    /// Records `bytes` newly stored bytes.
    pub fn record(&mut self, bytes: u64) -> Result<(), SessionError> {
        self.downloaded_size += bytes;
        self.check()
    }

    /// Checks `downloaded_size <= total_size`.
    pub fn check(&self) -> Result<(), SessionError> {
        match self.total_size {
            Some(total) if self.downloaded_size > total => Err(SessionError::Consistency {
                downloaded: self.downloaded_size,
                total,
            }),
            _ => Ok(()),
        }
    }
}
