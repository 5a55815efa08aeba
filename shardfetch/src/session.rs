//! Download session for a single task.
//!
//! A session walks one task through its connection attempts:
//!
//! ```text
//! Connecting ──► Requesting ──► Streaming ──┬──► Completed
//!     ▲                                     ├──► Failed
//!     │                                     ├──► Paused ──────┐
//!     │                                     └──► Interrupted ─┤
//!     └───────────────────── reconnect ◄──────────────────────┘
//! ```
//!
//! - `Connecting`: `HEAD` request (opens the connection, learns the size)
//! - `Requesting`: compares stored bytes with the remote size, then sends
//!   `GET` with `Range: bytes=<stored>-`
//! - `Streaming`: each received buffer is durably appended to the sink
//!   before the next read; the pause flag is checked between reads
//!
//! [`attempt`](Session::attempt) runs a single pass; the
//! [`DownloadEngine`](crate::engine::DownloadEngine) loops over paused and
//! interrupted passes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SessionError, TransportError};
use crate::state::DownloadState;
use crate::store::{self, BodySink};
use crate::task::Task;
use crate::transport::{BodyResponse, BodyStream, HeadResponse, Transport};

/// Session state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Requesting,
    Streaming,
    Completed,
    Paused,
    Interrupted,
    Failed,
}

impl SessionState {
    /// Whether the session can no longer make progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Requesting => "requesting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Final result of running a task's session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Every byte of the archive is stored.
    Completed { total_size: u64 },
    /// The session ended without the archive.
    Failed(SessionError),
    /// Shutdown was requested; stored bytes are kept.
    Stopped,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// How a single connection attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptEnd {
    Completed(u64),
    Paused,
    Stopped,
    Interrupted(SessionError),
    Failed(SessionError),
}

/// Connection attempts for one task.
pub struct Session {
    task: Task,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn BodySink>,
    pause: watch::Receiver<bool>,
    shutdown: CancellationToken,
    progress: watch::Sender<Option<DownloadState>>,
    read_timeout: Duration,
    state: SessionState,
    download: DownloadState,
    received: u64,
}

impl Session {
    pub(crate) fn new(
        task: Task,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn BodySink>,
        pause: watch::Receiver<bool>,
        shutdown: CancellationToken,
        progress: watch::Sender<Option<DownloadState>>,
        read_timeout: Duration,
    ) -> Self {
        let download = DownloadState::new(task.id, sink.current_size());
        Self {
            task,
            transport,
            sink,
            pause,
            shutdown,
            progress,
            read_timeout,
            state: SessionState::Connecting,
            download,
            received: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current download progress.
    pub fn download(&self) -> &DownloadState {
        &self.download
    }

    /// Bytes stored during the latest attempt.
    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn enter(&mut self, next: SessionState) {
        if self.state != next {
            debug!(task = %self.task.id, from = %self.state, to = %next, "Session transition");
            self.state = next;
        }
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.download.paused = paused;
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(Some(self.download.clone()));
    }

    fn transport_fault(&self, err: TransportError) -> AttemptEnd {
        if err.is_retriable() {
            AttemptEnd::Interrupted(err.into())
        } else {
            AttemptEnd::Failed(err.into())
        }
    }

    /// Runs one connection attempt, from connect to the end of the stream.
    pub(crate) async fn attempt(&mut self) -> AttemptEnd {
        self.enter(SessionState::Connecting);
        self.received = 0;
        self.download.downloaded_size = self.sink.current_size();
        let url = self.task.source.clone();

        let head = match self.transport.head(&url).await {
            Ok(head) => head,
            Err(TransportError::Status { status, .. }) => {
                // HEAD is optional; the GET answer carries the size too.
                debug!(task = %self.task.id, status, "HEAD rejected, size unknown until GET");
                HeadResponse::default()
            }
            Err(e) => return self.transport_fault(e),
        };

        self.enter(SessionState::Requesting);
        if let Some(total) = head.content_length {
            if let Err(e) = self.download.set_total(total) {
                return AttemptEnd::Failed(e);
            }
        }
        self.publish();

        let requested = self.download.downloaded_size;
        if self.download.is_complete() {
            // Crash window: all bytes stored, completion never recorded.
            info!(task = %self.task.id, total = requested, "Archive already fully stored");
            return AttemptEnd::Completed(requested);
        }

        debug!(task = %self.task.id, offset = requested, total = ?self.download.total_size, "Requesting body");
        let response = match self.transport.fetch(&url, requested).await {
            Ok(response) => response,
            Err(TransportError::RangeNotSatisfiable { complete_length, .. }) if requested > 0 => {
                return self.range_past_end(requested, complete_length);
            }
            Err(e) => return self.transport_fault(e),
        };

        self.enter(SessionState::Streaming);
        match self.reconcile(response, requested).await {
            Ok(body) => self.stream(body).await,
            Err(end) => end,
        }
    }

    /// Settles a 416 answer to a resume request.
    ///
    /// The server holds nothing past `stored`: the archive is complete if its
    /// length is `stored` (or unknown), otherwise the stored bytes diverged.
    fn range_past_end(&mut self, stored: u64, complete_length: Option<u64>) -> AttemptEnd {
        match complete_length.or(self.download.total_size) {
            Some(total) if total != stored => AttemptEnd::Failed(SessionError::Consistency {
                downloaded: stored,
                total,
            }),
            _ => {
                info!(task = %self.task.id, total = stored, "No bytes past the stored end, archive complete");
                self.download.total_size = Some(stored);
                self.publish();
                AttemptEnd::Completed(stored)
            }
        }
    }

    /// Checks the response against the requested range and hands back its body.
    async fn reconcile(&mut self, response: BodyResponse, requested: u64) -> Result<BodyStream, AttemptEnd> {
        if requested > 0 && !response.is_partial() {
            warn!(
                task = %self.task.id,
                requested,
                status = response.status,
                "Server ignored range request, restarting archive from byte 0"
            );
            store::blocking(&self.sink, |sink| sink.reset())
                .await
                .map_err(|e| AttemptEnd::Failed(e.into()))?;
            self.download.downloaded_size = 0;
        } else if let Some(range) = response.content_range.filter(|_| response.is_partial()) {
            if range.start != requested {
                return Err(AttemptEnd::Failed(SessionError::RangeMismatch {
                    requested,
                    actual: range.start,
                }));
            }
        }

        if let Some(total) = response.complete_length(self.download.downloaded_size) {
            self.download.set_total(total).map_err(AttemptEnd::Failed)?;
        }
        self.publish();
        Ok(response.body)
    }

    /// Streams the body into the sink.
    async fn stream(&mut self, mut body: BodyStream) -> AttemptEnd {
        loop {
            if self.shutdown.is_cancelled() {
                return AttemptEnd::Stopped;
            }
            let paused = *self.pause.borrow();
            if paused {
                // Dropping the body closes the connection.
                return AttemptEnd::Paused;
            }

            let next = match tokio::time::timeout(self.read_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return AttemptEnd::Interrupted(
                        TransportError::Timeout {
                            url: self.task.source.to_string(),
                            timeout: self.read_timeout,
                        }
                        .into(),
                    )
                }
            };

            let bytes = match next {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return self.transport_fault(e),
            };
            if bytes.is_empty() {
                continue;
            }

            let len = bytes.len() as u64;
            if let Some(total) = self.download.total_size {
                let after = self.download.downloaded_size + len;
                if after > total {
                    return AttemptEnd::Failed(SessionError::Consistency {
                        downloaded: after,
                        total,
                    });
                }
            }

            if let Err(e) = store::blocking(&self.sink, move |sink| sink.append(&bytes)).await {
                return AttemptEnd::Failed(e.into());
            }
            self.received += len;
            if let Err(e) = self.download.record(len) {
                return AttemptEnd::Failed(e);
            }
            self.publish();
        }

        let downloaded = self.download.downloaded_size;
        match self.download.total_size {
            Some(total) if downloaded == total => AttemptEnd::Completed(total),
            Some(total) => AttemptEnd::Interrupted(
                TransportError::Body {
                    url: self.task.source.to_string(),
                    reason: format!("stream ended at byte {} of {}", downloaded, total),
                }
                .into(),
            ),
            None => {
                // Without a length, end of stream is the only completion signal.
                self.download.total_size = Some(downloaded);
                self.publish();
                AttemptEnd::Completed(downloaded)
            }
        }
    }
}
