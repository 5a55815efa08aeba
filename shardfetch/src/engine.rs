//! Download engine: one session at a time, with pause and resume.
//!
//! The [`DownloadEngine`] drives a task's [`Session`] until the archive is
//! complete or the task has failed, reconnecting through pauses and
//! transient interruptions on the way.
//!
//! # Serialization
//!
//! Only one [`run`](DownloadEngine::run) may be in progress per engine. The
//! engine enforces this itself with a strand lock; a second call returns
//! [`EngineError::Busy`] rather than waiting.
//!
//! # Control
//!
//! Pause is a watch channel shared with the session. The session checks it
//! between reads; the engine then waits for it to clear. Because the wait
//! observes the current value before sleeping, a resume that lands before
//! the wait begins is never lost. Setting an already-set flag, or clearing
//! a clear one, changes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DownloaderConfig;
use crate::error::{EngineError, SessionError};
use crate::policy::RetryPolicy;
use crate::session::{AttemptEnd, Session, SessionOutcome, SessionState};
use crate::state::DownloadState;
use crate::store::{self, BodySink};
use crate::task::Task;
use crate::transport::Transport;

/// Serialized driver of download sessions.
pub struct DownloadEngine {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    read_timeout: Duration,
    strand: tokio::sync::Mutex<()>,
    running: AtomicBool,
    pause_tx: watch::Sender<bool>,
    progress_tx: watch::Sender<Option<DownloadState>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl DownloadEngine {
    /// Creates an engine.
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, read_timeout: Duration) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (progress_tx, _) = watch::channel(None);
        Self {
            transport,
            retry,
            read_timeout,
            strand: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            pause_tx,
            progress_tx,
            shutdown: Mutex::new(None),
        }
    }

    /// Creates an engine with the retry policy and timeouts of `config`.
    pub fn from_config(transport: Arc<dyn Transport>, config: &DownloaderConfig) -> Self {
        Self::new(transport, config.retry.clone(), config.read_timeout)
    }

    /// Whether a session is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the pause flag is set.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Live progress of the running session.
    pub fn progress(&self) -> watch::Receiver<Option<DownloadState>> {
        self.progress_tx.subscribe()
    }

    /// Asks the running session to pause at its next read boundary.
    ///
    /// Returns `true` if this call set the flag. Without a running session
    /// the call does nothing.
    pub fn pause(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let changed = self.pause_tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        if changed {
            info!("Pause requested");
        }
        changed
    }

    /// Clears the pause flag, waking a paused session.
    ///
    /// Returns `true` if this call cleared the flag.
    pub fn resume(&self) -> bool {
        let changed = self.pause_tx.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Resume requested");
        }
        changed
    }

    /// Ends the running session at its next read boundary, or while it is
    /// paused or backing off. Stored bytes are kept.
    pub fn stop(&self) {
        if let Some(token) = self.shutdown.lock().as_ref() {
            token.cancel();
        }
    }

    /// Downloads `task` into `sink` until it completes or fails.
    pub async fn run(&self, task: &Task, sink: Arc<dyn BodySink>) -> Result<SessionOutcome, EngineError> {
        self.run_until(task, sink, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), also ending when `shutdown` is cancelled.
    pub async fn run_until(
        &self,
        task: &Task,
        sink: Arc<dyn BodySink>,
        shutdown: CancellationToken,
    ) -> Result<SessionOutcome, EngineError> {
        let _strand = self.strand.try_lock().map_err(|_| EngineError::Busy)?;

        *self.shutdown.lock() = Some(shutdown.clone());
        self.pause_tx.send_replace(false);
        self.running.store(true, Ordering::SeqCst);
        // Clears the run state even if this future is dropped mid-run.
        let _run = RunGuard { engine: self };

        Ok(self.drive(task, sink, shutdown).await)
    }

    async fn drive(&self, task: &Task, sink: Arc<dyn BodySink>, shutdown: CancellationToken) -> SessionOutcome {
        let mut session = Session::new(
            task.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&sink),
            self.pause_tx.subscribe(),
            shutdown.clone(),
            self.progress_tx.clone(),
            self.read_timeout,
        );
        let mut pause_rx = self.pause_tx.subscribe();
        let mut failures: u32 = 0;

        info!(
            task = %task.id,
            source = %task.source,
            offset = sink.current_size(),
            "Session starting"
        );

        loop {
            match session.attempt().await {
                AttemptEnd::Completed(total) => {
                    session.enter(SessionState::Completed);
                    info!(task = %task.id, total, "Download complete");
                    return SessionOutcome::Completed { total_size: total };
                }

                AttemptEnd::Stopped => {
                    info!(task = %task.id, offset = sink.current_size(), "Session stopped");
                    return SessionOutcome::Stopped;
                }

                AttemptEnd::Failed(err) => {
                    session.enter(SessionState::Failed);
                    if err.is_consistency() {
                        warn!(
                            task = %task.id,
                            error = %err,
                            "Stored bytes diverged from the remote archive, discarding"
                        );
                        if let Err(reset_err) = store::blocking(&sink, |s| s.reset()).await {
                            error!(task = %task.id, error = %reset_err, "Failed to reset body sink");
                            return SessionOutcome::Failed(reset_err.into());
                        }
                    } else {
                        error!(task = %task.id, error = %err, "Session failed");
                    }
                    return SessionOutcome::Failed(err);
                }

                AttemptEnd::Paused => {
                    session.enter(SessionState::Paused);
                    session.set_paused(true);
                    info!(task = %task.id, offset = sink.current_size(), "Session paused");

                    let resumed = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => false,
                        resumed = async { pause_rx.wait_for(|paused| !*paused).await.is_ok() } => resumed,
                    };
                    if !resumed {
                        info!(task = %task.id, offset = sink.current_size(), "Session stopped while paused");
                        return SessionOutcome::Stopped;
                    }

                    session.set_paused(false);
                    failures = 0;
                    info!(task = %task.id, offset = sink.current_size(), "Session resuming");
                }

                AttemptEnd::Interrupted(err) => {
                    session.enter(SessionState::Interrupted);
                    if session.received() > 0 {
                        failures = 0;
                    }
                    failures += 1;

                    let Some(delay) = self.retry.delay_for_attempt(failures) else {
                        error!(
                            task = %task.id,
                            attempts = failures,
                            offset = sink.current_size(),
                            error = %err,
                            "Giving up after repeated interruptions"
                        );
                        return SessionOutcome::Failed(SessionError::RetriesExhausted {
                            attempts: failures,
                            last: Box::new(err),
                        });
                    };

                    warn!(
                        task = %task.id,
                        attempt = failures,
                        offset = sink.current_size(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Session interrupted, reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return SessionOutcome::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Resets the engine's run state when a run ends.
struct RunGuard<'a> {
    engine: &'a DownloadEngine,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let engine = self.engine;
        engine.running.store(false, Ordering::SeqCst);
        *engine.shutdown.lock() = None;
        engine.pause_tx.send_replace(false);
        engine.progress_tx.send_replace(None);
    }
}
