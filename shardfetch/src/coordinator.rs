//! Task coordinator: drives the queue through the engine.
//!
//! The [`TaskCoordinator`] is the public face of the downloader. It takes
//! registrations, runs the queue head through the [`DownloadEngine`] one
//! task at a time, hands completed archives to the [`ArchiveImporter`],
//! and decides whether to advance, retry, defer or halt.
//!
//! # Recovery
//!
//! Everything the coordinator needs after a crash is in the task table and
//! the body sink. [`TaskCoordinator::open`] reloads the table and, if tasks
//! remain, starts driving them at once; the head task's stored bytes are
//! reused because the sink still names it as their owner.
//!
//! # Task outcomes
//!
//! | Outcome                              | Action                               |
//! |--------------------------------------|--------------------------------------|
//! | Imported                             | remove task, reset sink, advance     |
//! | Validation or consistency fault      | reset sink, download again or drop   |
//! | Non-retriable fault (e.g. 404)       | drop task, advance                   |
//! | Transient retries exhausted          | move task to the tail, advance       |
//! | Every queued task deferred this pass | halt, tasks kept                     |
//! | Stopped                              | halt, task and bytes kept            |
//!
//! A deferred task keeps its stored bytes only until another task binds the
//! sink. When it is the only task left, the coordinator halts before binding
//! anything else, so its bytes survive for the next start.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DownloaderConfig;
use crate::engine::DownloadEngine;
use crate::error::{
    CoordinatorError, RegistrationError, SessionError, StoreResult, ValidationError,
};
use crate::import::ArchiveImporter;
use crate::queue::TaskQueue;
use crate::session::SessionOutcome;
use crate::state::DownloadState;
use crate::store::{self, BodySink};
use crate::task::{parse_locator, Task, TaskId};
use crate::transport::{ReqwestTransport, Transport};

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 64;

/// Notifications published by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A task's session started; `offset` bytes were already stored.
    TaskStarted { task: TaskId, offset: u64 },
    /// A task's archive was imported and the task removed.
    TaskCompleted { task: TaskId, size: u64 },
    /// A task was dropped from the queue.
    TaskFailed { task: TaskId, reason: String },
    /// A task gave up for now and moved to the tail of the queue.
    TaskDeferred { task: TaskId, reason: String },
    /// Driving stopped with the task still queued.
    Halted { task: TaskId, reason: String },
    /// The running session paused.
    Paused,
    /// The paused session resumed.
    Resumed,
    /// The coordinator stopped driving.
    Idle,
}

/// What happens to the head task after one engine run.
enum Step {
    Advance,
    Retry,
    Defer,
    Halt,
}

struct Inner {
    config: DownloaderConfig,
    queue: Mutex<TaskQueue>,
    sink: Arc<dyn BodySink>,
    engine: DownloadEngine,
    importer: Arc<dyn ArchiveImporter>,
    active: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    events: broadcast::Sender<CoordinatorEvent>,
    idle: watch::Sender<bool>,
    runtime: Handle,
}

/// Serialized downloader over a durable task queue.
///
/// Cloning is cheap; clones share the same queue and engine.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<Inner>,
}

impl TaskCoordinator {
    /// Opens the coordinator and resumes any persisted tasks.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        importer: Arc<dyn ArchiveImporter>,
    ) -> Result<Self, CoordinatorError> {
        let coordinator = Self::open_deferred(config, transport, importer)?;
        let pending = coordinator.inner.queue.lock().len();
        if pending > 0 {
            info!(tasks = pending, "Resuming persisted downloads");
            coordinator.start();
        }
        Ok(coordinator)
    }

    /// Opens the coordinator without starting persisted tasks.
    pub fn open_deferred(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        importer: Arc<dyn ArchiveImporter>,
    ) -> Result<Self, CoordinatorError> {
        let runtime = Handle::try_current().map_err(|e| CoordinatorError::NoRuntime(e.to_string()))?;

        let queue = TaskQueue::open(config.task_table_path())?;
        let sink = store::open_sink(config.sink, &config.chunk_table_path(), config.chunk_limit)?;
        let engine = DownloadEngine::from_config(transport, &config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(true);

        debug!(
            state_dir = %config.state_dir.display(),
            tasks = queue.len(),
            stored = sink.current_size(),
            owner = ?sink.owner(),
            "Coordinator opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(queue),
                sink,
                engine,
                importer,
                active: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                events,
                idle,
                runtime,
            }),
        })
    }

    /// Opens the coordinator over HTTPS and resumes any persisted tasks.
    pub fn with_reqwest(
        config: DownloaderConfig,
        importer: Arc<dyn ArchiveImporter>,
    ) -> Result<Self, CoordinatorError> {
        let transport = ReqwestTransport::with_settings(config.connect_timeout, &config.user_agent)?;
        Self::open(config, Arc::new(transport), importer)
    }

    /// Registers a shard download. Returns `false` if it was refused.
    pub fn add(&self, index: u32, locator: &str) -> bool {
        match self.try_add(index, locator) {
            Ok(()) => true,
            Err(e) => {
                warn!(task = index, error = %e, "Registration refused");
                false
            }
        }
    }

    /// Registers a shard download.
    ///
    /// Refused while a download is active, for a duplicate index, or for a
    /// locator that is not an acceptable URL.
    pub fn try_add(&self, index: u32, locator: &str) -> Result<(), RegistrationError> {
        let url = parse_locator(locator, self.inner.config.allow_plain_http)?;
        let id = TaskId::new(index);

        let mut queue = self.inner.queue.lock();
        if self.inner.active.load(Ordering::SeqCst) {
            return Err(RegistrationError::DownloadActive);
        }
        queue.enqueue(id, url)?;
        info!(task = %id, source = locator, queued = queue.len(), "Shard registered");
        Ok(())
    }

    /// Starts driving the queue.
    ///
    /// Returns `false` if already started or if there is nothing to do.
    pub fn start(&self) -> bool {
        let queue = self.inner.queue.lock();
        if queue.is_empty() || self.inner.active.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.active.store(true, Ordering::SeqCst);
        self.inner.idle.send_replace(false);

        let shutdown = CancellationToken::new();
        *self.inner.shutdown.lock() = shutdown.clone();
        info!(tasks = queue.len(), "Starting downloads");
        drop(queue);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move { inner.drive(shutdown).await });
        true
    }

    /// Pauses the running session. Returns `true` if this call paused it.
    pub fn pause(&self) -> bool {
        let paused = self.inner.engine.pause();
        if paused {
            self.inner.emit(CoordinatorEvent::Paused);
        }
        paused
    }

    /// Resumes a paused session. Returns `true` if this call resumed it.
    pub fn resume(&self) -> bool {
        let resumed = self.inner.engine.resume();
        if resumed {
            self.inner.emit(CoordinatorEvent::Resumed);
        }
        resumed
    }

    /// Stops driving at the next read boundary. Stored bytes and the queue
    /// are kept; a later [`start`](Self::start) resumes.
    pub fn stop(&self) {
        if self.is_active() {
            info!("Stop requested");
        }
        self.inner.shutdown.lock().cancel();
        self.inner.engine.stop();
    }

    /// Waits until the coordinator is no longer driving the queue.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Whether the queue is being driven.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether the running session is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.engine.is_paused()
    }

    /// Queued tasks, head first.
    pub fn pending(&self) -> Vec<Task> {
        self.inner.queue.lock().tasks().to_vec()
    }

    /// Task owning the stored bytes, and how many are stored.
    pub fn stored(&self) -> (Option<TaskId>, u64) {
        (self.inner.sink.owner(), self.inner.sink.current_size())
    }

    /// Subscribes to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Live progress of the running session.
    pub fn progress(&self) -> watch::Receiver<Option<DownloadState>> {
        self.inner.engine.progress()
    }
}

impl Inner {
    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn drive(self: Arc<Self>, shutdown: CancellationToken) {
        // Downloads spent on the current head task.
        let mut downloads: Option<(TaskId, u32)> = None;
        // Tasks moved to the tail since the queue last shrank.
        let mut deferred: HashSet<TaskId> = HashSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let next = self.queue.lock().activate_head();
            let Some(task) = next else {
                info!("Download queue is empty");
                break;
            };
            if deferred.contains(&task.id) {
                self.halt(&task, "every queued task exhausted its retries".to_string());
                break;
            }

            let count = match downloads {
                Some((id, count)) if id == task.id => count + 1,
                _ => 1,
            };
            downloads = Some((task.id, count));

            let step = self.run_task(&task, count, &shutdown).await;
            match step {
                Step::Advance => {
                    downloads = None;
                    deferred.clear();
                }
                Step::Retry => {}
                Step::Defer => {
                    downloads = None;
                    deferred.insert(task.id);
                }
                Step::Halt => break,
            }
        }

        // Idle is published under the queue lock so a concurrent start()
        // cannot interleave with it.
        let mut queue = self.queue.lock();
        queue.deactivate();
        self.active.store(false, Ordering::SeqCst);
        self.idle.send_replace(true);
        self.emit(CoordinatorEvent::Idle);
        info!(pending = queue.len(), "Coordinator idle");
    }

    async fn run_task(&self, task: &Task, download: u32, shutdown: &CancellationToken) -> Step {
        let id = task.id;
        let kept = match store::blocking(&self.sink, move |sink| sink.bind(id)).await {
            Ok(kept) => kept,
            Err(e) => {
                error!(task = %id, error = %e, "Failed to prepare body sink");
                return self.halt(task, e.to_string());
            }
        };
        let offset = self.sink.current_size();
        info!(task = %id, download, offset, resumed = kept && offset > 0, "Task started");
        self.emit(CoordinatorEvent::TaskStarted { task: id, offset });

        let outcome = match self
            .engine
            .run_until(task, Arc::clone(&self.sink), shutdown.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task = %id, error = %e, "Engine refused the task");
                return self.halt(task, e.to_string());
            }
        };

        match outcome {
            SessionOutcome::Completed { total_size } => match self.import(task).await {
                Ok(()) => self.complete(task, total_size).await,
                Err(e) => {
                    warn!(task = %id, error = %e, "Archive failed validation, discarding");
                    if let Err(reset_err) = store::blocking(&self.sink, |sink| sink.reset()).await {
                        error!(task = %id, error = %reset_err, "Failed to reset body sink");
                        return self.halt(task, reset_err.to_string());
                    }
                    self.retry_or_drop(task, download, e.to_string()).await
                }
            },

            SessionOutcome::Stopped => Step::Halt,

            SessionOutcome::Failed(err) => self.on_failure(task, download, err).await,
        }
    }

    async fn on_failure(&self, task: &Task, download: u32, err: SessionError) -> Step {
        if err.is_consistency() {
            // The engine has already discarded the stored bytes.
            return self.retry_or_drop(task, download, err.to_string()).await;
        }
        match err {
            SessionError::RetriesExhausted { .. } => self.defer(task, err.to_string()),
            SessionError::Store(_) => self.halt(task, err.to_string()),
            err => self.drop_task(task, err.to_string()).await,
        }
    }

    async fn import(&self, task: &Task) -> Result<(), ValidationError> {
        let sink = Arc::clone(&self.sink);
        let importer = Arc::clone(&self.importer);
        let owned = task.clone();
        tokio::task::spawn_blocking(move || {
            let content = sink.materialize()?;
            importer.validate_and_import(&owned, content)
        })
        .await
        .map_err(|e| ValidationError::ImportFailed {
            task: task.id,
            reason: format!("import worker failed: {}", e),
        })?
    }

    async fn complete(&self, task: &Task, size: u64) -> Step {
        // Removal happens only after the import succeeded.
        if let Err(e) = self.forget(task.id).await {
            error!(task = %task.id, error = %e, "Failed to remove completed task");
            return self.halt(task, e.to_string());
        }
        info!(task = %task.id, size, "Task completed");
        self.emit(CoordinatorEvent::TaskCompleted { task: task.id, size });
        Step::Advance
    }

    async fn retry_or_drop(&self, task: &Task, download: u32, reason: String) -> Step {
        if self.config.validation.allows_retry(download) {
            warn!(
                task = %task.id,
                download,
                max = self.config.validation.max_attempts,
                reason = %reason,
                "Downloading task again"
            );
            self.queue.lock().deactivate();
            Step::Retry
        } else {
            self.drop_task(task, reason).await
        }
    }

    async fn drop_task(&self, task: &Task, reason: String) -> Step {
        let id = task.id;
        if let Err(e) = store::blocking(&self.sink, |sink| sink.reset()).await {
            error!(task = %id, error = %e, "Failed to reset body sink");
            return self.halt(task, e.to_string());
        }
        if let Err(e) = self.queue.lock().remove(id) {
            error!(task = %id, error = %e, "Failed to remove failed task");
            return self.halt(task, e.to_string());
        }
        error!(task = %id, reason = %reason, "Task dropped");
        self.emit(CoordinatorEvent::TaskFailed { task: id, reason });
        Step::Advance
    }

    fn defer(&self, task: &Task, reason: String) -> Step {
        let id = task.id;
        if let Err(e) = self.queue.lock().requeue_head() {
            error!(task = %id, error = %e, "Failed to move task to the tail");
            return self.halt(task, e.to_string());
        }
        warn!(task = %id, reason = %reason, "Task deferred to the tail of the queue");
        self.emit(CoordinatorEvent::TaskDeferred { task: id, reason });
        Step::Defer
    }

    fn halt(&self, task: &Task, reason: String) -> Step {
        warn!(task = %task.id, reason = %reason, "Halting downloads; task stays queued");
        self.emit(CoordinatorEvent::Halted {
            task: task.id,
            reason,
        });
        Step::Halt
    }

    /// Removes a finished task and discards its bytes.
    async fn forget(&self, id: TaskId) -> StoreResult<()> {
        self.queue.lock().remove(id)?;
        store::blocking(&self.sink, |sink| sink.reset()).await
    }
}
