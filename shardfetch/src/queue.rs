//! Durable queue of download tasks.
//!
//! Tasks are downloaded in registration order. The task table lives in a
//! sled tree keyed by task id, so registration order cannot come from key
//! order; each record carries a sequence number drawn from the database's
//! persistent id generator instead.
//!
//! # Example
//!
//! ```ignore
//! use shardfetch::{TaskId, TaskQueue};
//!
//! let mut queue = TaskQueue::open("/var/lib/shardfetch/tasks")?;
//! queue.enqueue(TaskId::new(5), url_5)?;
//! queue.enqueue(TaskId::new(1), url_1)?;
//!
//! // Registration order, not numeric order
//! assert_eq!(queue.head().unwrap().id, TaskId::new(5));
//! ```

use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RegistrationError, StoreResult};
use crate::task::{Task, TaskId, TaskStatus};

const TASKS_TREE: &str = "tasks";

// =============================================================================
// Task Record
// =============================================================================

/// Persisted form of a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct TaskRecord {
    /// Registration sequence number.
    sequence: u64,
    /// Source locator.
    source: String,
}

// =============================================================================
// Task Queue
// =============================================================================

/// Ordered, durable set of pending tasks.
///
/// At most one task is [`Active`](TaskStatus::Active), and it is always the
/// head. Active status is not persisted: after a restart every task is
/// queued again and the head is simply activated first.
pub struct TaskQueue {
    db: sled::Db,
    tasks: sled::Tree,
    order: Vec<Task>,
}

impl TaskQueue {
    /// Opens (or creates) the task table at `path` and loads its tasks.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Creates a queue that lives only as long as the value.
    pub fn temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let tasks = db.open_tree(TASKS_TREE)?;
        let mut queue = Self {
            db,
            tasks,
            order: Vec::new(),
        };
        queue.order = queue.load_all()?;
        debug!(tasks = queue.order.len(), "Opened task table");
        Ok(queue)
    }

    /// Reads every persisted task, in registration order.
    ///
    /// Records whose locator no longer parses are skipped.
    pub fn load_all(&self) -> StoreResult<Vec<Task>> {
        let mut records = Vec::new();
        for entry in self.tasks.iter() {
            let (key, value) = entry?;
            let Some(id) = TaskId::from_key(&key) else {
                warn!(key = ?&key[..], "Skipping task record with malformed key");
                continue;
            };
            let record: TaskRecord = bincode::deserialize(&value)?;
            match Url::parse(&record.source) {
                Ok(url) => records.push((record.sequence, Task::new(id, url))),
                Err(e) => {
                    warn!(task = %id, source = %record.source, error = %e, "Skipping task with unparsable locator")
                }
            }
        }
        records.sort_by_key(|(sequence, _)| *sequence);
        Ok(records.into_iter().map(|(_, task)| task).collect())
    }

    /// Durably registers a task at the tail of the queue.
    ///
    /// Fails if `id` is already queued or a task is active.
    pub fn enqueue(&mut self, id: TaskId, source: Url) -> Result<(), RegistrationError> {
        if self.order.iter().any(Task::is_active) {
            return Err(RegistrationError::DownloadActive);
        }
        if self.contains(id) {
            return Err(RegistrationError::Duplicate(id));
        }

        self.persist(id, &source)?;
        debug!(task = %id, source = %source, position = self.order.len(), "Task enqueued");
        self.order.push(Task::new(id, source));
        Ok(())
    }

    fn persist(&self, id: TaskId, source: &Url) -> StoreResult<()> {
        let record = TaskRecord {
            sequence: self.db.generate_id()?,
            source: source.to_string(),
        };
        self.tasks.insert(id.to_key(), bincode::serialize(&record)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// The next task to run.
    pub fn head(&self) -> Option<&Task> {
        self.order.first()
    }

    /// Marks the head active and returns it.
    pub fn activate_head(&mut self) -> Option<Task> {
        let head = self.order.first_mut()?;
        head.status = TaskStatus::Active;
        Some(head.clone())
    }

    /// Returns the active task, if any, to queued.
    pub fn deactivate(&mut self) {
        for task in &mut self.order {
            task.status = TaskStatus::Queued;
        }
    }

    /// The active task, if any.
    pub fn active(&self) -> Option<&Task> {
        self.order.first().filter(|task| task.is_active())
    }

    /// Moves the head to the tail as a queued task and returns its id.
    ///
    /// The record gets a fresh sequence number, so the new order holds
    /// across a restart.
    pub fn requeue_head(&mut self) -> StoreResult<Option<TaskId>> {
        let Some(head) = self.order.first() else {
            return Ok(None);
        };
        self.persist(head.id, &head.source)?;

        let mut task = self.order.remove(0);
        task.status = TaskStatus::Queued;
        let id = task.id;
        self.order.push(task);
        debug!(task = %id, position = self.order.len() - 1, "Task moved to the tail");
        Ok(Some(id))
    }

    /// Durably deletes a task. Returns `false` if it was not queued.
    pub fn remove(&mut self, id: TaskId) -> StoreResult<bool> {
        let Some(position) = self.order.iter().position(|task| task.id == id) else {
            return Ok(false);
        };
        self.tasks.remove(id.to_key())?;
        self.db.flush()?;
        self.order.remove(position);
        debug!(task = %id, remaining = self.order.len(), "Task removed");
        Ok(true)
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: TaskId) -> bool {
        self.order.iter().any(|task| task.id == id)
    }

    /// Queued tasks, head first.
    pub fn tasks(&self) -> &[Task] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(id: u32) -> Url {
        Url::parse(&format!("https://example.com/{}.tar.lz4", id)).unwrap()
    }

    fn ids(tasks: &[Task]) -> Vec<u32> {
        tasks.iter().map(|task| task.id.value()).collect()
    }

    #[test]
    fn test_enqueue_keeps_registration_order() {
        let mut queue = TaskQueue::temporary().unwrap();
        for id in [5, 1, 2] {
            queue.enqueue(TaskId::new(id), url(id)).unwrap();
        }

        assert_eq!(ids(queue.tasks()), vec![5, 1, 2]);
        assert_eq!(queue.head().unwrap().id, TaskId::new(5));
        assert_eq!(ids(&queue.load_all().unwrap()), vec![5, 1, 2]);
    }

    #[test]
    fn test_order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut queue = TaskQueue::open(dir.path()).unwrap();
            for id in [5, 1, 2] {
                queue.enqueue(TaskId::new(id), url(id)).unwrap();
            }
        }

        let mut queue = TaskQueue::open(dir.path()).unwrap();
        assert_eq!(ids(queue.tasks()), vec![5, 1, 2]);
        assert!(queue.tasks().iter().all(|task| !task.is_active()));

        // New registrations still go to the tail
        queue.enqueue(TaskId::new(0), url(0)).unwrap();
        assert_eq!(ids(queue.tasks()), vec![5, 1, 2, 0]);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut queue = TaskQueue::temporary().unwrap();
        queue.enqueue(TaskId::new(3), url(3)).unwrap();

        let err = queue.enqueue(TaskId::new(3), url(4)).unwrap_err();
        assert!(matches!(err, RegistrationError::Duplicate(id) if id == TaskId::new(3)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_refused_while_active() {
        let mut queue = TaskQueue::temporary().unwrap();
        queue.enqueue(TaskId::new(1), url(1)).unwrap();

        let active = queue.activate_head().unwrap();
        assert!(active.is_active());
        assert_eq!(queue.active().map(|task| task.id), Some(TaskId::new(1)));
        assert!(matches!(
            queue.enqueue(TaskId::new(2), url(2)),
            Err(RegistrationError::DownloadActive)
        ));

        queue.deactivate();
        assert!(queue.active().is_none());
        queue.enqueue(TaskId::new(2), url(2)).unwrap();
    }

    #[test]
    fn test_remove_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut queue = TaskQueue::open(dir.path()).unwrap();
            queue.enqueue(TaskId::new(1), url(1)).unwrap();
            queue.enqueue(TaskId::new(2), url(2)).unwrap();
            assert!(queue.remove(TaskId::new(1)).unwrap());
            assert!(!queue.remove(TaskId::new(9)).unwrap());
        }

        let queue = TaskQueue::open(dir.path()).unwrap();
        assert_eq!(ids(queue.tasks()), vec![2]);
    }

    #[test]
    fn test_requeue_head_moves_it_to_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut queue = TaskQueue::open(dir.path()).unwrap();
            for id in [5, 1, 2] {
                queue.enqueue(TaskId::new(id), url(id)).unwrap();
            }
            queue.activate_head();

            assert_eq!(queue.requeue_head().unwrap(), Some(TaskId::new(5)));
            assert_eq!(ids(queue.tasks()), vec![1, 2, 5]);
            assert!(queue.active().is_none());
            assert!(queue.tasks().iter().all(|task| !task.is_active()));
        }

        let queue = TaskQueue::open(dir.path()).unwrap();
        assert_eq!(ids(queue.tasks()), vec![1, 2, 5]);
        assert_eq!(queue.head().unwrap().source, url(1));
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = TaskQueue::temporary().unwrap();
        assert!(queue.is_empty());
        assert!(queue.head().is_none());
        assert!(queue.activate_head().is_none());
        assert_eq!(queue.requeue_head().unwrap(), None);
    }
}
