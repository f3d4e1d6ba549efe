//! Persistence layer: the task table and checkpoint files.
//!
//! The task table lives in memory behind a `tokio::sync::RwLock` and is
//! persisted as a whole to `tasks.json` with a write-then-rename, so readers
//! never observe a half-written table. Mutations to an individual task are
//! serialized by a per-task async mutex with a bounded wait.

pub mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointStore};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::core::{Task, TaskFilter, TaskId};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// In-memory task table with durable JSON backing.
#[derive(Debug)]
pub struct TaskStore {
    data_dir: PathBuf,
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// One mutex per task, created lazily. The outer lock only guards the
    /// map itself and is never held across an await.
    locks: StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>,
    /// Serializes persist calls: concurrent writers would otherwise race on
    /// the shared temp file and publish a torn table through the rename.
    persist_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl TaskStore {
    /// Open the store rooted at `data_dir`, loading `tasks.json` when it
    /// exists.
    pub fn open(data_dir: &Path, lock_timeout: Duration) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let tasks = Self::load_table(data_dir)?;
        if !tasks.is_empty() {
            clog_debug!("Loaded {} tasks from {}", tasks.len(), data_dir.display());
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            tasks: RwLock::new(tasks),
            locks: StdMutex::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            lock_timeout,
        })
    }

    fn table_path(data_dir: &Path) -> PathBuf {
        data_dir.join("tasks.json")
    }

    fn load_table(data_dir: &Path) -> Result<HashMap<TaskId, Task>> {
        let path = Self::table_path(data_dir);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let tasks: Vec<Task> = match serde_json::from_slice(&fs::read(&path)?) {
            Ok(tasks) => tasks,
            Err(err) => {
                // A corrupt table is surfaced rather than silently emptied.
                clog_warn!("Task table at {} is unreadable: {}", path.display(), err);
                return Err(err.into());
            }
        };
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    /// Acquire the mutation lock for one task, waiting at most the
    /// configured timeout.
    pub async fn lock_task(&self, id: TaskId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().expect("task lock map poisoned");
            Arc::clone(locks.entry(id).or_default())
        };
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout(self.lock_timeout))
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().await.contains_key(&id)
    }

    /// A copy of the task. Mutating the returned value does not touch the
    /// store.
    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    /// Copies of all tasks matching `filter`, ordered by id.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.id);
        matched
    }

    pub async fn insert(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    /// Apply `f` to the stored task under the table write lock.
    pub async fn update<R, F>(&self, id: TaskId, f: F) -> Result<R>
    where
        F: FnOnce(&mut Task) -> Result<R>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        f(task)
    }

    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(&id).ok_or(Error::TaskNotFound(id))?;
        self.locks
            .lock()
            .expect("task lock map poisoned")
            .remove(&id);
        Ok(removed)
    }

    /// Write the whole table to `tasks.json`, temp file first. The rename
    /// is the commit point. Persists are serialized; the snapshot is taken
    /// under the persist lock so the last writer publishes the newest table.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<Task> = {
            let tasks = self.tasks.read().await;
            let mut all: Vec<Task> = tasks.values().cloned().collect();
            all.sort_by_key(|t| t.id);
            all
        };

        let path = Self::table_path(&self.data_dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, &path)?;
        clog_debug!("Persisted {} tasks", snapshot.len());
        Ok(())
    }
}
