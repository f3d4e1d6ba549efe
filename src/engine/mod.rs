//! The engine: the single entry point tying graph, store, retry, and
//! dispatch together.
//!
//! All mutation goes through the engine so the graph and the task table
//! never disagree. Status updates are persisted before their events are
//! dispatched; a crash between the two loses propagation work, never the
//! update itself.

pub mod dispatch;

pub use dispatch::{DispatchReport, Event, EventKind};

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clog;
use crate::config::EngineConfig;
use crate::core::{transition, DependencyGraph, Task, TaskFilter, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::retry::{OperationKind, RetryEngine};
use crate::store::{Checkpoint, CheckpointStore, TaskStore};
use crate::clog_warn;

/// Task dependency and execution engine.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) store: TaskStore,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) graph: RwLock<DependencyGraph>,
    pub(crate) retry: RetryEngine,
}

impl Engine {
    /// Open an engine over the configured data directory, loading any
    /// persisted tasks and rebuilding the dependency graph from them.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let data_dir = config.effective_data_dir()?;
        let store = TaskStore::open(&data_dir, config.lock_timeout())?;
        let checkpoints = CheckpointStore::open(&data_dir)?;
        let retry = RetryEngine::from_config(&config);

        let tasks = store.list(&TaskFilter::default()).await;
        let mut graph = DependencyGraph::new();
        for task in &tasks {
            graph.add_node(task.id, task.weight());
        }
        for task in &tasks {
            for dep in &task.depends_on {
                if graph.contains(dep) {
                    // Persisted relations were acyclic when written.
                    graph.add_edge(task.id, *dep)?;
                } else {
                    clog_warn!(
                        "Task {} depends on unknown task {}, edge dropped",
                        task.id.short(),
                        dep.short()
                    );
                }
            }
        }

        Ok(Self {
            config,
            store,
            checkpoints,
            graph: RwLock::new(graph),
            retry,
        })
    }

    /// Create a task depending on the given tasks.
    ///
    /// The graph write lock is held across the existence checks and the
    /// edge insertion, so a concurrent create cannot slip a cycle in
    /// between. The store row exists before any edge becomes visible, and
    /// the born-ready check runs under the task lock afterwards; a
    /// dependency completing at any point during creation either finds the
    /// row via dispatch or is caught by that check.
    pub async fn create_task(
        &self,
        title: &str,
        depends_on: &[TaskId],
        metadata: BTreeMap<String, String>,
    ) -> Result<Task> {
        let mut task = Task::with_dependencies(title, depends_on.iter().copied().collect());
        task.metadata = metadata;
        let id = task.id;
        self.store.insert(task).await;

        let edges: Result<()> = {
            let mut graph = self.graph_write().await?;
            let mut failed = None;
            for dep in depends_on {
                if !graph.contains(dep) {
                    failed = Some(Error::TaskNotFound(*dep));
                    break;
                }
            }
            if failed.is_none() {
                graph.add_node(id, 1.0);
                for dep in depends_on {
                    if let Err(err) = graph.add_edge(id, *dep) {
                        failed = Some(err);
                        break;
                    }
                }
                if failed.is_some() {
                    graph.remove_node(&id);
                }
            }
            match failed {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        if let Err(err) = edges {
            self.store.remove(id).await?;
            return Err(err);
        }

        // Born-ready, under the same lock discipline dispatch uses.
        {
            let _guard = self.store.lock_task(id).await?;
            let current = self.store.get(id).await?;
            if current.status == TaskStatus::Pending && self.dependencies_met(&current).await? {
                self.store
                    .update(id, |t| {
                        t.apply_status(TaskStatus::Ready);
                        Ok(())
                    })
                    .await?;
            }
        }

        self.persist().await?;
        let task = self.store.get(id).await?;
        clog!(
            "Task {} created ({}, {} deps)",
            task.id.short(),
            task.status,
            task.depends_on.len()
        );
        Ok(task)
    }

    /// Add a dependency edge to an existing task.
    ///
    /// The edge is cycle-checked before it is committed. A ready task whose
    /// new dependency is incomplete drops back to blocked.
    pub async fn add_dependency(&self, dependent: TaskId, dependency: TaskId) -> Result<()> {
        let _guard = self.store.lock_task(dependent).await?;
        let task = self.store.get(dependent).await?;
        let dep_task = self.store.get(dependency).await?;

        {
            let mut graph = self.graph_write().await?;
            graph.add_edge(dependent, dependency)?;
        }
        self.store
            .update(dependent, |t| {
                t.depends_on.insert(dependency);
                Ok(())
            })
            .await?;

        if task.status == TaskStatus::Ready && dep_task.status != TaskStatus::Completed {
            let blocked = TaskStatus::Blocked {
                reason: format!("waiting on dependency {}", dependency.short()),
            };
            self.store
                .update(dependent, |t| {
                    t.apply_status(blocked.clone());
                    Ok(())
                })
                .await?;
        }
        self.persist().await?;
        Ok(())
    }

    /// Delete a task with no dependents, along with its checkpoints.
    pub async fn remove_task(&self, id: TaskId) -> Result<Task> {
        let _guard = self.store.lock_task(id).await?;
        {
            let mut graph = self.graph_write().await?;
            if !graph.contains(&id) {
                return Err(Error::TaskNotFound(id));
            }
            let dependents = graph.dependents_of(&id);
            if !dependents.is_empty() {
                return Err(Error::HasDependents(id, dependents.into_iter().collect()));
            }
            graph.remove_node(&id);
        }
        let removed = self.store.remove(id).await?;
        self.checkpoints.remove_all(id)?;
        self.persist().await?;
        clog!("Task {} removed", id.short());
        Ok(removed)
    }

    /// Move a task to a new status and propagate the resulting event.
    ///
    /// The transition is validated against the table, applied under the
    /// task's lock, and persisted before any dependent sees it. Dispatch
    /// failures surface in the report, never as an error; the triggering
    /// update has already committed.
    pub async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<DispatchReport> {
        let applied = {
            let _guard = self.store.lock_task(id).await?;
            let current = self.store.get(id).await?;
            transition::validate(&current.status, &status)?;
            if matches!(status, TaskStatus::Ready) {
                let incomplete = self.incomplete_dependencies(&current).await?;
                if !incomplete.is_empty() {
                    return Err(Error::DependenciesNotMet {
                        task_id: id,
                        incomplete,
                    });
                }
            }
            self.store
                .update(id, |t| {
                    t.apply_status(status.clone());
                    Ok(t.status.clone())
                })
                .await?
        };

        self.persist().await?;
        clog!("Task {} -> {}", id.short(), applied);

        let report = match EventKind::from_status(&applied) {
            Some(kind) => self.dispatch(Event::new(kind, id)).await,
            None => DispatchReport::default(),
        };
        if !report.transitioned.is_empty() {
            self.persist().await?;
        }
        Ok(report)
    }

    /// Cancel a task and every transitive dependent still in flight.
    pub async fn cancel(&self, id: TaskId) -> Result<DispatchReport> {
        self.update_status(id, TaskStatus::Cancelled).await
    }

    /// A copy of the task; mutations do not write through.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.store.get(id).await
    }

    /// Copies of all tasks matching the filter, ordered by id.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.list(filter).await
    }

    /// Update a task's cost estimate, feeding the critical-path weights.
    pub async fn set_estimate(&self, id: TaskId, estimate: f64) -> Result<()> {
        let _guard = self.store.lock_task(id).await?;
        self.store
            .update(id, |t| {
                t.estimate = Some(estimate);
                Ok(())
            })
            .await?;
        self.graph_write().await?.add_node(id, estimate);
        self.persist().await
    }

    /// Save a progress snapshot for a task.
    ///
    /// The write goes through the retry engine; a full disk or transient
    /// I/O error is retried before it surfaces.
    pub async fn checkpoint(
        &self,
        id: TaskId,
        snapshot: serde_json::Value,
        resumable: bool,
    ) -> Result<Checkpoint> {
        let _guard = self.store.lock_task(id).await?;
        self.store.get(id).await?;

        let checkpoint = self
            .retry
            .execute(OperationKind::CheckpointWrite, || {
                let snapshot = snapshot.clone();
                async move { self.checkpoints.save(id, snapshot, resumable) }
            })
            .await?;

        self.store
            .update(id, |t| {
                t.last_checkpoint = Some(checkpoint.sequence);
                Ok(())
            })
            .await?;
        self.persist().await?;
        Ok(checkpoint)
    }

    /// Drop all but the newest configured number of checkpoints for a task.
    ///
    /// Checkpoints accumulate until this is called; nothing prunes
    /// implicitly.
    pub async fn prune_checkpoints(&self, id: TaskId) -> Result<usize> {
        let _guard = self.store.lock_task(id).await?;
        self.store.get(id).await?;
        self.checkpoints
            .prune(id, self.config.checkpoint_keep_last)
    }

    /// Resume a task from its latest checkpoint.
    ///
    /// The latest readable checkpoint must be marked resumable; the task
    /// moves back to in_progress and the checkpoint is handed to the caller.
    pub async fn resume(&self, id: TaskId) -> Result<(Task, Checkpoint)> {
        let checkpoint = {
            let _guard = self.store.lock_task(id).await?;
            let task = self.store.get(id).await?;

            let checkpoint = self
                .checkpoints
                .load_latest(id)?
                .filter(|c| c.resumable)
                .ok_or(Error::NotResumable(id))?;

            transition::validate(&task.status, &TaskStatus::InProgress)?;
            self.store
                .update(id, |t| {
                    t.apply_status(TaskStatus::InProgress);
                    Ok(())
                })
                .await?;
            checkpoint
        };

        self.persist().await?;
        let task = self.store.get(id).await?;
        clog!(
            "Task {} resumed from checkpoint {}",
            id.short(),
            checkpoint.sequence
        );
        Ok((task, checkpoint))
    }

    /// The longest weighted dependency chain and its cumulative weight.
    pub async fn critical_path(&self) -> Result<(Vec<TaskId>, f64)> {
        Ok(self.graph_read().await?.critical_path())
    }

    /// Composite bottleneck score per task.
    pub async fn blocking_scores(&self) -> Result<std::collections::HashMap<TaskId, f64>> {
        Ok(self.graph_read().await?.blocking_scores())
    }

    /// Tasks with no dependencies.
    pub async fn roots(&self) -> Result<BTreeSet<TaskId>> {
        Ok(self.graph_read().await?.find_roots())
    }

    /// Tasks nothing depends on.
    pub async fn leaves(&self) -> Result<BTreeSet<TaskId>> {
        Ok(self.graph_read().await?.find_leaves())
    }

    /// The dependency graph in DOT format.
    pub async fn to_dot(&self) -> Result<String> {
        Ok(self.graph_read().await?.to_dot())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn dependencies_met(&self, task: &Task) -> Result<bool> {
        Ok(self.incomplete_dependencies(task).await?.is_empty())
    }

    async fn incomplete_dependencies(&self, task: &Task) -> Result<Vec<TaskId>> {
        let mut incomplete = Vec::new();
        for dep in &task.depends_on {
            if self.store.get(*dep).await?.status != TaskStatus::Completed {
                incomplete.push(*dep);
            }
        }
        Ok(incomplete)
    }

    /// Persist the task table through the retry engine.
    pub(crate) async fn persist(&self) -> Result<()> {
        self.retry
            .execute(OperationKind::StoreWrite, || self.store.persist())
            .await
    }

    /// Graph read access with the same bounded wait as task locks.
    pub(crate) async fn graph_read(&self) -> Result<RwLockReadGuard<'_, DependencyGraph>> {
        tokio::time::timeout(self.config.lock_timeout(), self.graph.read())
            .await
            .map_err(|_| Error::LockTimeout(self.config.lock_timeout()))
    }

    pub(crate) async fn graph_write(&self) -> Result<RwLockWriteGuard<'_, DependencyGraph>> {
        tokio::time::timeout(self.config.lock_timeout(), self.graph.write())
            .await
            .map_err(|_| Error::LockTimeout(self.config.lock_timeout()))
    }
}
