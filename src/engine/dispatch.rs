//! Event dispatch: propagating one task's transition to its dependents.
//!
//! Dispatch runs synchronously inside the triggering status update, after
//! the update itself has been persisted. Each affected dependent is handled
//! under its own task lock; a failure on one dependent is recorded in the
//! report and never stops propagation to its siblings.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::clog_debug;
use crate::core::{transition, TaskId, TaskStatus};
use crate::error::Result;
use crate::retry::OperationKind;

use super::Engine;

/// What happened to a task, as seen by its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl EventKind {
    /// The event a transition into `status` emits, if any.
    pub fn from_status(status: &TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Completed => Some(EventKind::Completed),
            TaskStatus::Failed { .. } => Some(EventKind::Failed),
            TaskStatus::Blocked { .. } => Some(EventKind::Blocked),
            TaskStatus::Cancelled => Some(EventKind::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Blocked => "blocked",
            EventKind::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// One emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, task_id: TaskId) -> Self {
        Self {
            kind,
            task_id,
            timestamp: Utc::now(),
        }
    }
}

/// The outcome of one dispatch pass.
///
/// `events` lists every event emitted, the triggering one first.
/// `transitioned` records each dependent that changed status as a result.
/// `failures` carries per-dependent errors; siblings are unaffected.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub events: Vec<Event>,
    pub transitioned: Vec<(TaskId, TaskStatus)>,
    pub failures: Vec<(TaskId, String)>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.transitioned.is_empty() && self.failures.is_empty()
    }

    fn record(&mut self, id: TaskId, status: TaskStatus) {
        if let Some(kind) = EventKind::from_status(&status) {
            self.events.push(Event::new(kind, id));
        }
        self.transitioned.push((id, status));
    }
}

impl Engine {
    /// Propagate `event` to the tasks it affects.
    pub(crate) async fn dispatch(&self, event: Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        report.events.push(event.clone());

        match event.kind {
            EventKind::Completed => self.on_completed(event.task_id, &mut report).await,
            EventKind::Failed => self.on_failed(event.task_id, &mut report).await,
            EventKind::Cancelled => self.on_cancelled(event.task_id, &mut report).await,
            // Recorded for observers; a blocked task keeps its dependents
            // waiting simply by not completing.
            EventKind::Blocked => {}
        }
        report
    }

    /// A completion may make direct dependents ready.
    ///
    /// Dependents are independent of each other, so they are handled
    /// concurrently; each takes its own task lock. Every transition goes
    /// through the retry engine, so a transient lock timeout on one
    /// dependent is retried rather than dropped.
    async fn on_completed(&self, task_id: TaskId, report: &mut DispatchReport) {
        let dependents = match self.graph_read().await {
            Ok(graph) => graph.dependents_of(&task_id),
            Err(err) => {
                report.failures.push((task_id, err.to_string()));
                return;
            }
        };
        let outcomes = join_all(dependents.into_iter().map(|d| async move {
            let outcome = self
                .retry
                .execute(OperationKind::Dispatch, || self.promote_if_ready(d))
                .await;
            (d, outcome)
        }))
        .await;
        for (dependent, outcome) in outcomes {
            match outcome {
                Ok(Some(status)) => report.record(dependent, status),
                Ok(None) => {}
                Err(err) => report.failures.push((dependent, err.to_string())),
            }
        }
    }

    /// Promote a waiting dependent to ready once every dependency is
    /// completed. Holds the dependent's task lock for the check and the
    /// transition together, so a concurrent update cannot interleave.
    async fn promote_if_ready(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let _guard = self.store.lock_task(id).await?;
        let task = self.store.get(id).await?;

        if !matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::Blocked { .. }
        ) {
            return Ok(None);
        }
        for dep in &task.depends_on {
            let dep_task = self.store.get(*dep).await?;
            if dep_task.status != TaskStatus::Completed {
                clog_debug!(
                    "Task {} still waiting on {}",
                    id.short(),
                    dep.short()
                );
                return Ok(None);
            }
        }

        transition::validate(&task.status, &TaskStatus::Ready)?;
        let status = self
            .store
            .update(id, |t| {
                t.apply_status(TaskStatus::Ready);
                Ok(t.status.clone())
            })
            .await?;
        Ok(Some(status))
    }

    /// A failure either schedules a retry of the task itself or, once the
    /// retry budget is spent, blocks its direct dependents.
    async fn on_failed(&self, task_id: TaskId, report: &mut DispatchReport) {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                report.failures.push((task_id, err.to_string()));
                return;
            }
        };

        if task.attempts < self.config.max_attempts {
            let delay = self.retry.policy().jittered_delay(task.attempts);
            clog_debug!(
                "Task {} failed on attempt {}, retrying in {:?}",
                task_id.short(),
                task.attempts,
                delay
            );
            tokio::time::sleep(delay).await;
            let outcome = self
                .retry
                .execute(OperationKind::Dispatch, || {
                    self.restart_if_still_failed(task_id)
                })
                .await;
            match outcome {
                Ok(Some(status)) => report.transitioned.push((task_id, status)),
                Ok(None) => {}
                Err(err) => report.failures.push((task_id, err.to_string())),
            }
            return;
        }

        let reason = format!(
            "dependency {} failed after {} attempts",
            task_id.short(),
            task.attempts
        );
        let dependents = match self.graph_read().await {
            Ok(graph) => graph.dependents_of(&task_id),
            Err(err) => {
                report.failures.push((task_id, err.to_string()));
                return;
            }
        };
        for dependent in dependents {
            let outcome = self
                .retry
                .execute(OperationKind::Dispatch, || {
                    self.block_dependent(dependent, &reason)
                })
                .await;
            match outcome {
                Ok(Some(status)) => report.record(dependent, status),
                Ok(None) => {}
                Err(err) => report.failures.push((dependent, err.to_string())),
            }
        }
    }

    /// Move a task back to in_progress for another attempt, unless a
    /// concurrent update (a cancel, say) already moved it elsewhere.
    async fn restart_if_still_failed(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let _guard = self.store.lock_task(id).await?;
        let task = self.store.get(id).await?;
        if !matches!(task.status, TaskStatus::Failed { .. }) {
            return Ok(None);
        }
        let status = self
            .store
            .update(id, |t| {
                t.apply_status(TaskStatus::InProgress);
                Ok(t.status.clone())
            })
            .await?;
        Ok(Some(status))
    }

    async fn block_dependent(&self, id: TaskId, reason: &str) -> Result<Option<TaskStatus>> {
        let _guard = self.store.lock_task(id).await?;
        let task = self.store.get(id).await?;
        if task.is_terminal() || matches!(task.status, TaskStatus::Blocked { .. }) {
            return Ok(None);
        }
        let blocked = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        transition::validate(&task.status, &blocked)?;
        let status = self
            .store
            .update(id, |t| {
                t.apply_status(blocked.clone());
                Ok(t.status.clone())
            })
            .await?;
        Ok(Some(status))
    }

    /// Cancellation reaches every transitive dependent still in flight.
    /// Unrelated branches are untouched.
    async fn on_cancelled(&self, task_id: TaskId, report: &mut DispatchReport) {
        let affected = match self.graph_read().await {
            Ok(graph) => graph.transitive_dependents(&task_id),
            Err(err) => {
                report.failures.push((task_id, err.to_string()));
                return;
            }
        };
        let outcomes = join_all(affected.into_iter().map(|d| async move {
            let outcome = self
                .retry
                .execute(OperationKind::Dispatch, || self.cancel_if_active(d))
                .await;
            (d, outcome)
        }))
        .await;
        for (dependent, outcome) in outcomes {
            match outcome {
                Ok(Some(status)) => report.record(dependent, status),
                Ok(None) => {}
                Err(err) => report.failures.push((dependent, err.to_string())),
            }
        }
    }

    async fn cancel_if_active(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let _guard = self.store.lock_task(id).await?;
        let task = self.store.get(id).await?;
        if task.is_terminal() {
            return Ok(None);
        }
        transition::validate(&task.status, &TaskStatus::Cancelled)?;
        let status = self
            .store
            .update(id, |t| {
                t.apply_status(TaskStatus::Cancelled);
                Ok(t.status.clone())
            })
            .await?;
        Ok(Some(status))
    }
}
