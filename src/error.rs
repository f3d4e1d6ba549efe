use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};
use crate::retry::OperationKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Dependency cycle detected: {}", format_cycle(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("Invalid transition from {from} to {to} (allowed: {})", format_allowed(.allowed))]
    InvalidTransition {
        from: String,
        to: String,
        allowed: Vec<TaskStatus>,
    },

    #[error("Task {task_id} has incomplete dependencies: {}", format_ids(.incomplete))]
    DependenciesNotMet {
        task_id: TaskId,
        incomplete: Vec<TaskId>,
    },

    #[error("Task {0} still has dependents: {ids}", ids = format_ids(.1))]
    HasDependents(TaskId, Vec<TaskId>),

    #[error("No resumable checkpoint for task {0}")]
    NotResumable(TaskId),

    #[error("Lock wait timed out after {0:?}")]
    LockTimeout(Duration),

    #[error("Checkpoint {sequence} for task {task_id} is corrupt")]
    CheckpointCorruption { task_id: TaskId, sequence: u64 },

    #[error("Circuit open for {kind}, retry after {retry_after:?}")]
    CircuitOpen {
        kind: OperationKind,
        retry_after: Duration,
    },

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether retrying this error could plausibly succeed.
    ///
    /// Transient errors (I/O contention, lock timeouts) are absorbed by the
    /// retry engine; permanent errors (cycles, illegal transitions, corrupt
    /// checkpoints) propagate immediately without consuming an attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::LockTimeout(_))
    }
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.short())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.short())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_allowed(allowed: &[TaskStatus]) -> String {
    if allowed.is_empty() {
        return "none, state is terminal".to_string();
    }
    allowed
        .iter()
        .map(|s| s.name())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
