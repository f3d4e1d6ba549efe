//! Task data model for the dependency engine.
//!
//! Tasks are the atomic units of work coordinated by the engine. Each task
//! tracks its status, dependency set, opaque caller metadata, and the
//! bookkeeping the retry and checkpoint machinery needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output. Ordering is the lexicographic UUID
/// ordering, used for deterministic tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// Tasks progress through these states as dependencies complete, an
/// external executor works on them, and failures are retried. The legal
/// moves between states live in [`crate::core::transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but dependencies not yet satisfied.
    Pending,
    /// Dependencies satisfied, ready for an executor to pick up.
    Ready,
    /// An external executor is working on the task.
    InProgress,
    /// Task cannot proceed.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Task completed successfully. Terminal.
    Completed,
    /// Task failed with an error. May be retried or abandoned.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task cancelled, directly or via a cancelled ancestor. Terminal.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// The bare state name, ignoring any attached payload.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single task tracked by the engine.
///
/// The dependency relation lives in `depends_on`; the reverse view is
/// derived by the dependency graph and never stored here. `metadata` is an
/// opaque key/value bag (priority, assignee, tags) passed through unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, immutable once assigned.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Tasks that must be Completed before this one may become Ready.
    pub depends_on: BTreeSet<TaskId>,
    /// Opaque caller metadata, passed through unmodified.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Cost estimate used as the critical-path weight (default 1.0).
    pub estimate: Option<f64>,
    /// Execution attempts consumed so far (drives the retry budget).
    #[serde(default)]
    pub attempts: u32,
    /// Sequence number of the most recent checkpoint, if any.
    pub last_checkpoint: Option<u64>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last entered InProgress.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached Completed, Failed, or Cancelled.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with no dependencies.
    pub fn new(title: &str) -> Self {
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            metadata: BTreeMap::new(),
            estimate: None,
            attempts: 0,
            last_checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a new pending task depending on the given tasks.
    pub fn with_dependencies(title: &str, depends_on: BTreeSet<TaskId>) -> Self {
        Self {
            depends_on,
            ..Self::new(title)
        }
    }

    /// The weight this task contributes to the critical path.
    pub fn weight(&self) -> f64 {
        self.estimate.unwrap_or(1.0)
    }

    /// Whether the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a new status, maintaining the timing fields.
    ///
    /// This performs no validation; it is called by the engine only after
    /// the transition table has accepted the move.
    pub(crate) fn apply_status(&mut self, status: TaskStatus) {
        match &status {
            TaskStatus::InProgress => {
                self.started_at = Some(Utc::now());
                self.attempts += 1;
            }
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = status;
    }
}

/// Read-side filter for `list_tasks`.
///
/// `status` matches on the bare state name; `metadata` entries must all be
/// present with equal values (tag and assignee are plain metadata keys).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub metadata: BTreeMap<String, String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn by_metadata(key: &str, value: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(key.to_string(), value.to_string());
        Self {
            status: None,
            metadata,
        }
    }

    /// Whether the task satisfies every constraint in the filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = &self.status {
            if task.status.name() != status.name() {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| task.metadata.get(k) == Some(v))
    }
}
