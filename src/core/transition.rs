//! Status transition table.
//!
//! The table below is the single source of truth for legal status moves.
//! Everything else (the engine, the dispatcher) routes through
//! [`validate`]; no transition logic lives anywhere else.
//!
//! ```text
//! pending     -> ready | blocked | cancelled
//! ready       -> in_progress | blocked | cancelled
//! in_progress -> completed | failed | blocked | cancelled
//! blocked     -> ready | cancelled
//! failed      -> in_progress (retry) | cancelled (abandon)
//! completed   -> (terminal)
//! cancelled   -> (terminal)
//! ```
//!
//! Cancellation is reachable from every non-terminal state so that a
//! cancelled ancestor can propagate forward through the graph.

use crate::core::task::TaskStatus;
use crate::error::{Error, Result};

/// The allowed target state names for each source state.
///
/// Keyed by `TaskStatus::name()` so payload-carrying variants (failed,
/// blocked) compare on the state itself, not the attached message.
const TRANSITIONS: &[(&str, &[&str])] = &[
    ("pending", &["ready", "blocked", "cancelled"]),
    ("ready", &["in_progress", "blocked", "cancelled"]),
    (
        "in_progress",
        &["completed", "failed", "blocked", "cancelled"],
    ),
    ("blocked", &["ready", "cancelled"]),
    ("failed", &["in_progress", "cancelled"]),
    ("completed", &[]),
    ("cancelled", &[]),
];

fn allowed_names(from: &TaskStatus) -> &'static [&'static str] {
    TRANSITIONS
        .iter()
        .find(|(name, _)| *name == from.name())
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

/// Whether `from -> to` is present in the transition table.
pub fn is_allowed(from: &TaskStatus, to: &TaskStatus) -> bool {
    allowed_names(from).contains(&to.name())
}

/// The allowed target states from `from`, as bare statuses for display.
pub fn allowed_targets(from: &TaskStatus) -> Vec<TaskStatus> {
    allowed_names(from)
        .iter()
        .map(|name| bare_status(name))
        .collect()
}

/// Validate a transition, returning `InvalidTransition` with the table
/// excerpt when the pair is not allowed.
pub fn validate(from: &TaskStatus, to: &TaskStatus) -> Result<()> {
    if is_allowed(from, to) {
        return Ok(());
    }
    Err(Error::InvalidTransition {
        from: from.name().to_string(),
        to: to.name().to_string(),
        allowed: allowed_targets(from),
    })
}

fn bare_status(name: &str) -> TaskStatus {
    match name {
        "pending" => TaskStatus::Pending,
        "ready" => TaskStatus::Ready,
        "in_progress" => TaskStatus::InProgress,
        "blocked" => TaskStatus::Blocked {
            reason: String::new(),
        },
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed {
            error: String::new(),
        },
        _ => TaskStatus::Cancelled,
    }
}
