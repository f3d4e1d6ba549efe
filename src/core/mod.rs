//! Core domain models for the dependency engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks, the dependency graph, and the status transition table.

pub mod dag;
pub mod task;
pub mod transition;

pub use dag::DependencyGraph;
pub use task::{Task, TaskFilter, TaskId, TaskStatus};
