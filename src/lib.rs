//! Conductor: a task dependency and execution engine.
//!
//! Tasks form a directed acyclic dependency graph. The engine tracks each
//! task through its lifecycle, persists state and progress checkpoints,
//! retries transient failures with backoff and a circuit breaker, and
//! propagates completions, failures, and cancellations to dependents.
//!
//! ```no_run
//! use conductor::{Engine, EngineConfig, TaskStatus};
//! use std::collections::BTreeMap;
//!
//! # async fn demo() -> conductor::Result<()> {
//! let engine = Engine::open(EngineConfig::load()?).await?;
//! let build = engine.create_task("build", &[], BTreeMap::new()).await?;
//! let test = engine
//!     .create_task("test", &[build.id], BTreeMap::new())
//!     .await?;
//!
//! engine.update_status(build.id, TaskStatus::InProgress).await?;
//! let report = engine.update_status(build.id, TaskStatus::Completed).await?;
//! assert_eq!(report.transitioned, vec![(test.id, TaskStatus::Ready)]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod retry;
pub mod store;

pub use config::EngineConfig;
pub use core::{DependencyGraph, Task, TaskFilter, TaskId, TaskStatus};
pub use engine::{DispatchReport, Engine, Event, EventKind};
pub use error::{Error, Result};
pub use retry::{CircuitBreaker, OperationKind, RetryEngine, RetryPolicy};
pub use store::{Checkpoint, CheckpointStore, TaskStore};
