//! Shared helpers for the integration suite.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use tempfile::TempDir;

use conductor::{Engine, EngineConfig, TaskId, TaskStatus};

/// A temporary data directory that outlives the engines opened over it, so
/// tests can close an engine and reopen the same state.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Test-friendly config: millisecond backoff, no jitter, short lock
    /// waits.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            data_dir: Some(self.dir.path().to_path_buf()),
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_fraction: 0.0,
            lock_timeout_ms: 200,
            ..EngineConfig::default()
        }
    }

    pub async fn engine(&self) -> Engine {
        Engine::open(self.config()).await.unwrap()
    }

    pub async fn engine_with(&self, adjust: impl FnOnce(&mut EngineConfig)) -> Engine {
        let mut config = self.config();
        adjust(&mut config);
        Engine::open(config).await.unwrap()
    }
}

pub async fn create(engine: &Engine, title: &str, deps: &[TaskId]) -> TaskId {
    engine
        .create_task(title, deps, BTreeMap::new())
        .await
        .unwrap()
        .id
}

/// Drive a ready task through in_progress to completed.
pub async fn run_to_completion(engine: &Engine, id: TaskId) {
    engine
        .update_status(id, TaskStatus::InProgress)
        .await
        .unwrap();
    engine
        .update_status(id, TaskStatus::Completed)
        .await
        .unwrap();
}

pub async fn status_name(engine: &Engine, id: TaskId) -> &'static str {
    engine.get_task(id).await.unwrap().status.name()
}

/// The classic diamond: b and c depend on a, d depends on both.
pub struct Diamond {
    pub a: TaskId,
    pub b: TaskId,
    pub c: TaskId,
    pub d: TaskId,
}

pub async fn diamond(engine: &Engine) -> Diamond {
    let a = create(engine, "a", &[]).await;
    let b = create(engine, "b", &[a]).await;
    let c = create(engine, "c", &[a]).await;
    let d = create(engine, "d", &[b, c]).await;
    Diamond { a, b, c, d }
}
