//! Durability scenarios: surviving a restart, checkpoint fallback after a
//! torn write, and pruning.

use std::fs;

use serde_json::json;

use conductor::{CheckpointStore, Error, TaskStatus};

use crate::fixtures::{self, Fixture};

#[tokio::test]
async fn reopen_restores_tasks_statuses_and_graph() {
    let fx = Fixture::new();
    let diamond = {
        let engine = fx.engine().await;
        let diamond = fixtures::diamond(&engine).await;
        fixtures::run_to_completion(&engine, diamond.a).await;
        diamond
    };

    // A fresh engine over the same directory sees the same world.
    let engine = fx.engine().await;
    assert_eq!(fixtures::status_name(&engine, diamond.a).await, "completed");
    assert_eq!(fixtures::status_name(&engine, diamond.b).await, "ready");

    // The rebuilt graph still propagates: finishing b and c readies d.
    fixtures::run_to_completion(&engine, diamond.b).await;
    fixtures::run_to_completion(&engine, diamond.c).await;
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "ready");
}

#[tokio::test]
async fn task_table_never_leaves_a_temp_file() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    fixtures::create(&engine, "a", &[]).await;

    assert!(fx.path().join("tasks.json").exists());
    assert!(!fx.path().join("tasks.json.tmp").exists());
}

#[tokio::test]
async fn checkpoint_survives_restart() {
    let fx = Fixture::new();
    let id = {
        let engine = fx.engine().await;
        let id = fixtures::create(&engine, "a", &[]).await;
        engine
            .update_status(id, TaskStatus::InProgress)
            .await
            .unwrap();
        engine
            .checkpoint(id, json!({"rows_done": 1500}), true)
            .await
            .unwrap();
        id
    };

    // Budget of one so the failure below is not auto-requeued.
    let engine = fx.engine_with(|c| c.max_attempts = 1).await;
    engine
        .update_status(
            id,
            TaskStatus::Failed {
                error: "killed".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(fixtures::status_name(&engine, id).await, "failed");

    let (task, checkpoint) = engine.resume(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(checkpoint.snapshot["rows_done"], 1500);
}

#[tokio::test]
async fn torn_write_falls_back_to_previous_checkpoint() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let id = fixtures::create(&engine, "a", &[]).await;
    engine
        .update_status(id, TaskStatus::InProgress)
        .await
        .unwrap();

    engine.checkpoint(id, json!({"step": 1}), true).await.unwrap();
    let second = engine.checkpoint(id, json!({"step": 2}), true).await.unwrap();

    // Truncate the newest file mid-object, as a crash during write would.
    let path = fx
        .path()
        .join("checkpoints")
        .join(id.to_string())
        .join(format!("{}.json", second.sequence));
    fs::write(&path, b"{\"task_id\":").unwrap();

    let store = CheckpointStore::open(fx.path()).unwrap();
    let latest = store.load_latest(id).unwrap().unwrap();
    assert_eq!(latest.sequence, 1);
    assert_eq!(latest.snapshot["step"], 1);
}

#[tokio::test]
async fn checkpoints_accumulate_until_explicitly_pruned() {
    let fx = Fixture::new();
    let engine = fx.engine_with(|c| c.checkpoint_keep_last = 2).await;
    let id = fixtures::create(&engine, "a", &[]).await;
    engine
        .update_status(id, TaskStatus::InProgress)
        .await
        .unwrap();

    for step in 1..=5 {
        engine
            .checkpoint(id, json!({"step": step}), true)
            .await
            .unwrap();
    }

    // Nothing prunes implicitly: all five snapshots are still on disk.
    let dir = fx.path().join("checkpoints").join(id.to_string());
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 5);

    let removed = engine.prune_checkpoints(id).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

    let store = CheckpointStore::open(fx.path()).unwrap();
    assert_eq!(store.load_latest(id).unwrap().unwrap().sequence, 5);
    assert!(matches!(
        store.load(id, 1).unwrap_err(),
        Error::CheckpointCorruption { .. }
    ));
}

#[tokio::test]
async fn removing_a_task_drops_its_checkpoints() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let id = fixtures::create(&engine, "a", &[]).await;
    engine
        .update_status(id, TaskStatus::InProgress)
        .await
        .unwrap();
    engine.checkpoint(id, json!({}), true).await.unwrap();
    engine.cancel(id).await.unwrap();

    engine.remove_task(id).await.unwrap();
    assert!(!fx
        .path()
        .join("checkpoints")
        .join(id.to_string())
        .exists());
}
