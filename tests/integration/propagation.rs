//! End-to-end propagation scenarios: readiness through a diamond, blocking
//! on exhausted failures, and transitive cancellation.

use conductor::{Error, TaskStatus};

use crate::fixtures::{self, Fixture};

#[tokio::test]
async fn diamond_becomes_ready_only_when_all_deps_complete() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let diamond = fixtures::diamond(&engine).await;

    assert_eq!(fixtures::status_name(&engine, diamond.a).await, "ready");
    assert_eq!(fixtures::status_name(&engine, diamond.b).await, "pending");
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "pending");

    fixtures::run_to_completion(&engine, diamond.a).await;
    assert_eq!(fixtures::status_name(&engine, diamond.b).await, "ready");
    assert_eq!(fixtures::status_name(&engine, diamond.c).await, "ready");
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "pending");

    fixtures::run_to_completion(&engine, diamond.b).await;
    // One of two dependencies done: d must keep waiting.
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "pending");

    fixtures::run_to_completion(&engine, diamond.c).await;
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "ready");
}

#[tokio::test]
async fn completion_report_names_promoted_dependents() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let diamond = fixtures::diamond(&engine).await;

    engine
        .update_status(diamond.a, TaskStatus::InProgress)
        .await
        .unwrap();
    let report = engine
        .update_status(diamond.a, TaskStatus::Completed)
        .await
        .unwrap();

    let mut promoted: Vec<_> = report.transitioned.iter().map(|(id, _)| *id).collect();
    promoted.sort();
    let mut expected = vec![diamond.b, diamond.c];
    expected.sort();
    assert_eq!(promoted, expected);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn closing_a_cycle_is_rejected_and_graph_unchanged() {
    let fx = Fixture::new();
    let engine = fx.engine().await;

    let a = fixtures::create(&engine, "a", &[]).await;
    let b = fixtures::create(&engine, "b", &[a]).await;
    let c = fixtures::create(&engine, "c", &[b]).await;
    let d = fixtures::create(&engine, "d", &[c]).await;

    let err = engine.add_dependency(a, d).await.unwrap_err();
    match err {
        Error::Cycle { path } => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 3);
        }
        other => panic!("expected Cycle, got {other}"),
    }

    // The relation is exactly as before the attempt.
    assert!(engine.get_task(a).await.unwrap().depends_on.is_empty());
    let (critical, total) = engine.critical_path().await.unwrap();
    assert_eq!(critical, vec![a, b, c, d]);
    assert_eq!(total, 4.0);
}

#[tokio::test]
async fn exhausted_failure_blocks_direct_dependents_only() {
    let fx = Fixture::new();
    let engine = fx.engine_with(|c| c.max_attempts = 1).await;

    let a = fixtures::create(&engine, "a", &[]).await;
    let b = fixtures::create(&engine, "b", &[a]).await;
    let grandchild = fixtures::create(&engine, "gc", &[b]).await;
    let unrelated = fixtures::create(&engine, "other", &[]).await;

    engine
        .update_status(a, TaskStatus::InProgress)
        .await
        .unwrap();
    let report = engine
        .update_status(
            a,
            TaskStatus::Failed {
                error: "boom".to_string(),
            },
        )
        .await
        .unwrap();

    let b_task = engine.get_task(b).await.unwrap();
    match &b_task.status {
        TaskStatus::Blocked { reason } => {
            assert!(reason.contains(&a.short()), "reason should name the failed task");
        }
        other => panic!("expected blocked, got {other}"),
    }
    assert!(report
        .transitioned
        .iter()
        .any(|(id, s)| *id == b && s.name() == "blocked"));

    // Blocking stops at direct dependents; the grandchild just stays pending.
    assert_eq!(fixtures::status_name(&engine, grandchild).await, "pending");
    // Sibling isolation: an unrelated task never hears about the failure.
    assert_eq!(fixtures::status_name(&engine, unrelated).await, "ready");
}

#[tokio::test]
async fn failure_within_budget_requeues_the_task() {
    let fx = Fixture::new();
    let engine = fx.engine_with(|c| c.max_attempts = 3).await;

    let a = fixtures::create(&engine, "a", &[]).await;
    let b = fixtures::create(&engine, "b", &[a]).await;

    engine
        .update_status(a, TaskStatus::InProgress)
        .await
        .unwrap();
    let report = engine
        .update_status(
            a,
            TaskStatus::Failed {
                error: "flaky".to_string(),
            },
        )
        .await
        .unwrap();

    let a_task = engine.get_task(a).await.unwrap();
    assert_eq!(a_task.status, TaskStatus::InProgress);
    assert_eq!(a_task.attempts, 2);
    assert!(report
        .transitioned
        .iter()
        .any(|(id, s)| *id == a && s.name() == "in_progress"));
    // The dependent is untouched while the retry is in flight.
    assert_eq!(fixtures::status_name(&engine, b).await, "pending");
}

#[tokio::test]
async fn cancellation_reaches_every_transitive_dependent() {
    let fx = Fixture::new();
    let engine = fx.engine().await;

    let a = fixtures::create(&engine, "a", &[]).await;
    let b = fixtures::create(&engine, "b", &[a]).await;
    let c = fixtures::create(&engine, "c", &[b]).await;
    let unrelated = fixtures::create(&engine, "other", &[]).await;

    let report = engine.cancel(a).await.unwrap();

    assert_eq!(fixtures::status_name(&engine, a).await, "cancelled");
    assert_eq!(fixtures::status_name(&engine, b).await, "cancelled");
    assert_eq!(fixtures::status_name(&engine, c).await, "cancelled");
    assert_eq!(fixtures::status_name(&engine, unrelated).await, "ready");

    let cancelled: Vec<_> = report.transitioned.iter().map(|(id, _)| *id).collect();
    assert!(cancelled.contains(&b));
    assert!(cancelled.contains(&c));
    assert!(!cancelled.contains(&unrelated));
}

#[tokio::test]
async fn cancellation_skips_already_terminal_dependents() {
    let fx = Fixture::new();
    let engine = fx.engine().await;

    let a = fixtures::create(&engine, "a", &[]).await;
    let b = fixtures::create(&engine, "b", &[a]).await;

    fixtures::run_to_completion(&engine, a).await;
    fixtures::run_to_completion(&engine, b).await;

    // Everything downstream already finished; cancel only hits a... but a
    // itself is terminal too, so the transition is refused outright.
    let err = engine.cancel(a).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(fixtures::status_name(&engine, b).await, "completed");
}

#[tokio::test]
async fn cancelling_mid_graph_leaves_upstream_alone() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let diamond = fixtures::diamond(&engine).await;

    engine.cancel(diamond.b).await.unwrap();

    assert_eq!(fixtures::status_name(&engine, diamond.a).await, "ready");
    assert_eq!(fixtures::status_name(&engine, diamond.b).await, "cancelled");
    assert_eq!(fixtures::status_name(&engine, diamond.c).await, "pending");
    assert_eq!(fixtures::status_name(&engine, diamond.d).await, "cancelled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_racing_a_dependency_completion_never_strands_the_task() {
    // A task created while its dependency is completing must always end up
    // ready, whichever side wins each interleaving.
    for _ in 0..25 {
        let fx = Fixture::new();
        let engine = std::sync::Arc::new(fx.engine().await);
        let a = fixtures::create(&engine, "a", &[]).await;
        engine
            .update_status(a, TaskStatus::InProgress)
            .await
            .unwrap();

        let completer = {
            let engine = std::sync::Arc::clone(&engine);
            tokio::spawn(async move {
                engine.update_status(a, TaskStatus::Completed).await.unwrap();
            })
        };
        let creator = {
            let engine = std::sync::Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .create_task("b", &[a], std::collections::BTreeMap::new())
                    .await
                    .unwrap()
                    .id
            })
        };

        completer.await.unwrap();
        let b = creator.await.unwrap();
        assert_eq!(fixtures::status_name(&engine, b).await, "ready");
    }
}

#[tokio::test]
async fn blocking_scores_rank_the_bottleneck_first() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let diamond = fixtures::diamond(&engine).await;

    let scores = engine.blocking_scores().await.unwrap();
    let top = scores
        .iter()
        .max_by(|x, y| x.1.partial_cmp(y.1).unwrap())
        .map(|(id, _)| *id)
        .unwrap();
    assert_eq!(top, diamond.a);
}
