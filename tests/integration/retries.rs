//! Retry engine behavior over virtual and real time: the backoff schedule,
//! exhaustion, and the breaker's open/half-open/closed cycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use conductor::{Error, OperationKind, RetryEngine, RetryPolicy};

fn second_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        jitter_fraction: 0.0,
    }
}

fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        jitter_fraction: 0.0,
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_waits_double_between_attempts() {
    let engine = RetryEngine::new(second_policy(4), 100, Duration::from_secs(300));
    let start = tokio::time::Instant::now();

    let result: Result<(), Error> = engine
        .execute(OperationKind::StoreWrite, || async {
            Err(Error::LockTimeout(Duration::from_millis(1)))
        })
        .await;

    assert!(matches!(
        result.unwrap_err(),
        Error::RetryExhausted { attempts: 4, .. }
    ));
    // Waits after attempts 1, 2, 3: 1s + 2s + 4s.
    assert_eq!(start.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_max_delay() {
    let engine = RetryEngine::new(second_policy(7), 100, Duration::from_secs(300));
    let start = tokio::time::Instant::now();

    let result: Result<(), Error> = engine
        .execute(OperationKind::StoreWrite, || async {
            Err(Error::LockTimeout(Duration::from_millis(1)))
        })
        .await;

    assert!(result.is_err());
    // 1 + 2 + 4 + 8 + 16 + 30: the seventh attempt would have doubled to 64s
    // but the cap holds it at 30s.
    assert_eq!(start.elapsed(), Duration::from_secs(61));
}

#[tokio::test]
async fn exhaustion_reports_attempts_and_root_cause() {
    let engine = RetryEngine::new(quick_policy(3), 100, Duration::from_secs(300));
    let calls = AtomicU32::new(0);

    let result: Result<(), Error> = engine
        .execute(OperationKind::CheckpointWrite, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Io(std::io::Error::other("disk full"))) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result.unwrap_err() {
        Error::RetryExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.to_string().contains("disk full"));
        }
        other => panic!("expected RetryExhausted, got {other}"),
    }
}

#[tokio::test]
async fn breaker_cycles_open_half_open_closed() {
    // Threshold 1 and a short real cool-down.
    let engine = RetryEngine::new(quick_policy(1), 1, Duration::from_millis(20));

    let _: Result<(), Error> = engine
        .execute(OperationKind::Dispatch, || async {
            Err(Error::LockTimeout(Duration::from_millis(1)))
        })
        .await;

    // Open: fails fast without invoking the operation.
    let calls = AtomicU32::new(0);
    let result: Result<(), Error> = engine
        .execute(OperationKind::Dispatch, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    match result.unwrap_err() {
        Error::CircuitOpen { kind, retry_after } => {
            assert_eq!(kind, OperationKind::Dispatch);
            assert!(retry_after <= Duration::from_millis(20));
        }
        other => panic!("expected CircuitOpen, got {other}"),
    }

    // After the cool-down the trial call goes through and closes the circuit.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let trial: Result<u32, Error> = engine
        .execute(OperationKind::Dispatch, || async { Ok(7) })
        .await;
    assert_eq!(trial.unwrap(), 7);

    let again: Result<u32, Error> = engine
        .execute(OperationKind::Dispatch, || async { Ok(8) })
        .await;
    assert_eq!(again.unwrap(), 8);
}

#[tokio::test]
async fn breaker_for_one_kind_leaves_others_alone() {
    let engine = RetryEngine::new(quick_policy(1), 1, Duration::from_secs(300));

    let _: Result<(), Error> = engine
        .execute(OperationKind::StoreWrite, || async {
            Err(Error::LockTimeout(Duration::from_millis(1)))
        })
        .await;

    let checkpoint: Result<(), Error> = engine
        .execute(OperationKind::CheckpointWrite, || async { Ok(()) })
        .await;
    assert!(checkpoint.is_ok());

    let store: Result<(), Error> = engine
        .execute(OperationKind::StoreWrite, || async { Ok(()) })
        .await;
    assert!(matches!(store.unwrap_err(), Error::CircuitOpen { .. }));
}
