//! Retry engine: exponential backoff with jitter and a circuit breaker.
//!
//! Wraps fallible units of work (store writes, checkpoint I/O, dispatch
//! calls). Only transient failures are retried; permanent errors propagate
//! immediately without consuming an attempt. A breaker per operation kind
//! fails fast after a run of consecutive failures, then half-opens for a
//! single trial call once the cool-down has passed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// The kinds of operation the engine routes through the retry machinery.
///
/// Breaker state is tracked per kind: a run of store-write failures must not
/// trip the breaker for dispatch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Persisting the task table.
    StoreWrite,
    /// Writing a checkpoint snapshot.
    CheckpointWrite,
    /// Propagating an event to dependents.
    Dispatch,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::StoreWrite => write!(f, "store_write"),
            OperationKind::CheckpointWrite => write!(f, "checkpoint_write"),
            OperationKind::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// Backoff parameters for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Hard ceiling on attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Uniform jitter of plus or minus this fraction of the delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_fraction: config.jitter_fraction,
        }
    }

    /// Un-jittered delay for attempt `n` (1-indexed):
    /// `min(max_delay, base_delay * 2^(n-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let raw = self
            .base_delay
            .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        raw.min(self.max_delay)
    }

    /// Delay for attempt `n` perturbed by uniform jitter, so independent
    /// agents do not retry in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter_fraction;
        let jittered = rand::thread_rng().gen_range(-spread..=spread) + secs;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Transient bookkeeping for one `execute` invocation. Never persisted.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt_count: u32,
    pub next_delay: Duration,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker for one operation kind.
///
/// Opens after `threshold` consecutive failures; while open, calls fail
/// fast. After the cool-down it half-opens: a single trial call is let
/// through, and its outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
    /// Whether the half-open trial slot is taken.
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Whether a call may proceed right now. Transitions Open to HalfOpen
    /// once the cool-down has elapsed; exactly one caller gets the trial
    /// slot, the rest keep failing fast until its outcome lands.
    pub fn check(&mut self, kind: OperationKind) -> Result<()> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    return Err(Error::CircuitOpen {
                        kind,
                        retry_after: self.cooldown,
                    });
                }
                self.trial_in_flight = true;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    clog_debug!("circuit for {} half-open, admitting trial", kind);
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        kind,
                        retry_after: self.cooldown - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, kind: OperationKind) {
        self.consecutive_failures += 1;
        let tripped = self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.threshold;
        if tripped {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            self.trial_in_flight = false;
            clog_warn!(
                "circuit for {} opened after {} consecutive failures",
                kind,
                self.consecutive_failures
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}

/// Executes fallible operations with backoff, retry budget, and per-kind
/// circuit breaking.
pub struct RetryEngine {
    policy: RetryPolicy,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    breakers: Mutex<HashMap<OperationKind, CircuitBreaker>>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, breaker_threshold: u32, breaker_cooldown: Duration) -> Self {
        Self {
            policy,
            breaker_threshold,
            breaker_cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            config.breaker_threshold,
            config.breaker_cooldown(),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn check_breaker(&self, kind: OperationKind) -> Result<()> {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers
            .entry(kind)
            .or_insert_with(|| CircuitBreaker::new(self.breaker_threshold, self.breaker_cooldown))
            .check(kind)
    }

    fn record_outcome(&self, kind: OperationKind, success: bool) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let breaker = breakers
            .entry(kind)
            .or_insert_with(|| CircuitBreaker::new(self.breaker_threshold, self.breaker_cooldown));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(kind);
        }
    }

    /// Run `op` until it succeeds, the retry budget is exhausted, or a
    /// permanent error surfaces.
    ///
    /// Exhaustion wraps the last underlying error so the root cause is never
    /// hidden. Permanent errors pass through untouched and do not count
    /// against the breaker.
    pub async fn execute<T, F, Fut>(&self, kind: OperationKind, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_breaker(kind)?;

        let mut state = RetryState {
            attempt_count: 0,
            next_delay: self.policy.base_delay,
            circuit_open: false,
        };

        loop {
            state.attempt_count += 1;
            match op().await {
                Ok(value) => {
                    self.record_outcome(kind, true);
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => {
                    // Permanent failure: not the infrastructure's fault.
                    return Err(err);
                }
                Err(err) => {
                    if state.attempt_count >= self.policy.max_attempts {
                        self.record_outcome(kind, false);
                        return Err(Error::RetryExhausted {
                            attempts: state.attempt_count,
                            source: Box::new(err),
                        });
                    }
                    state.next_delay = self.policy.jittered_delay(state.attempt_count);
                    clog_debug!(
                        "{} attempt {} failed ({}), retrying in {:?}",
                        kind,
                        state.attempt_count,
                        err,
                        state.next_delay
                    );
                    tokio::time::sleep(state.next_delay).await;
                }
            }
        }
    }
}
