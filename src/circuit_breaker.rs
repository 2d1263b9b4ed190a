//! Circuit breaker gating calls to the database server.
//!
//! ```text
//! ┌──────────┐  failure_threshold   ┌──────────┐
//! │  Closed  │ ───────────────────► │   Open   │ ◄─┐
//! └──────────┘  consecutive fails   └────┬─────┘   │ trial
//!      ▲                                 │         │ fails
//!      │ trial succeeds   recovery_timeout elapsed │
//!      │                  and a call arrives       │
//!      │                            ┌────▼─────┐   │
//!      └─────────────────────────── │ HalfOpen │ ──┘
//!                                   └──────────┘
//! ```
//!
//! State changes go through [`transition`], a pure function over
//! ([`CircuitState`], [`Event`]). The breaker only decides whether an
//! operation runs; errors from the operation are handed back untouched.

use crate::config::CircuitBreakerConfig;
use serde::Serialize;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Monotonic time source for the breaker.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// `tokio::time::Instant::now()`, which follows paused test time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { failures: u32 },
    /// Rejecting calls until `until`.
    Open { failures: u32, until: Instant },
    /// One trial call decides between `Closed` and `Open`.
    HalfOpen { failures: u32 },
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed { failures: 0 }
    }
}

impl CircuitState {
    pub fn status(&self) -> CircuitStatus {
        match self {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// Consecutive failures counted so far.
    pub fn failures(&self) -> u32 {
        match *self {
            CircuitState::Closed { failures }
            | CircuitState::Open { failures, .. }
            | CircuitState::HalfOpen { failures } => failures,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Success,
    Failure { at: Instant },
    /// A call arrived at `at` and asks to be let through.
    Probe { at: Instant },
}

/// Next state after `event`. Outcomes that reach an `Open` breaker come from
/// calls admitted earlier and leave it unchanged.
pub fn transition(state: CircuitState, event: Event, config: &CircuitBreakerConfig) -> CircuitState {
    use CircuitState::*;
    match (state, event) {
        (Closed { .. }, Event::Success) => Closed { failures: 0 },
        (Closed { failures }, Event::Failure { at }) => {
            let failures = failures.saturating_add(1);
            if failures >= config.failure_threshold {
                Open {
                    failures,
                    until: at + config.recovery_timeout,
                }
            } else {
                Closed { failures }
            }
        }
        (Open { failures, until }, Event::Probe { at }) if at >= until => HalfOpen { failures },
        (HalfOpen { .. }, Event::Success) => Closed { failures: 0 },
        (HalfOpen { failures }, Event::Failure { at }) => Open {
            failures: failures.saturating_add(1),
            until: at + config.recovery_timeout,
        },
        (state, _) => state,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl Display for CircuitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => f.write_str("closed"),
            CircuitStatus::Open => f.write_str("open"),
            CircuitStatus::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time view of a breaker for health reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    #[serde(with = "humantime_serde")]
    pub since_last_failure: Option<Duration>,
    /// Only set while open; zero once the cool-down has passed.
    #[serde(with = "humantime_serde")]
    pub next_attempt_in: Option<Duration>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation.
    #[error("circuit breaker `{name}` is open, next attempt in {retry_in:?}")]
    Open { name: String, retry_in: Duration },
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitBreakerError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

struct Inner {
    state: CircuitState,
    trial_in_flight: bool,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker<K: Clock = TokioClock> {
    name: String,
    config: CircuitBreakerConfig,
    clock: K,
    inner: Mutex<Inner>,
    //woken whenever the half-open trial finishes
    trial_done: Notify,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl<K: Clock> Debug for CircuitBreaker<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker<TokioClock> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, TokioClock)
    }
}

impl<K: Clock> CircuitBreaker<K> {
    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: K) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::default(),
                trial_in_flight: false,
                last_failure: None,
            }),
            trial_done: Notify::new(),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` if the breaker allows it. Every error counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(op, |_| true).await
    }

    /// Run `op` if the breaker allows it. Errors for which `is_failure`
    /// returns `false` are passed back without touching the failure count.
    pub async fn execute_with<T, E, F, Fut, P>(&self, op: F, is_failure: P) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = match self.admit().await {
            Ok(a) => a,
            Err(retry_in) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(circuit_breaker = %self.name, ?retry_in, "call rejected");
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_in,
                });
            }
        };
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        //releases the trial slot even if this future is dropped mid-call
        let _trial = TrialGuard {
            breaker: self,
            active: admission == Admission::Trial,
        };
        let result = op().await;
        match &result {
            Ok(_) => self.record(admission, Event::Success),
            Err(e) if is_failure(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                let at = self.clock.now();
                self.record(admission, Event::Failure { at });
            }
            Err(_) => {}
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    /// Decide whether a call may run. Callers arriving while the half-open
    /// trial is in flight wait for its outcome.
    async fn admit(&self) -> Result<Admission, Duration> {
        loop {
            let trial_done = self.trial_done.notified();
            {
                let mut inner = self.lock();
                let now = self.clock.now();
                let next = transition(inner.state, Event::Probe { at: now }, &self.config);
                self.apply(&mut inner, next);
                match inner.state {
                    CircuitState::Closed { .. } => return Ok(Admission::Normal),
                    CircuitState::Open { until, .. } => return Err(until.saturating_duration_since(now)),
                    CircuitState::HalfOpen { .. } if !inner.trial_in_flight => {
                        inner.trial_in_flight = true;
                        return Ok(Admission::Trial);
                    }
                    CircuitState::HalfOpen { .. } => {}
                }
            }
            trial_done.await;
        }
    }

    fn record(&self, admission: Admission, event: Event) {
        let mut inner = self.lock();
        if let Event::Failure { at } = event {
            inner.last_failure = Some(at);
        }
        //only the trial decides a half-open breaker
        if admission == Admission::Normal && matches!(inner.state, CircuitState::HalfOpen { .. }) {
            return;
        }
        let next = transition(inner.state, event, &self.config);
        self.apply(&mut inner, next);
    }

    fn apply(&self, inner: &mut Inner, next: CircuitState) {
        let prev = inner.state;
        inner.state = next;
        if prev.status() == next.status() {
            return;
        }
        match next {
            CircuitState::Open { failures, until } => tracing::warn!(
                event = "circuit_breaker",
                circuit_breaker = %self.name,
                transition = "opened",
                failure_count = failures,
                retry_in_ms = until.saturating_duration_since(self.clock.now()).as_millis() as u64,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen { failures } => tracing::info!(
                event = "circuit_breaker",
                circuit_breaker = %self.name,
                transition = "half_open",
                failure_count = failures,
                "circuit breaker half-open, letting one trial call through"
            ),
            CircuitState::Closed { failures } => tracing::info!(
                event = "circuit_breaker",
                circuit_breaker = %self.name,
                transition = "closed",
                failure_count = failures,
                "circuit breaker closed"
            ),
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let now = self.clock.now();
        let next_attempt_in = match inner.state {
            CircuitState::Open { until, .. } => Some(until.saturating_duration_since(now)),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            status: inner.state.status(),
            failure_count: inner.state.failures(),
            since_last_failure: inner.last_failure.map(|t| now.saturating_duration_since(t)),
            next_attempt_in,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed with a zero failure count.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            self.apply(&mut inner, CircuitState::Closed { failures: 0 });
        }
        self.trial_done.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        //the state is plain data, a panic elsewhere cannot leave it half-written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct TrialGuard<'a, K: Clock> {
    breaker: &'a CircuitBreaker<K>,
    active: bool,
}

impl<K: Clock> Drop for TrialGuard<'_, K> {
    fn drop(&mut self) {
        if self.active {
            self.breaker.lock().trial_in_flight = false;
            self.breaker.trial_done.notify_waiters();
        }
    }
}
