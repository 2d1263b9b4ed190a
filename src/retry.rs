//! Bounded re-attempts with exponential backoff.

use crate::config::RetryConfig;
use crate::error::{Error, FailureKind};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Decides whether a failed attempt is worth repeating.
///
/// Any `Fn(&E) -> bool` is a classifier, so ad-hoc rules need no new type.
pub trait Classifier<E: ?Sized> {
    fn is_retryable(&self, error: &E) -> bool;
}

impl<E: ?Sized, F> Classifier<E> for F
where
    F: Fn(&E) -> bool,
{
    fn is_retryable(&self, error: &E) -> bool {
        self(error)
    }
}

/// Allow-list of transient failures: failure kinds plus server error codes.
///
/// A code match wins over the kind, so a server error is retried only when
/// its SQLSTATE is listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryableErrors {
    #[serde(default = "default_kinds")]
    pub kinds: Vec<FailureKind>,
    #[serde(default = "default_codes")]
    pub codes: Vec<String>,
}

fn default_kinds() -> Vec<FailureKind> {
    vec![
        FailureKind::ConnectionRefused,
        FailureKind::ConnectionReset,
        FailureKind::Timeout,
    ]
}

fn default_codes() -> Vec<String> {
    [
        // connection exceptions
        "08000", "08001", "08003", "08006",
        // too many connections
        "53300",
        // admin shutdown, cannot connect now
        "57P01", "57P03",
        // serialization failure, deadlock
        "40001", "40P01",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

impl Default for RetryableErrors {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            codes: default_codes(),
        }
    }
}

impl RetryableErrors {
    /// Nothing is retried.
    pub fn none() -> Self {
        Self {
            kinds: vec![],
            codes: vec![],
        }
    }
}

impl Classifier<Error> for RetryableErrors {
    fn is_retryable(&self, error: &Error) -> bool {
        if let Some(code) = error.code() {
            if self.codes.iter().any(|c| c == code) {
                return true;
            }
        }
        match error.failure_kind() {
            Some(kind) => self.kinds.contains(&kind),
            None => false,
        }
    }
}

/// State of one `execute` call.
struct RetryContext {
    /// 1-based number of the attempt in progress
    attempt: u32,
    delay: Duration,
}

/// Retries an operation with `delay(n) = min(base * multiplier^(n-1), max)`
/// before the n-th retry. Holds no mutable state, so one policy can serve
/// any number of concurrent calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            base_delay: c.base_delay,
            max_delay: c.max_delay,
            multiplier: c.multiplier,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the `retry`-th retry (1-based). Zero for `retry == 0`.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exp);
        let max = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Run `op` until it succeeds, fails with an error `classifier` rejects,
    /// or `max_attempts` is spent. The last error is returned unchanged.
    pub async fn execute<T, E, F, Fut, C>(&self, operation: &str, mut op: F, classifier: &C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Classifier<E> + ?Sized,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut ctx = RetryContext {
            attempt: 1,
            delay: Duration::ZERO,
        };
        loop {
            let e = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !classifier.is_retryable(&e) {
                if ctx.attempt > 1 {
                    tracing::debug!(
                        event = "retry_aborted",
                        operation,
                        attempt = ctx.attempt,
                        error = %e,
                        "giving up on non-retryable error"
                    );
                }
                return Err(e);
            }
            if ctx.attempt >= max_attempts {
                tracing::warn!(
                    event = "retry_exhausted",
                    operation,
                    attempts = ctx.attempt,
                    error = %e,
                    "retry budget exhausted"
                );
                return Err(e);
            }
            ctx.delay = self.delay(ctx.attempt);
            tracing::warn!(
                event = "retry_attempt",
                operation,
                attempt = ctx.attempt,
                delay_ms = ctx.delay.as_millis() as u64,
                error = %e,
                "operation failed, retrying"
            );
            drop(e);
            tokio::time::sleep(ctx.delay).await;
            ctx.attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let p = policy(10);
        assert_eq!(p.delay(0), Duration::ZERO);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_secs(1));
        assert_eq!(p.delay(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_fractional_multiplier() {
        let p = RetryPolicy {
            multiplier: 1.5,
            ..policy(5)
        };
        assert_eq!(p.delay(2), Duration::from_millis(150));
        assert_eq!(p.delay(3), Duration::from_millis(225));
    }

    #[test]
    fn test_default_allow_list() {
        let c = RetryableErrors::default();
        assert!(c.is_retryable(&Error::Driver(DriverError::refused("down"))));
        assert!(c.is_retryable(&Error::Timeout(Duration::from_secs(1))));
        assert!(c.is_retryable(&Error::ConnectFailed(DriverError::reset("eof"))));
        assert!(c.is_retryable(&Error::Driver(DriverError::server("40P01", "deadlock"))));
        assert!(!c.is_retryable(&Error::Driver(DriverError::server("42601", "syntax error"))));
        assert!(!c.is_retryable(&Error::Driver(DriverError::new(FailureKind::Auth, "bad password"))));
        assert!(!c.is_retryable(&Error::PoolExhausted(Duration::from_secs(1))));
        assert!(!c.is_retryable(&Error::NotConnected));
        assert!(!RetryableErrors::none().is_retryable(&Error::Driver(DriverError::refused("down"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_classifier() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let r: Result<(), &str> = policy(4)
            .execute(
                "closure",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("busy")
                },
                &|e: &&str| *e == "busy",
            )
            .await;
        assert_eq!(r, Err("busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_retry_attempts_are_logged() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let r: Result<u32, Error> = policy(3)
            .execute(
                "probe",
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err(Error::Driver(DriverError::reset("connection reset by peer")))
                    } else {
                        Ok(n)
                    }
                },
                &RetryableErrors::default(),
            )
            .await;
        assert_eq!(r.unwrap(), 2);
        assert!(logs_contain("retry_attempt"));
        assert!(logs_contain("delay_ms=100"));
        assert!(logs_contain("connection reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhaustion_is_logged() {
        let r: Result<(), Error> = policy(2)
            .execute(
                "probe",
                || async { Err(Error::Timeout(Duration::from_millis(5))) },
                &RetryableErrors::default(),
            )
            .await;
        assert!(matches!(r, Err(Error::Timeout(_))));
        assert!(logs_contain("retry_exhausted"));
    }
}
