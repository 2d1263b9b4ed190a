use crate::circuit_breaker::CircuitSnapshot;
use crate::database::Session;
use crate::state::PoolState;
use crate::Manager;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Weak;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No session: `connect` was never called or shutdown already ran.
    Disconnected,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
            HealthStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Outcome of one health probe together with the pool and breaker state
/// observed right after it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    /// Round trip of the probe, retries included.
    #[serde(with = "humantime_serde")]
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub pool: Option<PoolState>,
    pub circuit: Option<CircuitSnapshot>,
    #[serde(with = "humantime_serde")]
    pub checked_at: SystemTime,
}

impl HealthReport {
    pub fn disconnected() -> Self {
        Self {
            healthy: false,
            status: HealthStatus::Disconnected,
            latency: None,
            error: None,
            pool: None,
            circuit: None,
            checked_at: SystemTime::now(),
        }
    }
}

/// Background probe loop bound to one session.
pub(crate) struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthTask {
    /// Probe every `interval`, first tick one interval from now. The loop
    /// holds only a weak reference and ends once the session is gone.
    pub(crate) fn spawn<M: Manager>(session: Weak<Session<M>>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(session) = session.upgrade() else {
                    break;
                };
                //a panicking probe must not take the loop down with it
                let mut probe = tokio::spawn(async move {
                    session.health_check().await;
                    session.pool.reap_idle().await;
                });
                tokio::select! {
                    _ = token.cancelled() => {
                        probe.abort();
                        break;
                    }
                    joined = &mut probe => {
                        if let Err(e) = joined {
                            if e.is_panic() {
                                tracing::error!(event = "health_check", status = "panicked", "health probe panicked");
                            }
                        }
                    }
                }
            }
            tracing::debug!(event = "health_loop_stopped", "health loop stopped");
        });
        Self { cancel, handle }
    }

    /// Cancel the loop and wait for it to finish.
    pub(crate) async fn stop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            if e.is_panic() {
                tracing::error!("health loop panicked");
            }
        }
    }
}

impl Drop for HealthTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
