//! The [`DatabaseManager`] facade: the only type callers need.
//!
//! Every network call goes through the same stack:
//! circuit breaker, then retry policy, then a pooled connection.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitSnapshot};
use crate::config::{ConnectionConfig, Validate};
use crate::error::{Error, Result};
use crate::health::{HealthReport, HealthStatus, HealthTask};
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::state::PoolState;
use crate::{Manager, QueryOutput};
use serde::Serialize;
use serde_json::Value;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::Instant;

type Factory<M> = dyn Fn(&ConnectionConfig) -> Result<M> + Send + Sync;

/// Rows of one successful query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet<R> {
    pub rows: Vec<R>,
    pub rows_affected: u64,
    /// Wall time of the whole call, retries included.
    pub duration: Duration,
}

/// Returned by [`DatabaseManager::connect`] once the server answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// `host:port/database`
    pub target: String,
    pub user: String,
    pub ssl: bool,
    pub pool_size: u64,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connected: bool,
    pub pool: Option<PoolState>,
    pub circuit: Option<CircuitSnapshot>,
    /// Latest report from the background loop or an explicit check.
    pub last_health: Option<HealthReport>,
}

/// State that lives from one `connect` to the matching shutdown.
pub(crate) struct Session<M: Manager> {
    config: ConnectionConfig,
    pub(crate) pool: Pool<M>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    last_report: Mutex<Option<HealthReport>>,
}

struct Active<M: Manager> {
    session: Arc<Session<M>>,
    health: Option<HealthTask>,
}

/// Shares one pool and one circuit breaker between any number of callers.
///
/// ```rust,ignore
/// let db = DatabaseManager::new(|config: &ConnectionConfig| Ok(PgManager::new(config)));
/// let info = db.connect(ConnectionConfig::default()).await?;
/// let rows = db.query("SELECT * FROM users WHERE id = $1", &[json!(7)], None).await?;
/// db.graceful_shutdown().await;
/// ```
pub struct DatabaseManager<M: Manager> {
    factory: Box<Factory<M>>,
    active: RwLock<Option<Active<M>>>,
}

impl<M: Manager> Debug for DatabaseManager<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let connected = match self.active.try_read() {
            Ok(active) => Some(active.is_some()),
            Err(_) => None,
        };
        f.debug_struct("DatabaseManager")
            .field("connected", &connected)
            .finish()
    }
}

impl<M: Manager> DatabaseManager<M> {
    /// `factory` builds the driver for each `connect`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ConnectionConfig) -> Result<M> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            active: RwLock::new(None),
        }
    }

    /// Validate `config`, build a new pool and confirm the server answers a
    /// probe, then swap it in and close the previous session if there was
    /// one. Readers keep seeing the old session until the swap.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<ConnectionInfo> {
        config.validate()?;
        tracing::info!(
            event = "connecting",
            target = %config.target(),
            user = %config.user,
            ssl = config.ssl,
            pool_size = config.pool.max_size,
            "connecting to database"
        );
        let manager = (self.factory)(&config)?;
        let session = Arc::new(Session::new(manager, config));
        let latency = match session.probe("connect").await {
            Ok(latency) => latency,
            Err(e) => {
                session.pool.drain(Duration::ZERO).await;
                tracing::error!(
                    event = "connecting",
                    target = %session.config.target(),
                    error = %e,
                    "could not reach database"
                );
                return Err(Error::ConnectionFailed { source: Box::new(e) });
            }
        };
        let health = session
            .config
            .health
            .enabled
            .then(|| HealthTask::spawn(Arc::downgrade(&session), session.config.health.interval));
        let info = ConnectionInfo {
            target: session.config.target(),
            user: session.config.user.clone(),
            ssl: session.config.ssl,
            pool_size: session.config.pool.max_size,
            latency,
        };
        let previous = self.active.write().await.replace(Active { session, health });
        if let Some(previous) = previous {
            Self::close(previous).await;
        }
        tracing::info!(
            event = "connected",
            target = %info.target,
            latency_ms = latency.as_millis() as u64,
            "connected to database"
        );
        Ok(info)
    }

    /// Run one statement. `timeout` bounds each network call and defaults to
    /// `query_timeout`. Waiting for a pooled connection is bounded by the
    /// smaller of `timeout` and `pool.acquire_timeout` and never counts as a
    /// breaker failure.
    pub async fn query(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<ResultSet<M::Row>> {
        let session = self.session().await?;
        session.query(sql, params, timeout).await
    }

    /// Probe the server now and report. The probe counts toward the circuit
    /// breaker like any other call.
    pub async fn health_check(&self) -> HealthReport {
        match self.session().await {
            Ok(session) => session.health_check().await,
            Err(_) => HealthReport::disconnected(),
        }
    }

    /// Pool and breaker state without touching the network.
    pub async fn get_connection_stats(&self) -> ConnectionStats {
        match self.session().await {
            Ok(session) => ConnectionStats {
                connected: true,
                pool: Some(session.pool.state()),
                circuit: Some(session.breaker.snapshot()),
                last_health: session.last_report(),
            },
            Err(_) => ConnectionStats {
                connected: false,
                pool: None,
                circuit: None,
                last_health: None,
            },
        }
    }

    /// Stop the health loop, let in-flight queries finish within
    /// `shutdown_grace`, then close every connection. Later calls fail with
    /// [`Error::NotConnected`] until the next `connect`.
    pub async fn graceful_shutdown(&self) {
        let previous = self.active.write().await.take();
        if let Some(previous) = previous {
            Self::close(previous).await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Configuration of the live session.
    pub async fn config(&self) -> Option<ConnectionConfig> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.session.config.clone())
    }

    async fn session(&self) -> Result<Arc<Session<M>>> {
        match self.active.read().await.as_ref() {
            Some(a) => Ok(a.session.clone()),
            None => Err(Error::NotConnected),
        }
    }

    async fn close(mut active: Active<M>) {
        if let Some(health) = active.health.as_mut() {
            health.stop().await;
        }
        let session = active.session;
        let all_released = session.pool.drain(session.config.shutdown_grace).await;
        tracing::info!(
            event = "disconnected",
            target = %session.config.target(),
            all_released,
            "disconnected from database"
        );
    }
}

impl<M: Manager> Session<M> {
    fn new(manager: M, config: ConnectionConfig) -> Self {
        let pool = Pool::new(manager);
        pool.set_max_open(config.pool.max_size);
        pool.set_idle_timeout(Some(config.pool.idle_timeout));
        pool.set_check_interval(Some(config.pool.check_interval));
        pool.set_timeout_check(Some(config.pool.check_timeout));
        pool.set_timeout_connect(Some(config.pool.connect_timeout));
        Self {
            breaker: CircuitBreaker::new(config.target(), config.circuit_breaker.clone()),
            retry: RetryPolicy::from(&config.retry),
            pool,
            config,
            last_report: Mutex::new(None),
        }
    }

    async fn query(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<ResultSet<M::Row>> {
        let timeout = timeout.unwrap_or(self.config.query_timeout);
        let started = Instant::now();
        let output = self
            .guarded("query", move || self.execute_once(sql, params, timeout))
            .await
            .map_err(|e| e.in_query(sql))?;
        let duration = started.elapsed();
        tracing::debug!(
            event = "query_executed",
            duration_ms = duration.as_millis() as u64,
            row_count = output.rows_affected,
            "query executed"
        );
        Ok(ResultSet {
            rows: output.rows,
            rows_affected: output.rows_affected,
            duration,
        })
    }

    /// Breaker around retry around `attempt`.
    async fn guarded<T, F, Fut>(&self, operation: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let retried = || self.retry.execute(operation, attempt, &self.config.retry.retryable);
        match self.breaker.execute_with(retried, Error::is_breaker_failure).await {
            Ok(v) => Ok(v),
            Err(CircuitBreakerError::Open { retry_in, .. }) => Err(Error::CircuitOpen { retry_in }),
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        }
    }

    async fn execute_once(&self, sql: &str, params: &[Value], timeout: Duration) -> Result<QueryOutput<M::Row>> {
        let wait = timeout.min(self.config.pool.acquire_timeout);
        let mut conn = self.pool.acquire_timeout(Some(wait)).await?;
        let executed = tokio::time::timeout(timeout, self.pool.manager.execute(&mut *conn, sql, params)).await;
        match executed {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                if e.kind.is_connection_level() {
                    conn.discard();
                }
                Err(Error::Driver(e))
            }
            Err(_) => {
                conn.discard();
                Err(Error::Timeout(timeout))
            }
        }
    }

    async fn check_once(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire_timeout(Some(self.config.pool.acquire_timeout))
            .await?;
        let check_timeout = self.config.pool.check_timeout;
        let checked = tokio::time::timeout(check_timeout, self.pool.manager.check(&mut *conn)).await;
        match checked {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                conn.discard();
                Err(Error::Driver(e))
            }
            Err(_) => {
                conn.discard();
                Err(Error::Timeout(check_timeout))
            }
        }
    }

    /// `SELECT 1` through the full stack; returns the round trip.
    async fn probe(&self, operation: &str) -> Result<Duration> {
        let started = Instant::now();
        self.guarded(operation, move || self.check_once()).await?;
        Ok(started.elapsed())
    }

    pub(crate) async fn health_check(&self) -> HealthReport {
        let probed = self.probe("health_check").await;
        let (latency, error) = match probed {
            Ok(latency) => (Some(latency), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let healthy = error.is_none();
        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        let report = HealthReport {
            healthy,
            status,
            latency,
            error,
            pool: Some(self.pool.state()),
            circuit: Some(self.breaker.snapshot()),
            checked_at: SystemTime::now(),
        };
        match &report.error {
            None => tracing::debug!(
                event = "health_check",
                status = %report.status,
                latency_ms = latency.map(|l| l.as_millis() as u64),
                "database healthy"
            ),
            Some(error) => tracing::warn!(
                event = "health_check",
                status = %report.status,
                error = %error,
                "database unhealthy"
            ),
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    fn last_report(&self) -> Option<HealthReport> {
        self.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
