#[macro_use]
mod defer;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod guard;
pub mod health;
pub mod observability;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod state;

use async_trait::async_trait;
use serde_json::Value;

/// Output of one statement as reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput<R> {
    pub rows: Vec<R>,
    /// Rows returned or affected, as the server reports it.
    pub rows_affected: u64,
}

impl<R> QueryOutput<R> {
    pub fn rows(rows: Vec<R>) -> Self {
        let rows_affected = rows.len() as u64;
        Self { rows, rows_affected }
    }
}

/// Manager create Connection, check Connection and run statements on it.
///
/// This is the whole boundary to the database server: the pool, the retry
/// policy and the circuit breaker only ever talk to the server through it.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    type Row: Send + 'static;

    ///create Connection (network handshake + authentication)
    async fn connect(&self) -> Result<Self::Connection, DriverError>;

    ///lightweight liveness probe (`SELECT 1`); an Error drops the Connection
    async fn check(&self, conn: &mut Self::Connection) -> Result<(), DriverError>;

    ///run one statement with positional parameters
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryOutput<Self::Row>, DriverError>;

    ///close Connection politely; the default just drops it
    async fn disconnect(&self, conn: Self::Connection) {
        drop(conn);
    }
}

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitSnapshot, CircuitState, CircuitStatus, Clock, TokioClock,
};
pub use config::{CircuitBreakerConfig, ConnectionConfig, HealthConfig, PoolConfig, RetryConfig};
pub use database::{ConnectionInfo, ConnectionStats, DatabaseManager, ResultSet};
pub use error::{DriverError, Error, FailureKind, Result};
pub use guard::ConnectionHandle;
pub use health::{HealthReport, HealthStatus};
pub use pool::Pool;
#[cfg(feature = "postgres")]
pub use postgres::PgManager;
pub use retry::{Classifier, RetryPolicy, RetryableErrors};
pub use state::PoolState;
