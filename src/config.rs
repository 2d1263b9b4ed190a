//! Connection configuration.
//!
//! A [`ConnectionConfig`] is an immutable snapshot captured by
//! [`DatabaseManager::connect`](crate::DatabaseManager::connect). Changing any
//! of it, pool bounds included, takes a full disconnect/reconnect cycle.
//!
//! Every field has a default, so a partial document deserializes:
//!
//! ```rust
//! use resilient_pool::ConnectionConfig;
//!
//! let config: ConnectionConfig = serde_json::from_str(
//!     r#"{ "host": "db.internal", "pool": { "max_size": 20 }, "retry": { "base_delay": "50ms" } }"#,
//! ).unwrap();
//! assert_eq!(config.port, 5432);
//! assert_eq!(config.pool.max_size, 20);
//! ```

use crate::error::{Error, Result};
use crate::retry::RetryableErrors;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::time::Duration;

/// Checks a configuration section before it is used.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// Never serialized and never printed by `Debug`.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Deadline for one network call when the caller passes none.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// How long shutdown waits for in-flight queries before closing the pool.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Idle connections older than this are closed. Zero keeps them forever.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long `query` waits for a pooled connection.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Bound on the network handshake for a new connection.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle connections are re-checked before reuse once idle this long.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub check_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub retryable: RetryableErrors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down before a trial call is let through.
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_max_size() -> u64 {
    10
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: None,
            ssl: false,
            pool: PoolConfig::default(),
            query_timeout: default_query_timeout(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            idle_timeout: default_idle_timeout(),
            acquire_timeout: default_acquire_timeout(),
            connect_timeout: default_connect_timeout(),
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            retryable: RetryableErrors::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval: default_health_interval(),
        }
    }
}

impl ConnectionConfig {
    /// `host:port/database`, for logs and error messages.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl Debug for ConnectionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl", &self.ssl)
            .field("pool", &self.pool)
            .field("query_timeout", &self.query_timeout)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("health", &self.health)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl Validate for ConnectionConfig {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("host cannot be empty"));
        }
        if self.database.is_empty() {
            return Err(Error::config("database cannot be empty"));
        }
        if self.query_timeout.is_zero() {
            return Err(Error::config("query_timeout must be > 0"));
        }
        self.pool.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

impl Validate for PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool.max_size must be > 0"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::config("pool.acquire_timeout must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("pool.connect_timeout must be > 0"));
        }
        if self.check_timeout.is_zero() {
            return Err(Error::config("pool.check_timeout must be > 0"));
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be > 0"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config("retry.base_delay must be <= retry.max_delay"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config("retry.multiplier must be a finite number >= 1.0"));
        }
        Ok(())
    }
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(Error::config("circuit_breaker.recovery_timeout must be > 0"));
        }
        Ok(())
    }
}

impl Validate for HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            return Err(Error::config("health.interval must be > 0 when the health loop is enabled"));
        }
        Ok(())
    }
}
