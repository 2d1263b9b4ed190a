#![allow(dead_code)]

use async_trait::async_trait;
use resilient_pool::{
    CircuitBreakerConfig, ConnectionConfig, DriverError, HealthConfig, Manager, PoolConfig, QueryOutput,
    RetryConfig,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted in-memory server. Every knob is shared with the test through
/// `Arc<MockState>`, so behavior can change while the pool is live.
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicU32,
    pub checks: AtomicU32,
    pub executes: AtomicU32,
    pub disconnects: AtomicU32,
    pub running: AtomicU32,
    pub max_running: AtomicU32,
    pub check_panics: AtomicBool,
    connect_error: Mutex<Option<DriverError>>,
    connect_script: Mutex<VecDeque<DriverError>>,
    connect_delay: Mutex<Duration>,
    check_error: Mutex<Option<DriverError>>,
    execute_error: Mutex<Option<DriverError>>,
    execute_script: Mutex<VecDeque<DriverError>>,
    execute_delay: Mutex<Duration>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connect fails with `e` until cleared.
    pub fn set_connect_error(&self, e: Option<DriverError>) {
        *self.connect_error.lock().unwrap() = e;
    }

    /// The next connects fail with these errors, one each.
    pub fn script_connect(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.connect_script.lock().unwrap().extend(errors);
    }

    pub fn set_connect_delay(&self, d: Duration) {
        *self.connect_delay.lock().unwrap() = d;
    }

    pub fn set_check_error(&self, e: Option<DriverError>) {
        *self.check_error.lock().unwrap() = e;
    }

    pub fn set_execute_error(&self, e: Option<DriverError>) {
        *self.execute_error.lock().unwrap() = e;
    }

    pub fn script_execute(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.execute_script.lock().unwrap().extend(errors);
    }

    pub fn set_execute_delay(&self, d: Duration) {
        *self.execute_delay.lock().unwrap() = d;
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> u32 {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> u32 {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    pub id: u32,
}

pub struct MockManager {
    pub state: Arc<MockState>,
}

impl MockManager {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

struct Running<'a>(&'a MockState);

impl<'a> Running<'a> {
    fn start(state: &'a MockState) -> Self {
        let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_running.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Manager for MockManager {
    type Connection = MockConnection;
    type Row = Value;

    async fn connect(&self) -> Result<MockConnection, DriverError> {
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.state.connect_script.lock().unwrap().pop_front() {
            return Err(e);
        }
        if let Some(e) = self.state.connect_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(MockConnection { id })
    }

    async fn check(&self, _conn: &mut MockConnection) -> Result<(), DriverError> {
        self.state.checks.fetch_add(1, Ordering::SeqCst);
        if self.state.check_panics.load(Ordering::SeqCst) {
            panic!("probe exploded");
        }
        match self.state.check_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        conn: &mut MockConnection,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryOutput<Value>, DriverError> {
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        let _running = Running::start(&self.state);
        let delay = *self.state.execute_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.state.execute_script.lock().unwrap().pop_front() {
            return Err(e);
        }
        if let Some(e) = self.state.execute_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(QueryOutput::rows(vec![json!({
            "connection": conn.id,
            "sql": sql,
            "params": params,
        })]))
    }

    async fn disconnect(&self, _conn: MockConnection) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Short timings so paused-clock tests stay readable.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        pool: PoolConfig {
            max_size: 4,
            acquire_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        },
        query_timeout: Duration::from_secs(1),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
        },
        health: HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        },
        shutdown_grace: Duration::from_secs(10),
        ..ConnectionConfig::default()
    }
}
