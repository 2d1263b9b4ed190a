use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Current state of the connection pool, recomputed on every call to
/// [`Pool::state`](crate::Pool::state).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct PoolState {
    /// Maximum open connections allowed
    pub max_open: u64,
    /// Total connections = in_use + idle + connecting
    pub connections: u64,
    /// Currently handed out to callers
    pub in_use: u64,
    /// Idle connections available
    pub idle: u64,
    /// Callers waiting in acquire
    pub waits: u64,
    /// Currently establishing connections
    pub connecting: u64,
    /// Currently being checked/validated
    pub checking: u64,
    /// Drain has started; no new acquire succeeds
    pub closed: bool,
}

impl Display for PoolState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ max_open: {}, connections: {}, in_use: {}, idle: {}, connecting: {}, checking: {}, waits: {}, closed: {} }}",
            self.max_open, self.connections, self.in_use, self.idle, self.connecting, self.checking, self.waits, self.closed
        )
    }
}
