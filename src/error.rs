//! Error types shared by the pool, the retry policy, the circuit breaker and
//! the [`DatabaseManager`](crate::DatabaseManager) facade.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Crate result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of a driver failure, used by retry classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Auth,
    Server,
    Protocol,
    Other,
}

impl FailureKind {
    /// The connection's protocol state is unknown after a failure of this
    /// kind, so it must not go back to the idle set.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            FailureKind::ConnectionRefused
                | FailureKind::ConnectionReset
                | FailureKind::Timeout
                | FailureKind::Protocol
        )
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::Timeout => "timeout",
            FailureKind::Auth => "auth",
            FailureKind::Server => "server",
            FailureKind::Protocol => "protocol",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// The only error type a [`Manager`](crate::Manager) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub kind: FailureKind,
    /// Server error code (SQLSTATE for postgres), if the server sent one.
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConnectionRefused, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConnectionReset, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Server, message).with_code(code)
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => FailureKind::ConnectionReset,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::Timeout,
            ErrorKind::PermissionDenied => FailureKind::Auth,
            ErrorKind::InvalidData => FailureKind::Protocol,
            _ => FailureKind::Other,
        };
        Self::new(kind, e.to_string())
    }
}

/// Where inside a query the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Acquire,
    Execute,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Acquire => f.write_str("acquire"),
            Phase::Execute => f.write_str("execute"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Handshake or authentication with the server failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] DriverError),

    /// No pooled connection became available in time.
    #[error("no connection available within {0:?}")]
    PoolExhausted(Duration),

    /// Operation issued before `connect` or after shutdown.
    #[error("database is not connected")]
    NotConnected,

    /// Rejected by the circuit breaker without touching the network.
    #[error("circuit breaker is open, next attempt in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// The server or driver reported a failure while executing.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The network call exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A query failed after retries, with the statement and phase attached.
    #[error("{phase} failed for `{sql}`: {source}")]
    QueryFailed {
        phase: Phase,
        sql: String,
        #[source]
        source: Box<Error>,
    },

    /// `connect` could not confirm the server is reachable.
    #[error("connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

const MAX_SQL_IN_ERROR: usize = 256;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Innermost error beneath any context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::QueryFailed { source, .. } | Error::ConnectionFailed { source } => {
                source.root()
            }
            e => e,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.root() {
            Error::Driver(e) | Error::ConnectFailed(e) => Some(e.kind),
            Error::Timeout(_) => Some(FailureKind::Timeout),
            _ => None,
        }
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self.root() {
            Error::Driver(e) | Error::ConnectFailed(e) => e.code.as_deref(),
            _ => None,
        }
    }

    /// Whether this outcome counts against the circuit breaker. Only
    /// failures of an attempted operation do; contention and gating do not.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self.root(),
            Error::Driver(_) | Error::ConnectFailed(_) | Error::Timeout(_)
        )
    }

    /// Attach the statement and phase to failures that came from the
    /// network call. Gate and contention errors pass through unchanged.
    pub(crate) fn in_query(self, sql: &str) -> Self {
        let phase = match &self {
            Error::ConnectFailed(_) => Phase::Acquire,
            Error::Driver(_) | Error::Timeout(_) => Phase::Execute,
            _ => return self,
        };
        let sql = match sql.char_indices().nth(MAX_SQL_IN_ERROR) {
            Some((idx, _)) => format!("{}...", &sql[..idx]),
            None => sql.to_string(),
        };
        Error::QueryFailed {
            phase,
            sql,
            source: Box::new(self),
        }
    }
}
