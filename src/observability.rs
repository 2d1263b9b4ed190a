//! Process-wide tracing setup for binaries embedding the pool.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! a subscriber is installed, either by the host application or by
//! [`init_tracing`].

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub const LOG_FORMAT_ENV: &str = "RESILIENT_POOL_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or(LogFormat::Compact)
    }
}

/// Install a subscriber once for the process. `RUST_LOG` sets the filter
/// (default `info`); `RESILIENT_POOL_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let result = match LogFormat::from_env() {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().flatten_event(true))
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init(),
        };
        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
