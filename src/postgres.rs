//! [`Manager`] for PostgreSQL on top of `sqlx`. Enabled with the `postgres`
//! feature.

use crate::config::ConnectionConfig;
use crate::error::{DriverError, FailureKind};
use crate::{Manager, QueryOutput};
use async_trait::async_trait;
use futures_core::Stream;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Postgres, Row, TypeInfo};

/// Rows are decoded into JSON objects keyed by column name.
pub type JsonRow = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct PgManager {
    options: PgConnectOptions,
}

impl PgManager {
    pub fn new(config: &ConnectionConfig) -> Self {
        let ssl_mode = if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .ssl_mode(ssl_mode);
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        Self { options }
    }
}

#[async_trait]
impl Manager for PgManager {
    type Connection = PgConnection;
    type Row = JsonRow;

    async fn connect(&self) -> Result<PgConnection, DriverError> {
        PgConnection::connect_with(&self.options).await.map_err(map_error)
    }

    async fn check(&self, conn: &mut PgConnection) -> Result<(), DriverError> {
        conn.ping().await.map_err(map_error)
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryOutput<JsonRow>, DriverError> {
        let query = params.iter().fold(sqlx::query(sql), bind);
        let mut rows = Vec::new();
        let mut rows_affected = 0;
        #[allow(deprecated)]
        let mut results = query.fetch_many(&mut *conn);
        while let Some(item) = std::future::poll_fn(|cx| results.as_mut().poll_next(cx)).await {
            match item.map_err(map_error)? {
                Either::Left(done) => rows_affected += done.rows_affected(),
                Either::Right(row) => rows.push(decode_row(&row)),
            }
        }
        if rows_affected == 0 {
            rows_affected = rows.len() as u64;
        }
        Ok(QueryOutput { rows, rows_affected })
    }

    async fn disconnect(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "error closing postgres connection");
        }
    }
}

fn bind<'q>(query: Query<'q, Postgres, PgArguments>, value: &'q Value) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => query.bind(i),
            (None, Some(f)) => query.bind(f),
            (None, None) => query.bind(n.to_string()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

fn decode_row(row: &PgRow) -> JsonRow {
    let mut out = Map::with_capacity(row.len());
    for column in row.columns() {
        let i = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(Value::from),
            "INT2" => row.try_get::<Option<i16>, _>(i).ok().flatten().map(Value::from),
            "INT4" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(Value::from),
            "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(Value::from),
            "FLOAT4" => row.try_get::<Option<f32>, _>(i).ok().flatten().map(Value::from),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(Value::from),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).ok().flatten(),
            _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(Value::from),
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    out
}

/// Map a `sqlx` error onto the failure kinds the retry classifier knows.
pub fn map_error(e: sqlx::Error) -> DriverError {
    match e {
        sqlx::Error::Io(io) => DriverError::from(io),
        sqlx::Error::Tls(e) => DriverError::new(FailureKind::Protocol, e.to_string()),
        sqlx::Error::Protocol(msg) => DriverError::new(FailureKind::Protocol, msg),
        sqlx::Error::PoolTimedOut => DriverError::timeout("timed out waiting for a connection"),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned());
            let kind = match code.as_deref() {
                //invalid authorization specification, invalid password
                Some(c) if c.starts_with("28") => FailureKind::Auth,
                _ => FailureKind::Server,
            };
            let err = DriverError::new(kind, db.message());
            match code {
                Some(code) => err.with_code(code),
                None => err,
            }
        }
        other => DriverError::new(FailureKind::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_keep_their_kind() {
        let e = map_error(sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)));
        assert_eq!(e.kind, FailureKind::ConnectionRefused);
    }

    #[test]
    fn test_protocol_error() {
        let e = map_error(sqlx::Error::Protocol("unexpected message".to_string()));
        assert_eq!(e.kind, FailureKind::Protocol);
        assert!(e.kind.is_connection_level());
    }

    #[test]
    fn test_manager_from_config() {
        let config = ConnectionConfig {
            host: "db.internal".to_string(),
            password: Some("secret".to_string()),
            ..ConnectionConfig::default()
        };
        let manager = PgManager::new(&config);
        assert_eq!(manager.options.get_host(), "db.internal");
        assert_eq!(manager.options.get_port(), 5432);
    }
}
