use async_trait::async_trait;
use resilient_pool::observability::init_tracing;
use resilient_pool::{ConnectionConfig, DatabaseManager, DriverError, Manager, QueryOutput};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stands in for a real server: every statement echoes itself back.
#[derive(Debug, Default)]
pub struct EchoManager {
    opened: AtomicU64,
}

#[async_trait]
impl Manager for EchoManager {
    type Connection = u64;
    type Row = Value;

    async fn connect(&self) -> Result<Self::Connection, DriverError> {
        Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn check(&self, _conn: &mut Self::Connection) -> Result<(), DriverError> {
        Ok(())
    }

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryOutput<Value>, DriverError> {
        if sql.trim().is_empty() {
            return Err(DriverError::server("42601", "syntax error at end of input"));
        }
        Ok(QueryOutput::rows(vec![json!({"connection": *conn, "sql": sql, "params": params})]))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let db = DatabaseManager::new(|_config: &ConnectionConfig| Ok(EchoManager::default()));

    let info = db.connect(ConnectionConfig::default()).await.unwrap();
    println!("connected = {:?}", info);

    let rows = db
        .query("SELECT * FROM users WHERE id = $1", &[json!(7)], None)
        .await
        .unwrap();
    println!("rows = {:?}", rows.rows);

    match db.query("", &[], None).await {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("error = {}", e),
    }

    println!("health = {:?}", db.health_check().await);
    println!("stats = {}", serde_json::to_string(&db.get_connection_stats().await).unwrap());
    db.graceful_shutdown().await;
    println!("connected after shutdown = {}", db.is_connected().await);
}
