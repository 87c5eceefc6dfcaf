//! Read-only SQL execution

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Column, Executor, Row};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use watchtower_core::{Error, Result, ResultData};

/// Runs one SELECT and returns its columns and rows
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultData>;
}

/// Settings of an executor pool
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Applied with `SET LOCAL statement_timeout`; zero disables it
    pub statement_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(120),
        }
    }
}

pub(crate) fn driver_error(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db) => Error::database(db.message().to_string()),
        sqlx::Error::PoolTimedOut => Error::database("pool timed out while waiting for a connection"),
        other => Error::database(other.to_string()),
    }
}

/// Executes queries inside a READ ONLY transaction on a PostgreSQL pool.
///
/// Rows come back as `row_to_json` objects and are laid out in the column
/// order reported by the prepared statement, so every column type decodes.
#[derive(Debug, Clone)]
pub struct PgQueryExecutor {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Build a lazily connecting pool; connections are pinged before use
    pub fn connect_lazy(dsn: &str, config: &ExecutorConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .test_before_acquire(true)
            .connect_lazy(dsn)
            .map_err(driver_error)?;
        Ok(Self::new(pool, config.statement_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute(&self, sql: &str) -> Result<ResultData> {
        let sql = statement_text(sql);
        let mut tx = self.pool.begin().await.map_err(driver_error)?;

        (&mut *tx)
            .execute("SET TRANSACTION READ ONLY")
            .await
            .map_err(driver_error)?;
        let timeout_ms = self.statement_timeout.as_millis();
        if timeout_ms > 0 {
            (&mut *tx)
                .execute(format!("SET LOCAL statement_timeout = {timeout_ms}").as_str())
                .await
                .map_err(driver_error)?;
        }

        let described = (&mut *tx).describe(sql).await.map_err(driver_error)?;
        let columns: Vec<String> = described
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();

        let wrapped = format!("SELECT row_to_json(q) AS row FROM ({sql}) AS q");
        let rows = sqlx::query(&wrapped)
            .fetch_all(&mut *tx)
            .await
            .map_err(driver_error)?;

        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let Json(object): Json<Map<String, Value>> =
                row.try_get("row").map_err(driver_error)?;
            data.push(layout_row(&columns, object));
        }

        tx.rollback().await.map_err(driver_error)?;
        Ok(ResultData::new(columns, data))
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn query(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultData> {
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = self.execute(sql) => outcome,
        };

        match &outcome {
            Ok(data) => debug!(
                rows = data.row_count(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Query executed"
            ),
            Err(err) => warn!(error = %err, "Query failed"),
        }
        outcome
    }
}

/// Query text without trailing semicolons
pub fn statement_text(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';').trim_end()
}

/// Place the JSON object's fields in column order
fn layout_row(columns: &[String], object: Map<String, Value>) -> Vec<Value> {
    columns
        .iter()
        .map(|column| object.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}
