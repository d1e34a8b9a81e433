use crate::backend::{DatabaseBackend, Dialect, Executor, QueryResult, QueryRow, Transaction};
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` opens a fresh database, so the pool holds
    /// exactly one connection that is never recycled.
    pub async fn memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        Self::new(&format!("sqlite://{}", path)).await
    }

    /// Convert SQLite row to QueryRow using each value's storage class
    fn convert_row(row: &SqliteRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for (index, column) in row.columns().iter().enumerate() {
            let type_name = match row.try_get_raw(index) {
                Ok(raw) if raw.is_null() => None,
                Ok(raw) => Some(raw.type_info().name().to_string()),
                Err(_) => None,
            };

            let value = match type_name.as_deref() {
                None => Value::Null,
                Some("INTEGER") => row
                    .try_get::<i64, _>(index)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                Some("REAL") => row
                    .try_get::<f64, _>(index)
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Some("BOOLEAN") => row
                    .try_get::<bool, _>(index)
                    .map(Value::Bool)
                    .unwrap_or(Value::Null),
                Some("BLOB") => row
                    .try_get::<Vec<u8>, _>(index)
                    .map(|bytes| Value::String(BASE64.encode(bytes)))
                    .unwrap_or(Value::Null),
                Some(_) => Self::decode_fallback(row, index),
            };

            query_row.insert(column.name().to_string(), value);
        }

        query_row
    }

    fn decode_fallback(row: &SqliteRow, index: usize) -> Value {
        if let Ok(value) = row.try_get::<String, _>(index) {
            Value::String(value)
        } else if let Ok(value) = row.try_get::<i64, _>(index) {
            Value::from(value)
        } else if let Ok(value) = row.try_get::<f64, _>(index) {
            serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    }
}

/// Pooled connection used outside transactions
struct SqlitePooled {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl Executor for SqlitePooled {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(sql, "sqlite execute");
        let result = sqlx::query(sql).execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "sqlite query");
        let rows = sqlx::query(sql).fetch_all(&mut *self.conn).await?;
        Ok(rows.iter().map(SqliteBackend::convert_row).collect())
    }
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl Executor for SqliteTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(sql, "sqlite execute (tx)");
        let result = sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "sqlite query (tx)");
        let rows = sqlx::query(sql).fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(SqliteBackend::convert_row).collect())
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn as_executor(&mut self) -> &mut dyn Executor {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn acquire(&self) -> Result<Box<dyn Executor>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqlitePooled { conn }))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
