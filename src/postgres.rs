use crate::backend::{DatabaseBackend, Dialect, Executor, QueryResult, QueryRow, Transaction};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::debug;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Rows come back as a single `row_to_json` column so every column type
    /// lands as JSON without per-type decoding.
    fn wrap(sql: &str) -> String {
        format!(
            "WITH __q AS ({}) SELECT row_to_json(__q) AS __row FROM __q",
            sql
        )
    }

    fn convert_row(row: &PgRow) -> Result<QueryRow> {
        match row.try_get::<Value, _>("__row")? {
            Value::Object(columns) => Ok(QueryRow::from(columns)),
            other => Err(EngineError::Database(format!(
                "expected a JSON row, got {}",
                other
            ))),
        }
    }
}

struct PgPooled {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl Executor for PgPooled {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(sql, "postgres execute");
        let result = sqlx::query(sql).execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "postgres query");
        let wrapped = PostgresBackend::wrap(sql);
        let rows = sqlx::query(&wrapped).fetch_all(&mut *self.conn).await?;
        rows.iter().map(PostgresBackend::convert_row).collect()
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Executor for PgTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(sql, "postgres execute (tx)");
        let result = sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "postgres query (tx)");
        let wrapped = PostgresBackend::wrap(sql);
        let rows = sqlx::query(&wrapped).fetch_all(&mut *self.tx).await?;
        rows.iter().map(PostgresBackend::convert_row).collect()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
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
impl DatabaseBackend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn acquire(&self) -> Result<Box<dyn Executor>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgPooled { conn }))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_statement() {
        assert_eq!(
            PostgresBackend::wrap("SELECT 1 AS one"),
            "WITH __q AS (SELECT 1 AS one) SELECT row_to_json(__q) AS __row FROM __q"
        );
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_query() {
        let backend = PostgresBackend::new("postgresql://localhost/test")
            .await
            .unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.execute("CREATE TEMPORARY TABLE test_table (id BIGINT PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        tx.execute("INSERT INTO test_table (id, name) VALUES (1, 'Alice')")
            .await
            .unwrap();

        let results = tx
            .query("SELECT * FROM test_table WHERE id = 1")
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));
        tx.rollback().await.unwrap();
    }
}
