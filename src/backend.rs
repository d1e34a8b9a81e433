use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Row from a query result, columns kept in select order
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub columns: Map<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: Map::new(),
        }
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.columns.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.columns
    }
}

impl Default for QueryRow {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for QueryRow {
    fn from(columns: Map<String, Value>) -> Self {
        Self { columns }
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// SQL dialect spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn default_schema(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "main",
            Dialect::Postgres => "public",
        }
    }

    /// JSON object constructor over `(key, expression)` pairs
    pub fn json_object(&self, pairs: &[(String, String)]) -> String {
        let args = pairs
            .iter()
            .map(|(key, expr)| format!("'{}', {}", key.replace('\'', "''"), expr))
            .collect::<Vec<_>>()
            .join(", ");
        match self {
            Dialect::Sqlite => format!("json_object({})", args),
            Dialect::Postgres => format!("json_build_object({})", args),
        }
    }

    /// Aggregate JSON values into an array, `[]` when there are no rows
    pub fn json_array_agg(&self, expr: &str) -> String {
        match self {
            Dialect::Sqlite => format!("json_group_array({})", expr),
            Dialect::Postgres => format!("coalesce(json_agg({}), '[]'::json)", expr),
        }
    }

    /// Full-text match of a column expression against a literal term
    pub fn search(&self, column: &str, term: &str) -> String {
        let escaped = term.replace('\'', "''");
        match self {
            Dialect::Sqlite => format!("{} LIKE '%{}%'", column, escaped),
            Dialect::Postgres => format!(
                "to_tsvector({}) @@ plainto_tsquery('{}')",
                column, escaped
            ),
        }
    }

    /// Whether NULL sorts before every other value in ascending order
    pub fn nulls_sort_first(&self) -> bool {
        match self {
            Dialect::Sqlite => true,
            Dialect::Postgres => false,
        }
    }

    /// Expression for "now" used by soft deletes
    pub fn now(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }
}

/// Something statements can run against: a pooled connection or an open transaction
#[async_trait]
pub trait Executor: Send {
    fn dialect(&self) -> Dialect;

    /// Execute a SQL statement (no results)
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Query and return results
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;
}

/// An open transaction. Dropping it without commit rolls back.
#[async_trait]
pub trait Transaction: Executor {
    fn as_executor(&mut self) -> &mut dyn Executor;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Database backend trait
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Check out a connection for a sequence of non-transactional statements
    async fn acquire(&self) -> Result<Box<dyn Executor>>;

    /// Begin a transaction on a dedicated connection
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Execute a SQL statement (no results)
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.acquire().await?;
        conn.execute(sql).await
    }

    /// Query and return results
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.query(sql).await
    }

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the pool
    async fn close(&self);
}
