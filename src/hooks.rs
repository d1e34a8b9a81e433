//! Per-table extension points.
//!
//! Everything here is optional. A table registers at most one write hook,
//! one id generator, and any number of named setters, getters, eager
//! getters, id modifiers, query modifiers and column rules.

use crate::backend::Executor;
use crate::builder::SelectBuilder;
use crate::builder::Condition;
use crate::context::Context;
use crate::error::Result;
use crate::policy::Mode;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Runs inside the write transaction around every row a graph touches
#[async_trait]
pub trait WriteHook: Send + Sync {
    /// Called before the row is written. `values` holds the writable
    /// columns and may be edited; `current` is the stored row for updates
    /// and deletes.
    async fn before_write(
        &self,
        _exec: &mut dyn Executor,
        _mode: Mode,
        _values: &mut Map<String, Value>,
        _current: Option<&Map<String, Value>>,
        _ctx: &Context,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after the whole graph is written, before commit
    async fn after_write(
        &self,
        _exec: &mut dyn Executor,
        _mode: Mode,
        _row: &Map<String, Value>,
        _ctx: &Context,
    ) -> Result<()> {
        Ok(())
    }
}

/// Named write-only input field. Runs after the row it belongs to has been
/// written, with the materialized row.
#[async_trait]
pub trait Setter: Send + Sync {
    async fn set(
        &self,
        exec: &mut dyn Executor,
        row: &Map<String, Value>,
        value: &Value,
        ctx: &Context,
    ) -> Result<()>;
}

/// Named computed value fetched on demand for one row
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(&self, exec: &mut dyn Executor, row: &Map<String, Value>, ctx: &Context)
        -> Result<Value>;
}

/// How an eager getter's rows fold into the output value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerShape {
    /// First column of the first row
    Pluck,
    /// First row as an object
    First,
    /// All rows as an array
    Many,
}

/// Named computed value embedded in the main read as a correlated sub-select
pub trait EagerGetter: Send + Sync {
    /// Build the sub-select. `outer` is the alias of the row being read and
    /// `alias` must be used for the sub-select's own source table.
    fn query(&self, outer: &str, alias: &str, ctx: &Context) -> Result<(SelectBuilder, EagerShape)>;
}

/// Symbolic id such as `me`. Resolves to a condition on the id column.
#[async_trait]
pub trait IdModifier: Send + Sync {
    async fn apply(&self, stmt: &mut SelectBuilder, id_column: &str, ctx: &Context)
        -> Result<Condition>;
}

/// Named filter parameter that compiles to arbitrary SQL
#[async_trait]
pub trait QueryModifier: Send + Sync {
    /// Return `None` to add no condition. The statement itself may also be
    /// changed, e.g. to add a join.
    async fn apply(&self, value: &Value, stmt: &mut SelectBuilder, ctx: &Context)
        -> Result<Option<Condition>>;
}

/// Extra validation for one column. Returns an error message on failure.
pub trait ColumnRule: Send + Sync {
    fn check(&self, value: &Value) -> Option<String>;
}

impl<F> ColumnRule for F
where
    F: Fn(&Value) -> Option<String> + Send + Sync,
{
    fn check(&self, value: &Value) -> Option<String> {
        self(value)
    }
}

/// Produces ids for inserted rows ahead of the INSERT
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Value;
}

/// Random UUID ids
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV4Generator;

impl IdGenerator for UuidV4Generator {
    fn generate(&self) -> Value {
        Value::String(uuid::Uuid::new_v4().to_string())
    }
}

/// Query modifier from a synchronous closure
pub struct QueryModifierFn<F>(pub F);

#[async_trait]
impl<F> QueryModifier for QueryModifierFn<F>
where
    F: Fn(&Value, &mut SelectBuilder, &Context) -> Result<Option<Condition>> + Send + Sync,
{
    async fn apply(
        &self,
        value: &Value,
        stmt: &mut SelectBuilder,
        ctx: &Context,
    ) -> Result<Option<Condition>> {
        (self.0)(value, stmt, ctx)
    }
}

/// Id modifier from a synchronous closure
pub struct IdModifierFn<F>(pub F);

#[async_trait]
impl<F> IdModifier for IdModifierFn<F>
where
    F: Fn(&mut SelectBuilder, &str, &Context) -> Result<Condition> + Send + Sync,
{
    async fn apply(
        &self,
        stmt: &mut SelectBuilder,
        id_column: &str,
        ctx: &Context,
    ) -> Result<Condition> {
        (self.0)(stmt, id_column, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uuid_generator() {
        let a = UuidV4Generator.generate();
        let b = UuidV4Generator.generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().map(str::len), Some(36));
    }

    #[test]
    fn test_closure_rule() {
        let rule = |value: &Value| match value.as_str() {
            Some(s) if s.contains('@') => None,
            _ => Some("must be an email address".to_string()),
        };
        assert_eq!(rule.check(&json!("a@b.c")), None);
        assert!(rule.check(&json!("nope")).is_some());
    }

    #[tokio::test]
    async fn test_id_modifier_fn() {
        let me = IdModifierFn(|_: &mut SelectBuilder, id: &str, ctx: &Context| -> Result<Condition> {
            Ok(Condition::eq(id, ctx.user_id.clone().unwrap_or(Value::Null)))
        });
        let mut stmt = SelectBuilder::new("main", "users", "t0").column("id");
        let ctx = Context::new().with_user(4);
        let id = stmt.col("id");
        let cond = me.apply(&mut stmt, &id, &ctx).await.unwrap();
        assert_eq!(cond.to_sql(), "\"t0\".\"id\" = 4");
    }
}
