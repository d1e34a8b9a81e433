//! Row-level authorization.
//!
//! A policy narrows a SELECT over its table. It runs once per physical query
//! against the table: the main read, every relation sub-select, the read of
//! a write target and the re-read after a write.

use crate::builder::SelectBuilder;
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Operation a query is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Insert,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Insert => write!(f, "insert"),
            Mode::Read => write!(f, "read"),
            Mode::Update => write!(f, "update"),
            Mode::Delete => write!(f, "delete"),
        }
    }
}

#[async_trait]
pub trait Policy: Send + Sync {
    /// Restrict `stmt` to the rows `ctx` may see for `mode`.
    /// Only the given statement may be changed.
    async fn apply(&self, stmt: &mut SelectBuilder, ctx: &Context, mode: Mode) -> Result<()>;
}

/// Policy from a synchronous closure
pub struct PolicyFn<F>(pub F);

#[async_trait]
impl<F> Policy for PolicyFn<F>
where
    F: Fn(&mut SelectBuilder, &Context, Mode) -> Result<()> + Send + Sync,
{
    async fn apply(&self, stmt: &mut SelectBuilder, ctx: &Context, mode: Mode) -> Result<()> {
        (self.0)(stmt, ctx, mode)
    }
}

/// Apply an optional policy. Tables without one are unrestricted.
pub async fn apply_policy(
    policy: Option<&dyn Policy>,
    stmt: &mut SelectBuilder,
    ctx: &Context,
    mode: Mode,
) -> Result<()> {
    match policy {
        Some(policy) => policy.apply(stmt, ctx, mode).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Condition;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_policy_fn_restricts_statement() {
        let policy = PolicyFn(|stmt: &mut SelectBuilder, ctx: &Context, mode: Mode| -> Result<()> {
            if mode != Mode::Read {
                let owner = stmt.col("owner_id");
                stmt.push_where(Condition::eq(owner, ctx.user_id.clone().unwrap_or(Value::Null)));
            }
            Ok(())
        });

        let ctx = Context::new().with_user(7);

        let mut stmt = SelectBuilder::new("main", "notes", "t0").column("id");
        apply_policy(Some(&policy), &mut stmt, &ctx, Mode::Read).await.unwrap();
        assert!(stmt.where_condition().is_none());

        apply_policy(Some(&policy), &mut stmt, &ctx, Mode::Update).await.unwrap();
        assert!(stmt.build().unwrap().ends_with("WHERE \"t0\".\"owner_id\" = 7"));

        let mut stmt = SelectBuilder::new("main", "notes", "t0").column("id");
        apply_policy(None, &mut stmt, &ctx, Mode::Delete).await.unwrap();
        assert!(stmt.where_condition().is_none());
        assert_eq!(json!(Mode::Delete), json!("delete"));
    }
}
