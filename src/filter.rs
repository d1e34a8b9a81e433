//! Compiles flat request params into WHERE conditions.
//!
//! Keys are column names with an optional operator suffix (`age.gte`),
//! registered query modifiers, or the logical groups `and` / `or`. Reserved
//! paging keys are skipped and unknown keys are ignored.

use crate::backend::Dialect;
use crate::builder::{ComparisonOp, Condition, LogicalOp, SelectBuilder};
use crate::context::{Context, Params};
use crate::engine::Engine;
use crate::error::{EngineError, Result, ValidationErrors};
use crate::schema::ColumnMeta;
use crate::table::Table;
use crate::BoxFuture;
use serde_json::Value;
use tracing::trace;

/// Params consumed by the read pipeline rather than the filter compiler
pub const RESERVED_PARAMS: &[&str] = &["include", "sort", "page", "limit", "cursor", "withDeleted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Not,
    Like,
    Search,
}

impl FilterOp {
    fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "eq" => Some(FilterOp::Eq),
            "neq" | "ne" => Some(FilterOp::Neq),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "not" => Some(FilterOp::Not),
            "like" => Some(FilterOp::Like),
            "search" => Some(FilterOp::Search),
            _ => None,
        }
    }

    fn comparison(self) -> ComparisonOp {
        match self {
            FilterOp::Eq | FilterOp::Not => ComparisonOp::Eq,
            FilterOp::Neq => ComparisonOp::Ne,
            FilterOp::Lt => ComparisonOp::Lt,
            FilterOp::Lte => ComparisonOp::Le,
            FilterOp::Gt => ComparisonOp::Gt,
            FilterOp::Gte => ComparisonOp::Ge,
            FilterOp::Like | FilterOp::Search => ComparisonOp::Like,
        }
    }
}

/// Split `column.op` into the column and its operator. A key without a
/// known operator suffix is a plain equality on the whole key.
fn split_key(key: &str) -> (&str, FilterOp) {
    if let Some((column, suffix)) = key.rsplit_once('.') {
        if let Some(op) = FilterOp::parse(suffix) {
            return (column, op);
        }
    }
    (key, FilterOp::Eq)
}

/// Whether `withDeleted` asks for soft-deleted rows
pub fn with_deleted(params: &Params) -> bool {
    match params.get("withDeleted") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true" || s == "1",
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

/// Add every filter in `params` to `stmt`, plus the soft-delete exclusion
pub async fn compile(
    engine: &Engine,
    table: &Table,
    stmt: &mut SelectBuilder,
    ctx: &Context,
    params: &Params,
) -> Result<()> {
    if let Some(condition) = compile_group(engine, table, stmt, ctx, params, LogicalOp::And).await? {
        stmt.push_where(condition);
    }

    if table.is_soft_delete() && !with_deleted(params) {
        let deleted_at = stmt.col(&engine.config().deleted_at_column);
        stmt.push_where(Condition::is_null(deleted_at));
    }

    trace!(table = table.name(), "filters compiled");
    Ok(())
}

fn compile_group<'a>(
    engine: &'a Engine,
    table: &'a Table,
    stmt: &'a mut SelectBuilder,
    ctx: &'a Context,
    params: &'a Params,
    op: LogicalOp,
) -> BoxFuture<'a, Result<Option<Condition>>> {
    Box::pin(async move {
        let mut conditions = Vec::new();

        for (key, value) in params {
            if RESERVED_PARAMS.contains(&key.as_str()) {
                continue;
            }

            if key == "and" || key == "or" {
                let group_op = if key == "and" { LogicalOp::And } else { LogicalOp::Or };
                if let Some(condition) =
                    compile_logical(engine, table, stmt, ctx, key, value, group_op).await?
                {
                    conditions.push(condition);
                }
                continue;
            }

            if let Some(modifier) = table.def.query_modifiers.get(key) {
                if let Some(condition) = modifier.apply(value, stmt, ctx).await? {
                    conditions.push(condition);
                }
                continue;
            }

            let (column, filter_op) = split_key(key);
            let Some(meta) = table.metadata.column(column) else {
                continue;
            };
            let expr = stmt.col(column);

            if column == table.id_column() && filter_op == FilterOp::Eq {
                if let Some(modifier) = value.as_str().and_then(|s| table.def.id_modifiers.get(s)) {
                    conditions.push(modifier.apply(stmt, &expr, ctx).await?);
                    continue;
                }
            }

            conditions.push(compile_comparison(engine.dialect(), &expr, meta, filter_op, key, value)?);
        }

        Ok(match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(match op {
                LogicalOp::And => Condition::and(conditions),
                LogicalOp::Or => Condition::or(conditions),
            }),
        })
    })
}

/// `and` / `or` with either an object (keys joined by the group operator)
/// or an array of objects (each joined by AND, the elements by the group
/// operator)
async fn compile_logical(
    engine: &Engine,
    table: &Table,
    stmt: &mut SelectBuilder,
    ctx: &Context,
    key: &str,
    value: &Value,
    op: LogicalOp,
) -> Result<Option<Condition>> {
    match value {
        Value::Object(group) => compile_group(engine, table, stmt, ctx, group, op).await,
        Value::Array(items) => {
            let mut conditions = Vec::new();
            for item in items {
                let Value::Object(group) = item else {
                    return Err(EngineError::bad_request(key, "must contain objects"));
                };
                if let Some(condition) =
                    compile_group(engine, table, stmt, ctx, group, LogicalOp::And).await?
                {
                    conditions.push(condition);
                }
            }
            Ok(match (conditions.is_empty(), op) {
                (true, _) => None,
                (false, LogicalOp::And) => Some(Condition::and(conditions)),
                (false, LogicalOp::Or) => Some(Condition::or(conditions)),
            })
        }
        _ => Err(EngineError::bad_request(key, "must be an object or an array")),
    }
}

fn coerce(meta: &ColumnMeta, key: &str, value: &Value) -> Result<Value> {
    meta.sql_type.coerce(value).ok_or_else(|| {
        EngineError::BadRequest(ValidationErrors::single(key, "is invalid"))
    })
}

fn compile_comparison(
    dialect: Dialect,
    expr: &str,
    meta: &ColumnMeta,
    op: FilterOp,
    key: &str,
    value: &Value,
) -> Result<Condition> {
    match op {
        FilterOp::Like => {
            let pattern = value
                .as_str()
                .ok_or_else(|| EngineError::bad_request(key, "must be a string"))?;
            Ok(Condition::compare(expr, ComparisonOp::Like, Value::from(pattern)))
        }
        FilterOp::Search => {
            let term = value
                .as_str()
                .ok_or_else(|| EngineError::bad_request(key, "must be a string"))?;
            Ok(Condition::raw(dialect.search(expr, term)))
        }
        _ => match value {
            Value::Array(items) => {
                let coerced = items
                    .iter()
                    .map(|item| coerce(meta, key, item))
                    .collect::<Result<Vec<_>>>()?;
                match op {
                    FilterOp::Eq => Ok(Condition::compare(expr, ComparisonOp::In, Value::Array(coerced))),
                    FilterOp::Neq | FilterOp::Not => {
                        Ok(Condition::compare(expr, ComparisonOp::NotIn, Value::Array(coerced)))
                    }
                    _ => Err(EngineError::bad_request(key, "does not accept a list")),
                }
            }
            Value::Object(_) => Err(EngineError::bad_request(key, "is invalid")),
            scalar => {
                let coerced = coerce(meta, key, scalar)?;
                match op {
                    FilterOp::Not if coerced.is_null() => {
                        Ok(Condition::compare(expr, ComparisonOp::Ne, Value::Null))
                    }
                    FilterOp::Not => Ok(Condition::eq(expr, coerced).negate()),
                    _ => {
                        if coerced.is_null() && op != FilterOp::Eq && op != FilterOp::Neq {
                            return Err(EngineError::bad_request(key, "cannot be null"));
                        }
                        Ok(Condition::compare(expr, op.comparison(), coerced))
                    }
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlType;
    use serde_json::json;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("age"), ("age", FilterOp::Eq));
        assert_eq!(split_key("age.gte"), ("age", FilterOp::Gte));
        assert_eq!(split_key("name.not"), ("name", FilterOp::Not));
        assert_eq!(split_key("meta.color"), ("meta.color", FilterOp::Eq));
    }

    fn column(name: &str, sql_type: SqlType) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            sql_type,
            nullable: true,
            default: None,
            length: None,
        }
    }

    fn compiled(meta: &ColumnMeta, key: &str, value: Value) -> Result<String> {
        let (_, op) = split_key(key);
        compile_comparison(Dialect::Sqlite, "\"t0\".\"x\"", meta, op, key, &value).map(|c| c.to_sql())
    }

    #[test]
    fn test_compile_comparisons() {
        let age = column("age", SqlType::Integer);
        assert_eq!(compiled(&age, "age", json!("7")).unwrap(), "\"t0\".\"x\" = 7");
        assert_eq!(compiled(&age, "age.gte", json!(18)).unwrap(), "\"t0\".\"x\" >= 18");
        assert_eq!(
            compiled(&age, "age", json!([1, "2"])).unwrap(),
            "\"t0\".\"x\" IN (1, 2)"
        );
        assert_eq!(
            compiled(&age, "age.neq", json!([3])).unwrap(),
            "\"t0\".\"x\" NOT IN (3)"
        );
        assert_eq!(compiled(&age, "age", Value::Null).unwrap(), "\"t0\".\"x\" IS NULL");
        assert_eq!(compiled(&age, "age.not", Value::Null).unwrap(), "\"t0\".\"x\" IS NOT NULL");
        assert_eq!(compiled(&age, "age.not", json!(4)).unwrap(), "NOT (\"t0\".\"x\" = 4)");
    }

    #[test]
    fn test_compile_text_operators() {
        let name = column("name", SqlType::Text);
        assert_eq!(
            compiled(&name, "name.like", json!("a%")).unwrap(),
            "\"t0\".\"x\" LIKE 'a%'"
        );
        assert_eq!(
            compiled(&name, "name.search", json!("it's")).unwrap(),
            "\"t0\".\"x\" LIKE '%it''s%'"
        );
    }

    #[test]
    fn test_compile_rejects_bad_values() {
        let age = column("age", SqlType::Integer);
        let message = |key: &str, value: Value| {
            let err = compiled(&age, key, value).unwrap_err();
            err.validation_errors()
                .and_then(|errors| errors.message(key))
                .map(str::to_string)
        };
        assert_eq!(message("age.gt", json!("x")).as_deref(), Some("is invalid"));
        assert_eq!(message("age.lt", Value::Null).as_deref(), Some("cannot be null"));
        assert_eq!(message("age.like", json!(3)).as_deref(), Some("must be a string"));
        assert_eq!(message("age.gt", json!([1])).as_deref(), Some("does not accept a list"));
        assert_eq!(message("age", json!({"a": 1})).as_deref(), Some("is invalid"));
    }

    #[test]
    fn test_compile_search_per_dialect() {
        let body = column("body", SqlType::Text);
        let condition = compile_comparison(
            Dialect::Postgres,
            "\"t0\".\"body\"",
            &body,
            FilterOp::Search,
            "body.search",
            &json!("rust"),
        )
        .unwrap();
        assert_eq!(
            condition.to_sql(),
            "to_tsvector(\"t0\".\"body\") @@ plainto_tsquery('rust')"
        );
    }

    #[test]
    fn test_with_deleted() {
        let mut params = Params::new();
        assert!(!with_deleted(&params));
        params.insert("withDeleted".to_string(), Value::Bool(true));
        assert!(with_deleted(&params));
        params.insert("withDeleted".to_string(), Value::from("false"));
        assert!(!with_deleted(&params));
    }
}
