//! Recursive validation of a write graph.
//!
//! Validation casts input values in place and injects placeholder foreign
//! keys for rows the same graph will create, so the committer can trust
//! every node it receives.

use crate::backend::Executor;
use crate::builder::{AliasGen, ComparisonOp, Condition, SelectBuilder};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Result, ValidationErrors};
use crate::graph::{GraphNode, NodeKind};
use crate::policy::Mode;
use crate::read::{fetch_row, is_blank};
use crate::schema::is_placeholder;
use crate::table::Table;
use crate::BoxFuture;
use serde_json::{Map, Value};
use tracing::trace;

/// Validate `node` and its subtree, collecting errors in the graph's shape
pub fn validate_deep<'a>(
    engine: &'a Engine,
    table: &'a Table,
    node: &'a mut GraphNode,
    exec: &'a mut dyn Executor,
    ctx: &'a Context,
) -> BoxFuture<'a, Result<ValidationErrors>> {
    Box::pin(async move {
        let mut errors = ValidationErrors::new();

        if node.kind == NodeKind::Delete {
            if let Some(column) = table.tenant_column() {
                if is_blank(node.values.get(column)) {
                    errors.add(column, "is required");
                }
            }
            return Ok(errors);
        }

        for (name, child) in node.has_one.iter_mut() {
            let rel = table.relation(name)?;
            let target = engine.get(&rel.table)?;
            let child_errors =
                validate_deep(engine, target, child, &mut *exec, ctx).await?;
            errors.nest(name.clone(), child_errors);

            match child.kind {
                NodeKind::Insert => {
                    node.values
                        .insert(rel.relation.clone(), target.metadata.id_type().placeholder_id());
                }
                NodeKind::Update => {
                    if let Some(id) = &child.id {
                        node.values.insert(rel.relation.clone(), id.clone());
                    }
                }
                NodeKind::Delete => {}
            }
        }

        validate_self(engine, table, node, &mut *exec, ctx, &mut errors).await?;

        let parent_id = match node.kind {
            NodeKind::Insert => table.metadata.id_type().placeholder_id(),
            _ => node.id.clone().unwrap_or(Value::Null),
        };
        for (name, children) in node.has_many.iter_mut() {
            let rel = table.relation(name)?;
            let target = engine.get(&rel.table)?;
            for (i, child) in children.iter_mut().enumerate() {
                if child.kind != NodeKind::Delete {
                    child.values.insert(rel.relation.clone(), parent_id.clone());
                }
                let child_errors =
                    validate_deep(engine, target, child, &mut *exec, ctx).await?;
                errors.item(name.clone(), i, child_errors);
            }
        }

        Ok(errors)
    })
}

/// Column-level checks, then uniqueness and foreign keys for columns that
/// passed them
async fn validate_self(
    engine: &Engine,
    table: &Table,
    node: &mut GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
    errors: &mut ValidationErrors,
) -> Result<()> {
    let is_insert = node.kind == NodeKind::Insert;
    let deleted_at = &engine.config().deleted_at_column;

    if let Some(column) = table.tenant_column() {
        if is_blank(node.values.get(column)) {
            errors.add(column, "is required");
        }
    }

    for column in &table.metadata.columns {
        if !table.is_writable(&column.name, deleted_at) {
            continue;
        }

        let Some(raw) = node.values.get(&column.name) else {
            if is_insert && !column.nullable && column.default.is_none() {
                errors.add(column.name.clone(), "is required");
            }
            continue;
        };

        let Some(value) = column.sql_type.coerce(raw) else {
            errors.add(column.name.clone(), "is invalid");
            continue;
        };

        if value.is_null() {
            if !column.nullable {
                errors.add(column.name.clone(), "cannot be null");
            }
            node.values.insert(column.name.clone(), value);
            continue;
        }

        if let (Some(max), Value::String(s)) = (column.length, &value) {
            if s.chars().count() > max as usize {
                errors.add(
                    column.name.clone(),
                    format!("must be at most {} characters", max),
                );
                continue;
            }
        }

        if let Some(message) = table.rules_for(&column.name).find_map(|rule| rule.check(&value)) {
            errors.add(column.name.clone(), message);
            continue;
        }

        node.values.insert(column.name.clone(), value);
    }

    check_unique(table, node, exec, errors).await?;
    check_foreign_keys(engine, table, node, exec, ctx, errors).await?;
    Ok(())
}

/// One lookup per unique column group. Null members skip the group; on
/// update, columns absent from the input are taken from the stored row.
async fn check_unique(
    table: &Table,
    node: &GraphNode,
    exec: &mut dyn Executor,
    errors: &mut ValidationErrors,
) -> Result<()> {
    let mut stored: Option<Map<String, Value>> = None;

    for group in &table.metadata.unique_column_groups {
        if group.iter().any(|c| errors.get(c).is_some()) {
            continue;
        }
        if !group.iter().any(|c| node.values.contains_key(c)) {
            continue;
        }

        let mut values = Vec::with_capacity(group.len());
        for column in group {
            let value = match node.values.get(column) {
                Some(value) => Some(value.clone()),
                None if node.kind == NodeKind::Update => {
                    if stored.is_none() {
                        stored = Some(stored_row(table, node, exec).await?);
                    }
                    stored.as_ref().and_then(|row| row.get(column).cloned())
                }
                None => None,
            };
            match value {
                Some(value) if !value.is_null() => values.push(value),
                _ => break,
            }
        }
        if values.len() != group.len() {
            continue;
        }

        let mut aliases = AliasGen::new();
        let mut stmt = SelectBuilder::new(table.schema(), table.table_name(), aliases.next_alias());
        stmt.push_column(table.id_column());
        for (column, value) in group.iter().zip(values) {
            let column = stmt.col(column);
            stmt.push_where(Condition::eq(column, value));
        }
        if let Some(id) = &node.id {
            let column = stmt.col(table.id_column());
            stmt.push_where(Condition::compare(column, ComparisonOp::Ne, id.clone()));
        }

        let taken = !exec.query(&stmt.limit(1).build()?).await?.is_empty();
        trace!(table = table.name(), group = ?group, taken, "uniqueness checked");
        if taken {
            for column in group {
                errors.add(column.clone(), "is already in use");
            }
        }
    }
    Ok(())
}

/// Stored values of the row being updated, ignoring policy
async fn stored_row(
    table: &Table,
    node: &GraphNode,
    exec: &mut dyn Executor,
) -> Result<Map<String, Value>> {
    let Some(id) = &node.id else {
        return Ok(Map::new());
    };
    let mut aliases = AliasGen::new();
    let mut stmt = SelectBuilder::new(table.schema(), table.table_name(), aliases.next_alias());
    for column in table.metadata.column_names() {
        stmt.push_column(column);
    }
    let column = stmt.col(table.id_column());
    stmt.push_where(Condition::eq(column, id.clone()));

    let rows = exec.query(&stmt.limit(1).build()?).await?;
    Ok(rows
        .into_iter()
        .next()
        .map(|row| row.into_map())
        .unwrap_or_default())
}

/// A set hasOne foreign key must be a placeholder or point at a row the
/// caller can read
async fn check_foreign_keys(
    engine: &Engine,
    table: &Table,
    node: &GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
    errors: &mut ValidationErrors,
) -> Result<()> {
    for rel in table.relations.has_one.values() {
        if errors.get(&rel.relation).is_some() {
            continue;
        }
        let Some(value) = node.values.get(&rel.relation) else {
            continue;
        };
        if value.is_null() || is_placeholder(value) {
            continue;
        }

        let target = engine.get(&rel.table)?;
        let tenant = table
            .shares_tenant(target)
            .and_then(|column| node.values.get(column));
        let visible = fetch_row(engine, target, &mut *exec, ctx, value, Mode::Read, tenant)
            .await?
            .is_some();
        if !visible {
            errors.add(rel.relation.clone(), "does not exist");
        }
    }
    Ok(())
}
