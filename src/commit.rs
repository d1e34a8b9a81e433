//! Transactional commit of a validated write graph.

use crate::backend::Executor;
use crate::builder::{AliasGen, Condition, DeleteBuilder, InsertBuilder, SelectBuilder, UpdateBuilder};
use crate::changes::{ChangeBatch, ChangeSummary};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::graph::{self, GraphNode, NodeKind};
use crate::hooks::WriteHook;
use crate::policy::Mode;
use crate::read::{self, fetch_row, Row};
use crate::schema::values_equal;
use crate::table::Table;
use crate::validate::validate_deep;
use crate::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a committed write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    /// Id of the root row when the write created it
    pub generated_id: Option<Value>,
    /// The root row after the write; `None` after a delete
    pub row: Option<Row>,
    pub changes: Vec<ChangeSummary>,
}

struct PendingHook {
    hook: Arc<dyn WriteHook>,
    mode: Mode,
    row: Map<String, Value>,
}

#[derive(Default)]
struct CommitState {
    changes: Vec<ChangeSummary>,
    pending: Vec<PendingHook>,
}

impl CommitState {
    fn record(&mut self, table: &Table, mode: Mode, row: &Map<String, Value>) {
        let mut row = row.clone();
        table.strip_hidden(&mut row);
        self.changes.push(ChangeSummary {
            path: table.path().to_string(),
            mode,
            row,
        });
    }

    fn queue(&mut self, table: &Table, mode: Mode, row: &Map<String, Value>) {
        if let Some(hook) = &table.def.hook {
            self.pending.push(PendingHook {
                hook: Arc::clone(hook),
                mode,
                row: row.clone(),
            });
        }
    }
}

/// Parse, validate and commit `input` in one transaction, then emit the
/// change batch
pub async fn write(engine: &Engine, table: &Table, input: &Value, ctx: &Context) -> Result<WriteResult> {
    let mut node = GraphNode::parse(engine, table, input)?;

    let mut budget = engine.config().complexity_budget;
    graph::charge_budget(engine, table, &node, &mut budget)?;

    let tenant_errors = graph::check_tenants(engine, table, &mut node)?;
    if !tenant_errors.is_empty() {
        return Err(EngineError::BadRequest(tenant_errors));
    }

    let mut tx = engine.backend().begin().await?;
    let outcome = run_write(engine, table, &mut node, tx.as_executor(), ctx).await;

    let (row, state) = match outcome {
        Ok(committed) => committed,
        Err(e) => {
            warn!(table = table.name(), error = %e, "write rolled back");
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            return Err(e);
        }
    };
    tx.commit().await?;

    info!(
        table = table.name(),
        changes = state.changes.len(),
        "write committed"
    );

    if !state.changes.is_empty() {
        engine.emit(ChangeBatch {
            generation_id: ctx.generation_id.clone(),
            changes: state.changes.clone(),
        });
    }

    let generated_id = match (node.kind, &row) {
        (NodeKind::Insert, Some(row)) => row.get(table.id_column()).cloned(),
        _ => None,
    };

    Ok(WriteResult {
        generated_id,
        row: row.map(|row| read::shape(engine, table, row)),
        changes: state.changes,
    })
}

async fn run_write(
    engine: &Engine,
    table: &Table,
    node: &mut GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
) -> Result<(Option<Map<String, Value>>, CommitState)> {
    graph::upsert_fixup(engine, table, node, &mut *exec, ctx).await?;

    let errors = validate_deep(engine, table, node, &mut *exec, ctx).await?;
    if !errors.is_empty() {
        return Err(EngineError::BadRequest(errors));
    }

    let mut state = CommitState::default();
    let row = commit_node(engine, table, node, &mut *exec, ctx, &mut state).await?;

    for pending in &state.pending {
        pending
            .hook
            .after_write(&mut *exec, pending.mode, &pending.row, ctx)
            .await?;
    }

    Ok((row, state))
}

/// hasOne children first, then the node itself, then hasMany children
fn commit_node<'a>(
    engine: &'a Engine,
    table: &'a Table,
    node: &'a mut GraphNode,
    exec: &'a mut dyn Executor,
    ctx: &'a Context,
    state: &'a mut CommitState,
) -> BoxFuture<'a, Result<Option<Map<String, Value>>>> {
    Box::pin(async move {
        if node.kind == NodeKind::Delete {
            delete_node(engine, table, node, &mut *exec, ctx, &mut *state).await?;
            return Ok(None);
        }

        for (name, child) in node.has_one.iter_mut() {
            let rel = table.relation(name)?;
            let target = engine.get(&rel.table)?;
            let committed = commit_node(engine, target, child, &mut *exec, ctx, &mut *state).await?;
            if let Some(id) = committed.and_then(|row| row.get(target.id_column()).cloned()) {
                node.values.insert(rel.relation.clone(), id);
            }
        }

        let row = match node.kind {
            NodeKind::Insert => insert_node(engine, table, node, &mut *exec, ctx, &mut *state).await?,
            _ => update_node(engine, table, node, &mut *exec, ctx, &mut *state).await?,
        };
        let id = row.get(table.id_column()).cloned().unwrap_or(Value::Null);
        node.id = Some(id.clone());

        for (name, children) in node.has_many.iter_mut() {
            let rel = table.relation(name)?;
            let target = engine.get(&rel.table)?;
            for child in children.iter_mut() {
                if child.kind != NodeKind::Delete {
                    child.values.insert(rel.relation.clone(), id.clone());
                }
                commit_node(engine, target, child, &mut *exec, ctx, &mut *state).await?;
            }
        }

        Ok(Some(row))
    })
}

/// Input restricted to columns the caller may write
fn writable_values(engine: &Engine, table: &Table, values: &Map<String, Value>) -> Map<String, Value> {
    let deleted_at = &engine.config().deleted_at_column;
    values
        .iter()
        .filter(|(column, _)| table.is_writable(column, deleted_at))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Run setters whose key is present in the input
async fn run_setters(
    table: &Table,
    exec: &mut dyn Executor,
    row: &Map<String, Value>,
    input: &Map<String, Value>,
    ctx: &Context,
) -> Result<()> {
    for (key, value) in input {
        if let Some(setter) = table.def.setters.get(key) {
            setter.set(&mut *exec, row, value, ctx).await?;
        }
    }
    Ok(())
}

fn tenant_of<'n>(table: &Table, node: &'n GraphNode) -> Option<&'n Value> {
    table.tenant_column().and_then(|column| node.values.get(column))
}

async fn insert_node(
    engine: &Engine,
    table: &Table,
    node: &mut GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
    state: &mut CommitState,
) -> Result<Map<String, Value>> {
    let id_column = table.id_column();
    let mut values = writable_values(engine, table, &node.values);
    if let Some(generator) = &table.def.id_generator {
        values.insert(id_column.to_string(), generator.generate());
    }

    if let Some(hook) = &table.def.hook {
        hook.before_write(&mut *exec, Mode::Insert, &mut values, None, ctx).await?;
    }

    let mut insert = InsertBuilder::new(table.schema(), table.table_name());
    for (column, value) in values {
        if table.metadata.has_column(&column) {
            insert = insert.value(column, value);
        }
    }
    let rows = exec.query(&insert.returning(id_column).build()?).await?;
    let id = rows
        .first()
        .and_then(|row| row.value(id_column).cloned())
        .ok_or_else(|| EngineError::Database(format!("insert into {} returned no id", table.name())))?;

    let row = match fetch_row(engine, table, &mut *exec, ctx, &id, Mode::Insert, None).await? {
        Some(row) => row,
        None => {
            warn!(table = table.name(), id = %id, "inserted row not visible under policy");
            return Err(EngineError::Unauthorized);
        }
    };
    debug!(table = table.name(), id = %id, "row inserted");

    run_setters(table, &mut *exec, &row, &node.values, ctx).await?;
    state.record(table, Mode::Insert, &row);
    state.queue(table, Mode::Insert, &row);
    Ok(row)
}

async fn update_node(
    engine: &Engine,
    table: &Table,
    node: &mut GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
    state: &mut CommitState,
) -> Result<Map<String, Value>> {
    let id = node.id.clone().ok_or(EngineError::Unauthorized)?;
    let tenant = tenant_of(table, node).cloned();

    let Some(current) =
        fetch_row(engine, table, &mut *exec, ctx, &id, Mode::Update, tenant.as_ref()).await?
    else {
        warn!(table = table.name(), id = %id, "update target not visible under policy");
        return Err(EngineError::Unauthorized);
    };

    let mut values = writable_values(engine, table, &node.values);
    if let Some(hook) = &table.def.hook {
        hook.before_write(&mut *exec, Mode::Update, &mut values, Some(&current), ctx).await?;
    }

    let changed: Vec<(String, Value)> = values
        .into_iter()
        .filter(|(column, value)| {
            table.metadata.has_column(column)
                && current.get(column).map_or(true, |stored| !values_equal(stored, value))
        })
        .collect();
    let setter_input = node.values.keys().any(|key| table.def.setters.contains_key(key));

    if changed.is_empty() && !setter_input {
        debug!(table = table.name(), id = %id, "update skipped, nothing changed");
        return Ok(current);
    }

    if !changed.is_empty() {
        let mut update = UpdateBuilder::new(table.schema(), table.table_name());
        for (column, value) in changed {
            update = update.set(column, value);
        }
        exec.execute(&update.where_eq(table.id_column(), id.clone()).build()?).await?;
    }

    let Some(row) = fetch_row(engine, table, &mut *exec, ctx, &id, Mode::Update, None).await? else {
        warn!(table = table.name(), id = %id, "updated row not visible under policy");
        return Err(EngineError::Unauthorized);
    };

    run_setters(table, &mut *exec, &row, &node.values, ctx).await?;
    state.record(table, Mode::Update, &row);
    state.queue(table, Mode::Update, &row);
    Ok(row)
}

async fn delete_node(
    engine: &Engine,
    table: &Table,
    node: &GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
    state: &mut CommitState,
) -> Result<()> {
    let id = node.id.clone().ok_or(EngineError::Unauthorized)?;

    let Some(current) =
        fetch_row(engine, table, &mut *exec, ctx, &id, Mode::Delete, tenant_of(table, node)).await?
    else {
        warn!(table = table.name(), id = %id, "delete target not visible under policy");
        return Err(EngineError::Unauthorized);
    };

    if let Some(hook) = &table.def.hook {
        let mut values = current.clone();
        hook.before_write(&mut *exec, Mode::Delete, &mut values, Some(&current), ctx).await?;
    }

    state.record(table, Mode::Delete, &current);

    if table.is_soft_delete() {
        soft_delete(engine, table, &id, &mut *exec, &mut *state).await?;
    } else {
        let delete = DeleteBuilder::new(table.schema(), table.table_name())
            .where_eq(table.id_column(), id.clone());
        exec.execute(&delete.build()?).await?;
    }
    debug!(table = table.name(), id = %id, soft = table.is_soft_delete(), "row deleted");

    state.queue(table, Mode::Delete, &current);
    Ok(())
}

/// Stamp the row and cascade into soft-deletable hasMany children. Each
/// cascaded row is recorded as its own delete.
fn soft_delete<'a>(
    engine: &'a Engine,
    table: &'a Table,
    id: &'a Value,
    exec: &'a mut dyn Executor,
    state: &'a mut CommitState,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let deleted_at = &engine.config().deleted_at_column;
        let update = UpdateBuilder::new(table.schema(), table.table_name())
            .set_raw(deleted_at.clone(), engine.dialect().now())
            .where_eq(table.id_column(), id.clone());
        exec.execute(&update.build()?).await?;

        for rel in table.relations.has_many.values() {
            let target = engine.get(&rel.table)?;
            if !target.is_soft_delete() {
                continue;
            }

            let mut aliases = AliasGen::new();
            let mut stmt =
                SelectBuilder::new(target.schema(), target.table_name(), aliases.next_alias());
            for column in target.metadata.column_names() {
                stmt.push_column(column);
            }
            let fk = stmt.col(&rel.relation);
            stmt.push_where(Condition::eq(fk, id.clone()));
            let target_deleted_at = stmt.col(deleted_at);
            stmt.push_where(Condition::is_null(target_deleted_at));

            let children = exec.query(&stmt.build()?).await?;
            for child in children {
                let child = child.into_map();
                let Some(child_id) = child.get(target.id_column()).cloned() else {
                    continue;
                };
                state.record(target, Mode::Delete, &child);
                soft_delete(engine, target, &child_id, &mut *exec, &mut *state).await?;
            }
        }
        Ok(())
    })
}
