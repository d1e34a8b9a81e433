//! Nested write graphs.
//!
//! A graph is parsed from caller JSON into a tree of [`GraphNode`]s using
//! the relation maps of the tables it touches. Children of a node are keyed
//! by relation name; everything else on the node is input for its own row.

use crate::backend::Executor;
use crate::builder::{AliasGen, Condition, SelectBuilder};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{EngineError, Result, ValidationErrors};
use crate::policy::{apply_policy, Mode};
use crate::read::is_blank;
use crate::table::Table;
use crate::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

/// Input key marking a node for deletion
pub const DELETE_MARKER: &str = "_delete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Registered name of the node's table
    pub table: String,
    pub kind: NodeKind,
    /// Set for updates and deletes, and for inserts once committed
    pub id: Option<Value>,
    /// Column values and setter inputs
    pub values: Map<String, Value>,
    pub has_one: Vec<(String, GraphNode)>,
    pub has_many: Vec<(String, Vec<GraphNode>)>,
}

impl GraphNode {
    /// Parse caller JSON for `table`
    pub fn parse(engine: &Engine, table: &Table, input: &Value) -> Result<GraphNode> {
        let Value::Object(object) = input else {
            return Err(EngineError::bad_request("_root", "must be an object"));
        };

        let id_column = table.id_column();
        let id = match object.get(id_column) {
            None | Some(Value::Null) => None,
            Some(raw) => match table.metadata.id_type().coerce(raw) {
                Some(id) if !id.is_null() => Some(id),
                _ => return Err(EngineError::bad_request(id_column, "is invalid")),
            },
        };

        let delete = matches!(object.get(DELETE_MARKER), Some(Value::Bool(true)));
        let kind = match (&id, delete) {
            (Some(_), true) => NodeKind::Delete,
            (None, true) => return Err(EngineError::bad_request(id_column, "is required")),
            (Some(_), false) => NodeKind::Update,
            (None, false) => NodeKind::Insert,
        };

        let mut node = GraphNode {
            table: table.name().to_string(),
            kind,
            id,
            values: Map::new(),
            has_one: Vec::new(),
            has_many: Vec::new(),
        };

        for (key, value) in object {
            if key == id_column || key == DELETE_MARKER {
                continue;
            }

            if let Some(rel) = table.relations.has_one.get(key) {
                if kind == NodeKind::Delete {
                    continue;
                }
                match value {
                    Value::Null => {}
                    Value::Object(_) => {
                        let target = engine.get(&rel.table)?;
                        let child = GraphNode::parse(engine, target, value)
                            .map_err(|e| nest_error(key, None, e))?;
                        node.has_one.push((key.clone(), child));
                    }
                    _ => return Err(EngineError::bad_request(key, "must be an object")),
                }
                continue;
            }

            if let Some(rel) = table.relations.has_many.get(key) {
                if kind == NodeKind::Delete {
                    continue;
                }
                let Value::Array(items) = value else {
                    return Err(EngineError::bad_request(key, "must be an array"));
                };
                let target = engine.get(&rel.table)?;
                let children = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        GraphNode::parse(engine, target, item).map_err(|e| nest_error(key, Some(i), e))
                    })
                    .collect::<Result<Vec<_>>>()?;
                node.has_many.push((key.clone(), children));
                continue;
            }

            node.values.insert(key.clone(), value.clone());
        }

        if kind == NodeKind::Delete {
            // only the tenant id matters for a delete
            node.values.retain(|key, _| Some(key.as_str()) == table.tenant_column());
        }

        Ok(node)
    }
}

/// Charge every node of the graph against `budget`, in the order the
/// validator visits them. Runs before any statement, so an oversized graph
/// fails with `Complexity` without touching storage.
pub(crate) fn charge_budget(engine: &Engine, table: &Table, node: &GraphNode, budget: &mut i64) -> Result<()> {
    if *budget <= 0 {
        return Err(EngineError::Complexity);
    }
    *budget -= table.def.weight;

    for (name, child) in &node.has_one {
        let target = engine.get(&table.relation(name)?.table)?;
        charge_budget(engine, target, child, budget)?;
    }
    for (name, children) in &node.has_many {
        let target = engine.get(&table.relation(name)?.table)?;
        for child in children {
            charge_budget(engine, target, child, budget)?;
        }
    }
    Ok(())
}

/// Re-key a child's parse error under its relation
fn nest_error(relation: &str, index: Option<usize>, error: EngineError) -> EngineError {
    match error {
        EngineError::BadRequest(inner) => {
            let mut errors = ValidationErrors::new();
            match index {
                Some(i) => errors.item(relation, i, inner),
                None => errors.nest(relation, inner),
            }
            EngineError::BadRequest(errors)
        }
        other => other,
    }
}

/// Copy the parent's tenant id into children of tables scoped by the same
/// column, and collect every node still missing one
pub(crate) fn check_tenants(engine: &Engine, table: &Table, node: &mut GraphNode) -> Result<ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let tenant = table
        .tenant_column()
        .and_then(|column| node.values.get(column).map(|v| (column, v.clone())));
    if let Some(column) = table.tenant_column() {
        if is_blank(node.values.get(column)) {
            errors.add(column, "is required");
        }
    }

    for (name, child) in node.has_one.iter_mut() {
        let target = engine.get(&table.relation(name)?.table)?;
        forward_tenant(table, target, tenant.as_ref(), child);
        errors.nest(name.clone(), check_tenants(engine, target, child)?);
    }
    for (name, children) in node.has_many.iter_mut() {
        let target = engine.get(&table.relation(name)?.table)?;
        for (i, child) in children.iter_mut().enumerate() {
            forward_tenant(table, target, tenant.as_ref(), child);
            errors.item(name.clone(), i, check_tenants(engine, target, child)?);
        }
    }
    Ok(errors)
}

fn forward_tenant(parent: &Table, child_table: &Table, tenant: Option<&(&str, Value)>, child: &mut GraphNode) {
    if parent.shares_tenant(child_table).is_none() {
        return;
    }
    if let Some((column, value)) = tenant {
        if is_blank(child.values.get(*column)) {
            child.values.insert(column.to_string(), value.clone());
        }
    }
}

/// Turn insert nodes whose upsert key matches a stored row into updates of
/// that row. Matching only sees rows visible under the update policy.
pub(crate) fn upsert_fixup<'a>(
    engine: &'a Engine,
    table: &'a Table,
    node: &'a mut GraphNode,
    exec: &'a mut dyn Executor,
    ctx: &'a Context,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if node.kind == NodeKind::Insert {
            if let Some(id) = find_existing(engine, table, node, exec, ctx).await? {
                debug!(table = table.name(), id = %id, "insert resolved to update by upsert key");
                node.kind = NodeKind::Update;
                node.id = Some(id);
            }
        }

        for (name, child) in node.has_one.iter_mut() {
            let target = engine.get(&table.relation(name)?.table)?;
            upsert_fixup(engine, target, child, &mut *exec, ctx).await?;
        }
        for (name, children) in node.has_many.iter_mut() {
            let target = engine.get(&table.relation(name)?.table)?;
            for child in children.iter_mut() {
                upsert_fixup(engine, target, child, &mut *exec, ctx).await?;
            }
        }
        Ok(())
    })
}

async fn find_existing(
    engine: &Engine,
    table: &Table,
    node: &GraphNode,
    exec: &mut dyn Executor,
    ctx: &Context,
) -> Result<Option<Value>> {
    let Some(key) = &table.def.upsert_key else {
        return Ok(None);
    };

    let mut aliases = AliasGen::new();
    let mut stmt = SelectBuilder::new(table.schema(), table.table_name(), aliases.next_alias());
    stmt.push_column(table.id_column());

    for column in key {
        let Some(meta) = table.metadata.column(column) else {
            return Ok(None);
        };
        let value = match node.values.get(column).and_then(|v| meta.sql_type.coerce(v)) {
            Some(value) if !value.is_null() => value,
            _ => return Ok(None),
        };
        let column = stmt.col(column);
        stmt.push_where(Condition::eq(column, value));
    }
    if let Some(column) = table.tenant_column() {
        if let Some(value) = node.values.get(column) {
            let column = stmt.col(column);
            stmt.push_where(Condition::eq(column, value.clone()));
        }
    }
    if table.is_soft_delete() {
        let deleted_at = stmt.col(&engine.config().deleted_at_column);
        stmt.push_where(Condition::is_null(deleted_at));
    }
    apply_policy(table.policy(), &mut stmt, ctx, Mode::Update).await?;

    let rows = exec.query(&stmt.limit(1).build()?).await?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|row| row.value(table.id_column()).cloned()))
}
