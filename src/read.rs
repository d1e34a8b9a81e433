//! Read pipeline: filters, policy, relation inclusion, pagination and
//! output shaping.

use crate::backend::{Dialect, Executor, QueryRow};
use crate::builder::{
    qualify, AggregateFunc, AliasGen, ComparisonOp, Condition, JsonShape, SelectBuilder,
    SortDirection,
};
use crate::context::{Context, Params};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::filter;
use crate::hooks::EagerShape;
use crate::policy::{apply_policy, Mode};
use crate::table::Table;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// An output row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    #[serde(flatten)]
    pub values: Map<String, Value>,
    #[serde(rename = "_url")]
    pub url: String,
    #[serde(rename = "_type")]
    pub type_name: String,
    #[serde(rename = "_links")]
    pub links: Map<String, Value>,
}

impl Row {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn into_value(self) -> Value {
        let mut object = self.values;
        object.insert("_url".to_string(), Value::String(self.url));
        object.insert("_type".to_string(), Value::String(self.type_name));
        object.insert("_links".to_string(), Value::Object(self.links));
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLinks {
    pub next: Option<String>,
    pub previous: Option<String>,
    pub count: String,
    pub ids: String,
}

/// One page of a collection read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Row>,
    pub has_more: bool,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// Cursor for the page after this one, in keyset mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub links: PageLinks,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    One(Row),
    Many(Page),
}

/// What an included column holds
#[derive(Clone, Copy)]
enum IncludeKind<'a> {
    HasOne(&'a Table),
    HasMany(&'a Table),
    Eager(EagerShape),
}

/// Encode sort-key values as an opaque cursor
pub fn encode_cursor(values: &[Value]) -> String {
    STANDARD.encode(Value::Array(values.to_vec()).to_string())
}

/// Decode a cursor produced by [`encode_cursor`]
pub fn decode_cursor(cursor: &str) -> Result<Vec<Value>> {
    let invalid = || EngineError::bad_request("cursor", "is invalid");
    let bytes = STANDARD.decode(cursor.trim()).map_err(|_| invalid())?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(values)) => Ok(values),
        _ => Err(invalid()),
    }
}

/// `(k1 > v1) OR (k1 = v1 AND k2 > v2) OR ...`, flipped per descending key.
/// NULL keys follow the dialect's ordering, so a NULL cursor value is
/// followed by every non-NULL value when NULLs come first and by nothing
/// when they come last.
pub fn keyset_condition(
    stmt: &SelectBuilder,
    dialect: Dialect,
    sort: &[(String, SortDirection)],
    values: &[Value],
) -> Condition {
    let mut branches = Vec::with_capacity(sort.len());
    for (i, (column, direction)) in sort.iter().enumerate() {
        let expr = stmt.col(column);
        let nulls_first = dialect.nulls_sort_first() == (*direction == SortDirection::Asc);
        let after = match (&values[i], nulls_first) {
            (Value::Null, true) => Condition::is_not_null(expr),
            (Value::Null, false) => continue,
            (value, nulls_first) => {
                let op = match direction {
                    SortDirection::Asc => ComparisonOp::Gt,
                    SortDirection::Desc => ComparisonOp::Lt,
                };
                let past = Condition::compare(expr.clone(), op, value.clone());
                if nulls_first {
                    past
                } else {
                    Condition::or(vec![past, Condition::is_null(expr)])
                }
            }
        };

        let mut parts: Vec<Condition> = sort[..i]
            .iter()
            .zip(values)
            .map(|((c, _), v)| Condition::eq(stmt.col(c), v.clone()))
            .collect();
        parts.push(after);
        branches.push(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::and(parts)
        });
    }
    Condition::or(branches)
}

/// Table defaults overlaid by the request
fn merge_params(table: &Table, params: &Params) -> Params {
    let mut merged = table.def.default_params.clone();
    for (key, value) in params {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub(crate) fn require_tenant(table: &Table, params: &Params) -> Result<()> {
    let Some(column) = table.tenant_column() else {
        return Ok(());
    };
    if is_blank(params.get(column)) {
        return Err(EngineError::bad_request(column, "is required"));
    }
    Ok(())
}

pub(crate) fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn coerce_id(table: &Table, id: &Value) -> Result<Value> {
    match table.metadata.id_type().coerce(id) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(EngineError::bad_request(table.id_column(), "is invalid")),
    }
}

/// List-valued param given as an array or a comma-separated string
fn list_param(params: &Params, key: &str) -> Result<Vec<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(String::from)
                    .ok_or_else(|| EngineError::bad_request(key, "must contain strings"))
            })
            .collect(),
        Some(_) => Err(EngineError::bad_request(key, "is invalid")),
    }
}

fn usize_param(params: &Params, key: &str) -> Result<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| EngineError::bad_request(key, "must be an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| EngineError::bad_request(key, "must be an integer")),
        Some(_) => Err(EngineError::bad_request(key, "must be an integer")),
    }
}

fn parse_limit(params: &Params, default: usize, max: usize) -> Result<usize> {
    Ok(match usize_param(params, "limit")? {
        Some(limit) => limit.clamp(0, max as i64) as usize,
        None => default.min(max),
    })
}

fn parse_page(params: &Params) -> Result<Option<usize>> {
    match usize_param(params, "page")? {
        Some(page) if page < 0 => Err(EngineError::bad_request("page", "must not be negative")),
        Some(page) => usize::try_from(page)
            .map(Some)
            .map_err(|_| EngineError::bad_request("page", "is too large")),
        None => Ok(None),
    }
}

/// Row offset of a page; a page past `usize` rows is rejected
fn page_offset(page: usize, limit: usize) -> Result<usize> {
    page.checked_mul(limit)
        .ok_or_else(|| EngineError::bad_request("page", "is too large"))
}

/// Caller sort keys with the id appended as the final tie-breaker
fn parse_sort(table: &Table, params: &Params) -> Result<Vec<(String, SortDirection)>> {
    let mut sort = Vec::new();
    for key in list_param(params, "sort")? {
        let (column, direction) = match key.strip_prefix('-') {
            Some(column) => (column, SortDirection::Desc),
            None => (key.as_str(), SortDirection::Asc),
        };
        if !table.metadata.has_column(column) {
            return Err(EngineError::bad_request("sort", "is invalid"));
        }
        if !sort.iter().any(|(c, _)| c == column) {
            sort.push((column.to_string(), direction));
        }
    }
    let id = table.id_column();
    if !sort.iter().any(|(c, _)| c == id) {
        sort.push((id.to_string(), SortDirection::Asc));
    }
    Ok(sort)
}

/// SELECT of every column with filters and policy applied
async fn base_select(
    engine: &Engine,
    table: &Table,
    aliases: &mut AliasGen,
    ctx: &Context,
    params: &Params,
) -> Result<SelectBuilder> {
    let mut stmt = SelectBuilder::new(table.schema(), table.table_name(), aliases.next_alias());
    for column in table.metadata.column_names() {
        stmt.push_column(column);
    }
    filter::compile(engine, table, &mut stmt, ctx, params).await?;
    apply_policy(table.policy(), &mut stmt, ctx, Mode::Read).await?;
    Ok(stmt)
}

/// Sub-select over a related table, correlated by `link`, with the target's
/// own filters and policy
async fn relation_select(
    engine: &Engine,
    owner: &Table,
    target: &Table,
    alias: String,
    link: Condition,
    ctx: &Context,
    params: &Params,
) -> Result<SelectBuilder> {
    let mut sub = SelectBuilder::new(target.schema(), target.table_name(), alias);
    for column in target.metadata.column_names() {
        sub.push_column(column);
    }
    sub.push_where(link);

    let mut sub_params = Params::new();
    if let Some(tenant) = owner.shares_tenant(target) {
        if let Some(value) = params.get(tenant) {
            sub_params.insert(tenant.to_string(), value.clone());
        }
    }
    filter::compile(engine, target, &mut sub, ctx, &sub_params).await?;
    apply_policy(target.policy(), &mut sub, ctx, Mode::Read).await?;
    Ok(sub)
}

/// Add one JSON column per requested relation or eager getter
async fn add_includes<'e>(
    engine: &'e Engine,
    table: &'e Table,
    stmt: &mut SelectBuilder,
    aliases: &mut AliasGen,
    ctx: &Context,
    params: &Params,
) -> Result<Vec<(String, IncludeKind<'e>)>> {
    let dialect = engine.dialect();
    let mut includes = Vec::new();

    for name in list_param(params, "include")? {
        if includes.iter().any(|(n, _)| *n == name) || table.metadata.has_column(&name) {
            continue;
        }

        let (sub, shape, kind) = if let Some(rel) = table.relations.has_one.get(&name) {
            let target = engine.get(&rel.table)?;
            let alias = aliases.next_alias();
            let link = Condition::raw(format!(
                "{} = {}",
                qualify(&alias, target.id_column()),
                stmt.col(&rel.relation)
            ));
            let sub = relation_select(engine, table, target, alias, link, ctx, params).await?;
            (sub, JsonShape::Object, IncludeKind::HasOne(target))
        } else if let Some(rel) = table.relations.has_many.get(&name) {
            let target = engine.get(&rel.table)?;
            let alias = aliases.next_alias();
            let link = Condition::raw(format!(
                "{} = {}",
                qualify(&alias, &rel.relation),
                stmt.col(table.id_column())
            ));
            let sub = relation_select(engine, table, target, alias, link, ctx, params).await?;
            let order = sub.col(target.id_column());
            let sub = sub
                .order_by(order, SortDirection::Asc)
                .limit(engine.config().has_many_limit);
            (sub, JsonShape::Array, IncludeKind::HasMany(target))
        } else if let Some(getter) = table.def.eager_getters.get(&name) {
            let alias = aliases.next_alias();
            let (sub, shape) = getter.query(stmt.alias(), &alias, ctx)?;
            let json_shape = match shape {
                EagerShape::Pluck => JsonShape::Scalar,
                EagerShape::First => JsonShape::Object,
                EagerShape::Many => JsonShape::Array,
            };
            (sub, json_shape, IncludeKind::Eager(shape))
        } else {
            continue;
        };

        let wrapper = aliases.next_alias();
        stmt.push_select(sub.to_json_subquery(dialect, shape, &wrapper)?, name.clone());
        includes.push((name, kind));
    }

    Ok(includes)
}

fn id_segment(id: &Value) -> String {
    match id {
        Value::String(s) => urlencoding::encode(s).into_owned(),
        other => other.to_string(),
    }
}

fn row_url(engine: &Engine, table: &Table, id: &Value) -> String {
    format!("{}/{}/{}", engine.config().base(), table.path(), id_segment(id))
}

fn collection_url(engine: &Engine, table: &Table, suffix: Option<&str>, query: &[(String, String)]) -> String {
    let mut url = format!("{}/{}", engine.config().base(), table.path());
    if let Some(suffix) = suffix {
        url.push('/');
        url.push_str(suffix);
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(&encode_query(query));
    }
    url
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten params into query pairs. Arrays repeat their key.
fn query_pairs(params: &Params, skip: &[&str]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        if skip.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Array(items) if key != "and" && key != "or" => {
                pairs.extend(items.iter().map(|item| (key.clone(), param_text(item))));
            }
            other => pairs.push((key.clone(), param_text(other))),
        }
    }
    pairs
}

fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Add `_url`, `_type` and `_links`, drop hidden columns
pub(crate) fn shape(engine: &Engine, table: &Table, mut values: Map<String, Value>) -> Row {
    let id = values.get(table.id_column()).cloned().unwrap_or(Value::Null);
    let url = row_url(engine, table, &id);
    let mut links = Map::new();

    for (name, rel) in &table.relations.has_one {
        let Ok(target) = engine.get(&rel.table) else {
            continue;
        };
        let link = match values.get(&rel.relation) {
            Some(fk) if !fk.is_null() => Value::String(row_url(engine, target, fk)),
            _ => Value::Null,
        };
        links.insert(name.clone(), link);
    }

    for (name, rel) in &table.relations.has_many {
        let Ok(target) = engine.get(&rel.table) else {
            continue;
        };
        let mut query = vec![(rel.relation.clone(), param_text(&id))];
        if let Some(tenant) = table.shares_tenant(target) {
            if let Some(value) = values.get(tenant).filter(|v| !v.is_null()) {
                query.push((tenant.to_string(), param_text(value)));
            }
        }
        links.insert(
            name.clone(),
            Value::String(collection_url(engine, target, None, &query)),
        );
    }

    for name in table.def.getters.keys().chain(table.def.eager_getters.keys()) {
        links.insert(name.clone(), Value::String(format!("{}/{}", url, name)));
    }

    table.strip_hidden(&mut values);

    Row {
        values,
        url,
        type_name: table.type_name().to_string(),
        links,
    }
}

/// Shape a row that carries included JSON columns
fn shape_with_includes(
    engine: &Engine,
    table: &Table,
    mut values: Map<String, Value>,
    includes: &[(String, IncludeKind<'_>)],
) -> Row {
    let mut included = Vec::with_capacity(includes.len());
    for (name, kind) in includes {
        let Some(raw) = values.remove(name) else {
            continue;
        };
        let parsed = match (raw, kind) {
            (raw, IncludeKind::Eager(EagerShape::Pluck)) => raw,
            (Value::String(text), _) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(_) => Value::String(text),
            },
            (raw, _) => raw,
        };
        let shaped = match (parsed, kind) {
            (Value::Object(object), IncludeKind::HasOne(target)) => {
                shape(engine, target, object).into_value()
            }
            (Value::Array(items), IncludeKind::HasMany(target)) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(object) => shape(engine, target, object).into_value(),
                        other => other,
                    })
                    .collect(),
            ),
            (other, _) => other,
        };
        included.push((name.clone(), shaped));
    }

    let mut row = shape(engine, table, values);
    for (name, value) in included {
        row.values.insert(name, value);
    }
    row
}

/// Single row when `params` carries a scalar id, a page otherwise
pub async fn read(engine: &Engine, table: &Table, params: &Params, ctx: &Context) -> Result<ReadResult> {
    match params.get(table.id_column()) {
        Some(id) if !id.is_null() && !id.is_array() && !id.is_object() => {
            let id = id.clone();
            read_one(engine, table, &id, params, ctx).await.map(ReadResult::One)
        }
        _ => read_many(engine, table, params, ctx).await.map(ReadResult::Many),
    }
}

/// One row by id; `NotFound` when it does not exist or is not visible
pub async fn read_one(
    engine: &Engine,
    table: &Table,
    id: &Value,
    params: &Params,
    ctx: &Context,
) -> Result<Row> {
    let mut params = merge_params(table, params);
    params.insert(table.id_column().to_string(), id.clone());
    require_tenant(table, &params)?;

    let mut aliases = AliasGen::new();
    let mut stmt = base_select(engine, table, &mut aliases, ctx, &params).await?;
    let includes = add_includes(engine, table, &mut stmt, &mut aliases, ctx, &params).await?;
    let sql = stmt.limit(1).build()?;

    let mut conn = engine.backend().acquire().await?;
    let row = conn.query(&sql).await?.into_iter().next().ok_or(EngineError::NotFound)?;
    Ok(shape_with_includes(engine, table, row.into_map(), &includes))
}

/// A page of rows
pub async fn read_many(engine: &Engine, table: &Table, params: &Params, ctx: &Context) -> Result<Page> {
    let params = merge_params(table, params);
    require_tenant(table, &params)?;

    let config = engine.config();
    let sort = parse_sort(table, &params)?;
    let limit = parse_limit(&params, config.default_limit, config.max_limit)?;
    let page = parse_page(&params)?;
    let cursor = match params.get("cursor") {
        None | Some(Value::Null) => None,
        Some(Value::String(c)) if c.is_empty() => None,
        Some(Value::String(c)) => Some(decode_cursor(c)?),
        Some(_) => return Err(EngineError::bad_request("cursor", "is invalid")),
    };
    if cursor.is_some() && page.is_some() {
        return Err(EngineError::bad_request("cursor", "cannot be combined with page"));
    }

    let mut aliases = AliasGen::new();
    let mut stmt = base_select(engine, table, &mut aliases, ctx, &params).await?;
    let includes = add_includes(engine, table, &mut stmt, &mut aliases, ctx, &params).await?;

    if let Some(values) = &cursor {
        if values.len() != sort.len() {
            return Err(EngineError::bad_request("cursor", "is invalid"));
        }
        let condition = keyset_condition(&stmt, engine.dialect(), &sort, values);
        stmt.push_where(condition);
    }
    for (column, direction) in &sort {
        let column = stmt.col(column);
        stmt = stmt.order_by(column, *direction);
    }
    stmt = stmt.limit(limit);
    if let Some(page) = page {
        stmt = stmt.offset(page_offset(page, limit)?);
    }

    let sql = stmt.build()?;
    let mut conn = engine.backend().acquire().await?;
    let rows = conn.query(&sql).await?;

    let has_more = limit > 0 && rows.len() >= limit;
    let next_cursor = match rows.last() {
        Some(last) if has_more && page.is_none() => {
            let values: Vec<Value> = sort
                .iter()
                .map(|(column, _)| last.value(column).cloned().unwrap_or(Value::Null))
                .collect();
            Some(encode_cursor(&values))
        }
        _ => None,
    };

    debug!(table = table.name(), rows = rows.len(), has_more, "read page");

    let items = rows
        .into_iter()
        .map(|row| shape_with_includes(engine, table, row.into_map(), &includes))
        .collect();

    let links = page_links(engine, table, &params, limit, page, next_cursor.as_deref(), has_more);

    Ok(Page {
        items,
        has_more,
        limit,
        page,
        next_cursor,
        links,
    })
}

fn page_links(
    engine: &Engine,
    table: &Table,
    params: &Params,
    limit: usize,
    page: Option<usize>,
    next_cursor: Option<&str>,
    has_more: bool,
) -> PageLinks {
    let mut base = query_pairs(params, &["page", "cursor", "limit"]);
    base.push(("limit".to_string(), limit.to_string()));

    let with = |key: &str, value: String| {
        let mut query = base.clone();
        query.push((key.to_string(), value));
        collection_url(engine, table, None, &query)
    };

    let next = match (page, next_cursor) {
        (Some(page), _) if has_more => Some(with("page", (page + 1).to_string())),
        (None, Some(cursor)) => Some(with("cursor", cursor.to_string())),
        _ => None,
    };
    let previous = match page {
        Some(page) if page > 0 => Some(with("page", (page - 1).to_string())),
        _ => None,
    };

    let filters = query_pairs(params, &["page", "cursor", "limit", "include", "sort"]);
    PageLinks {
        next,
        previous,
        count: collection_url(engine, table, Some("count"), &filters),
        ids: collection_url(engine, table, Some("ids"), &filters),
    }
}

/// Number of distinct matching rows
pub async fn count(engine: &Engine, table: &Table, params: &Params, ctx: &Context) -> Result<u64> {
    let params = merge_params(table, params);
    require_tenant(table, &params)?;

    let mut aliases = AliasGen::new();
    let stmt = base_select(engine, table, &mut aliases, ctx, &params).await?;
    let id = stmt.col(table.id_column());
    let stmt = stmt
        .clear_columns()
        .clear_order()
        .aggregate(AggregateFunc::CountDistinct, &id, "count");

    let mut conn = engine.backend().acquire().await?;
    let rows = conn.query(&stmt.build()?).await?;
    let count = rows.first().and_then(|row| row.get_i64("count")).unwrap_or(0);
    Ok(count.max(0) as u64)
}

/// Ids of matching rows in sort order
pub async fn ids(engine: &Engine, table: &Table, params: &Params, ctx: &Context) -> Result<Vec<Value>> {
    let params = merge_params(table, params);
    require_tenant(table, &params)?;

    let max_ids = engine.config().max_ids;
    let sort = parse_sort(table, &params)?;
    let limit = parse_limit(&params, max_ids, max_ids)?;
    let page = parse_page(&params)?;

    let mut aliases = AliasGen::new();
    let mut stmt = base_select(engine, table, &mut aliases, ctx, &params)
        .await?
        .clear_columns();
    stmt.push_column(table.id_column());
    for (column, direction) in &sort {
        let column = stmt.col(column);
        stmt = stmt.order_by(column, *direction);
    }
    stmt = stmt.limit(limit);
    if let Some(page) = page {
        stmt = stmt.offset(page_offset(page, limit)?);
    }

    let mut conn = engine.backend().acquire().await?;
    let rows = conn.query(&stmt.build()?).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.value(table.id_column()).cloned())
        .collect())
}

/// Value of a named getter for one visible row
pub async fn getter(
    engine: &Engine,
    table: &Table,
    id: &Value,
    name: &str,
    params: &Params,
    ctx: &Context,
) -> Result<Value> {
    let getter = table.def.getters.get(name).ok_or(EngineError::NotFound)?;
    let params = merge_params(table, params);
    require_tenant(table, &params)?;
    let id = coerce_id(table, id)?;

    let tenant = table.tenant_column().and_then(|column| params.get(column));
    let mut conn = engine.backend().acquire().await?;
    let row = fetch_row(engine, table, conn.as_mut(), ctx, &id, Mode::Read, tenant)
        .await?
        .ok_or(EngineError::NotFound)?;
    getter.get(conn.as_mut(), &row, ctx).await
}

/// Raw stored row by id, visible under the policy for `mode`. Soft-deleted
/// rows are never returned.
pub(crate) async fn fetch_row(
    engine: &Engine,
    table: &Table,
    exec: &mut dyn Executor,
    ctx: &Context,
    id: &Value,
    mode: Mode,
    tenant: Option<&Value>,
) -> Result<Option<Map<String, Value>>> {
    let mut aliases = AliasGen::new();
    let mut stmt = SelectBuilder::new(table.schema(), table.table_name(), aliases.next_alias());
    for column in table.metadata.column_names() {
        stmt.push_column(column);
    }

    let id_column = stmt.col(table.id_column());
    stmt.push_where(Condition::eq(id_column, id.clone()));
    if table.is_soft_delete() {
        let deleted_at = stmt.col(&engine.config().deleted_at_column);
        stmt.push_where(Condition::is_null(deleted_at));
    }
    if let (Some(column), Some(value)) = (table.tenant_column(), tenant) {
        let column = stmt.col(column);
        stmt.push_where(Condition::eq(column, value.clone()));
    }
    apply_policy(table.policy(), &mut stmt, ctx, mode).await?;

    let rows = exec.query(&stmt.limit(1).build()?).await?;
    Ok(rows.into_iter().next().map(QueryRow::into_map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cursor_codec() {
        let values = vec![json!("b"), json!(7)];
        let cursor = encode_cursor(&values);
        assert_eq!(cursor, "WyJiIiw3XQ==");
        assert_eq!(decode_cursor(&cursor).unwrap(), values);

        assert!(decode_cursor("not base64!").is_err());
        let object = STANDARD.encode("{\"a\":1}");
        assert!(decode_cursor(&object).is_err());
    }

    #[test]
    fn test_keyset_condition() {
        let stmt = SelectBuilder::new("main", "items", "t0");
        let sort = vec![
            ("name".to_string(), SortDirection::Desc),
            ("id".to_string(), SortDirection::Asc),
        ];
        let condition = keyset_condition(&stmt, Dialect::Sqlite, &sort, &[json!("m"), json!(4)]);
        assert_eq!(
            condition.to_sql(),
            "((\"t0\".\"name\" < 'm' OR \"t0\".\"name\" IS NULL) \
             OR (\"t0\".\"name\" = 'm' AND \"t0\".\"id\" > 4))"
        );
    }

    #[test]
    fn test_keyset_condition_null_cursor() {
        let stmt = SelectBuilder::new("main", "tags", "t0");
        let sort = vec![
            ("color".to_string(), SortDirection::Asc),
            ("id".to_string(), SortDirection::Asc),
        ];

        // NULLs first: every colored row still follows
        let condition = keyset_condition(&stmt, Dialect::Sqlite, &sort, &[Value::Null, json!(3)]);
        assert_eq!(
            condition.to_sql(),
            "(\"t0\".\"color\" IS NOT NULL OR (\"t0\".\"color\" IS NULL AND \"t0\".\"id\" > 3))"
        );

        // NULLs last: only later NULL rows follow
        let condition = keyset_condition(&stmt, Dialect::Postgres, &sort, &[Value::Null, json!(3)]);
        assert_eq!(
            condition.to_sql(),
            "((\"t0\".\"color\" IS NULL AND \"t0\".\"id\" > 3))"
        );

        let condition = keyset_condition(&stmt, Dialect::Postgres, &sort, &[json!("red"), json!(2)]);
        assert_eq!(
            condition.to_sql(),
            "((\"t0\".\"color\" > 'red' OR \"t0\".\"color\" IS NULL) \
             OR (\"t0\".\"color\" = 'red' AND \"t0\".\"id\" > 2))"
        );
    }

    #[test]
    fn test_page_offset_overflow() {
        assert_eq!(page_offset(3, 50).unwrap(), 150);
        let err = page_offset(usize::MAX / 2, 250).unwrap_err();
        assert_eq!(err.validation_errors().and_then(|e| e.message("page")), Some("is too large"));
    }

    #[test]
    fn test_query_pairs() {
        let params: Params = json!({
            "status": ["open", "closed"],
            "page": 2,
            "or": [{"a": 1}],
            "q": "a b&c"
        })
        .as_object()
        .cloned()
        .unwrap();

        let pairs = query_pairs(&params, &["page"]);
        assert_eq!(
            encode_query(&pairs),
            "status=open&status=closed&or=%5B%7B%22a%22%3A1%7D%5D&q=a%20b%26c"
        );
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&json!(""))));
        assert!(is_blank(Some(&json!([]))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!("t1"))));
    }

    #[test]
    fn test_row_into_value() {
        let mut values = Map::new();
        values.insert("id".to_string(), json!(1));
        let row = Row {
            values,
            url: "/items/1".to_string(),
            type_name: "items".to_string(),
            links: Map::new(),
        };
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            row.clone().into_value()
        );
        assert_eq!(
            row.into_value(),
            json!({"id": 1, "_url": "/items/1", "_type": "items", "_links": {}})
        );
    }
}
