//! SQL statement builders.
//!
//! Every statement names its source table with an explicit alias and selects
//! explicitly named columns, so sub-selects can be nested inside an outer
//! statement (including one over the same table) without ambiguity.

use crate::backend::Dialect;
use crate::error::{EngineError, Result};
use serde_json::Value;
use std::fmt;

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "<>"),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::In => write!(f, "IN"),
            ComparisonOp::NotIn => write!(f, "NOT IN"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
        }
    }
}

/// Aggregate function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateFunc {
    CountDistinct,
}

impl AggregateFunc {
    pub fn to_sql(&self, column: &str) -> String {
        match self {
            AggregateFunc::CountDistinct => format!("COUNT(DISTINCT {})", column),
        }
    }
}

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"alias"."column"`
pub fn qualify(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

/// `"schema"."table"`
pub fn table_ref(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Hands out `t0`, `t1`, ... for one statement tree.
///
/// Each top-level query build owns its own generator, so a table joined to
/// itself through a relation still gets a distinct alias per inclusion.
#[derive(Debug, Default)]
pub struct AliasGen {
    next: usize,
}

impl AliasGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_alias(&mut self) -> String {
        let alias = format!("t{}", self.next);
        self.next += 1;
        alias
    }
}

/// WHERE condition
#[derive(Debug, Clone)]
pub enum Condition {
    Simple {
        column: String,
        op: ComparisonOp,
        value: Option<Value>,
    },
    Compound {
        conditions: Vec<Condition>,
        op: LogicalOp,
    },
    Not(Box<Condition>),
    Raw(String),
}

impl Condition {
    pub fn compare(column: impl Into<String>, op: ComparisonOp, value: Value) -> Self {
        let column = column.into();
        match (&op, &value) {
            (ComparisonOp::Eq, Value::Null) => Condition::is_null(column),
            (ComparisonOp::Ne, Value::Null) => Condition::is_not_null(column),
            _ => Condition::Simple {
                column,
                op,
                value: Some(value),
            },
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Condition::compare(column, ComparisonOp::Eq, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::IsNull,
            value: None,
        }
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::IsNotNull,
            value: None,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Condition::Raw(sql.into())
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            conditions,
            op: LogicalOp::And,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            conditions,
            op: LogicalOp::Or,
        }
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    pub fn to_sql(&self) -> String {
        match self {
            Condition::Simple { column, op, value } => {
                if matches!(op, ComparisonOp::IsNull | ComparisonOp::IsNotNull) {
                    format!("{} {}", column, op)
                } else if matches!(op, ComparisonOp::In | ComparisonOp::NotIn) {
                    match value {
                        Some(Value::Array(arr)) if !arr.is_empty() => {
                            let values = arr
                                .iter()
                                .map(format_value)
                                .collect::<Vec<_>>()
                                .join(", ");
                            format!("{} {} ({})", column, op, values)
                        }
                        // IN () is not valid SQL; an empty set matches nothing
                        _ if *op == ComparisonOp::In => "1 = 0".to_string(),
                        _ => "1 = 1".to_string(),
                    }
                } else {
                    let val = value
                        .as_ref()
                        .map(format_value)
                        .unwrap_or_else(|| "NULL".to_string());
                    format!("{} {} {}", column, op, val)
                }
            }
            Condition::Compound { conditions, op } => {
                if conditions.is_empty() {
                    match op {
                        LogicalOp::And => "1 = 1".to_string(),
                        LogicalOp::Or => "1 = 0".to_string(),
                    }
                } else {
                    let parts = conditions
                        .iter()
                        .map(|c| c.to_sql())
                        .collect::<Vec<_>>()
                        .join(&format!(" {} ", op));
                    format!("({})", parts)
                }
            }
            Condition::Not(inner) => format!("NOT ({})", inner.to_sql()),
            Condition::Raw(sql) => sql.clone(),
        }
    }
}

/// Join clause
#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub on_condition: Condition,
}

impl Join {
    pub fn to_sql(&self) -> String {
        format!("{} {} ON {}", self.join_type, self.table, self.on_condition.to_sql())
    }
}

/// ORDER BY clause
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn to_sql(&self) -> String {
        format!("{} {}", self.column, self.direction)
    }
}

/// One expression in a select list
#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: String,
    pub name: Option<String>,
}

impl SelectItem {
    /// The column name this item produces in the result set
    pub fn output_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self
                .expr
                .rsplit('.')
                .next()
                .unwrap_or(&self.expr)
                .trim_matches('"')
                .to_string(),
        }
    }

    fn to_sql(&self) -> String {
        match &self.name {
            Some(name) => format!("{} AS {}", self.expr, quote_ident(name)),
            None => self.expr.clone(),
        }
    }
}

/// How a sub-select is folded into a single JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    /// First column of the first row
    Scalar,
    /// First row as an object
    Object,
    /// All rows as an array of objects
    Array,
}

/// SELECT query builder
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    alias: String,
    columns: Vec<SelectItem>,
    joins: Vec<Join>,
    where_clause: Option<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SelectBuilder {
    /// Create a SELECT over `"schema"."table" AS "alias"`
    pub fn new(schema: &str, table: &str, alias: impl Into<String>) -> Self {
        Self {
            table: table_ref(schema, table),
            alias: alias.into(),
            columns: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Qualified reference to a column of this statement's table
    pub fn col(&self, column: &str) -> String {
        qualify(&self.alias, column)
    }

    /// Select a column of the source table under its own name
    pub fn column(mut self, column: &str) -> Self {
        self.push_column(column);
        self
    }

    pub fn push_column(&mut self, column: &str) {
        let expr = self.col(column);
        self.columns.push(SelectItem {
            expr,
            name: Some(column.to_string()),
        });
    }

    /// Select an arbitrary expression under a name
    pub fn select_as(mut self, expr: impl Into<String>, name: impl Into<String>) -> Self {
        self.push_select(expr, name);
        self
    }

    pub fn push_select(&mut self, expr: impl Into<String>, name: impl Into<String>) {
        self.columns.push(SelectItem {
            expr: expr.into(),
            name: Some(name.into()),
        });
    }

    pub fn columns(&self) -> &[SelectItem] {
        &self.columns
    }

    /// Drop the select list, keeping filters
    pub fn clear_columns(mut self) -> Self {
        self.columns.clear();
        self
    }

    /// Add an aggregate function
    pub fn aggregate(mut self, func: AggregateFunc, column: &str, alias: &str) -> Self {
        self.columns.push(SelectItem {
            expr: func.to_sql(column),
            name: Some(alias.to_string()),
        });
        self
    }

    pub fn where_condition(&self) -> Option<&Condition> {
        self.where_clause.as_ref()
    }

    /// Add an AND condition to existing WHERE
    pub fn and_where(mut self, condition: Condition) -> Self {
        self.push_where(condition);
        self
    }

    pub fn push_where(&mut self, condition: Condition) {
        self.where_clause = Some(match self.where_clause.take() {
            Some(Condition::Compound {
                mut conditions,
                op: LogicalOp::And,
            }) => {
                conditions.push(condition);
                Condition::and(conditions)
            }
            Some(existing) => Condition::and(vec![existing, condition]),
            None => condition,
        });
    }

    /// Add a simple WHERE condition (column = value) on this statement's table
    pub fn where_eq(self, column: &str, value: Value) -> Self {
        let column = self.col(column);
        self.and_where(Condition::eq(column, value))
    }

    /// Add a JOIN clause
    pub fn join(mut self, join_type: JoinType, table: impl Into<String>, on: Condition) -> Self {
        self.push_join(join_type, table, on);
        self
    }

    pub fn push_join(&mut self, join_type: JoinType, table: impl Into<String>, on: Condition) {
        self.joins.push(Join {
            join_type,
            table: table.into(),
            on_condition: on,
        });
    }

    /// Add ORDER BY
    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn clear_order(mut self) -> Self {
        self.order_by.clear();
        self
    }

    /// Set LIMIT
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> Result<String> {
        if self.columns.is_empty() {
            return Err(EngineError::Query(format!(
                "SELECT from {} has no columns",
                self.table
            )));
        }

        let mut sql = String::from("SELECT ");

        sql.push_str(
            &self
                .columns
                .iter()
                .map(SelectItem::to_sql)
                .collect::<Vec<_>>()
                .join(", "),
        );
        sql.push_str(&format!(" FROM {} AS {}", self.table, quote_ident(&self.alias)));

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql());
        }

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql());
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(|o| o.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(sql)
    }

    /// Fold this statement into a parenthesized expression yielding one JSON
    /// value. `wrapper` aliases the derived table.
    pub fn to_json_subquery(
        &self,
        dialect: Dialect,
        shape: JsonShape,
        wrapper: &str,
    ) -> Result<String> {
        let inner = match shape {
            JsonShape::Scalar | JsonShape::Object => self.clone().limit(1),
            JsonShape::Array => self.clone(),
        };
        let inner_sql = inner.build()?;

        let names: Vec<String> = self.columns.iter().map(SelectItem::output_name).collect();
        let object = || {
            let pairs: Vec<(String, String)> = names
                .iter()
                .map(|name| (name.clone(), qualify(wrapper, name)))
                .collect();
            dialect.json_object(&pairs)
        };

        let projection = match shape {
            JsonShape::Scalar => qualify(wrapper, &names[0]),
            JsonShape::Object => object(),
            JsonShape::Array => dialect.json_array_agg(&object()),
        };

        Ok(format!(
            "(SELECT {} FROM ({}) AS {})",
            projection,
            inner_sql,
            quote_ident(wrapper)
        ))
    }
}

/// INSERT query builder
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    values: Vec<(String, Value)>,
    returning: Vec<String>,
}

impl InsertBuilder {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            table: table_ref(schema, table),
            values: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Set a column value
    pub fn value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.push((column.into(), value));
        self
    }

    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning.push(column.into());
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> Result<String> {
        let mut sql = format!("INSERT INTO {}", self.table);

        if self.values.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let columns = self
                .values
                .iter()
                .map(|(col, _)| quote_ident(col))
                .collect::<Vec<_>>()
                .join(", ");
            let values = self
                .values
                .iter()
                .map(|(_, val)| format_value(val))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ({}) VALUES ({})", columns, values));
        }

        if !self.returning.is_empty() {
            sql.push_str(" RETURNING ");
            sql.push_str(
                &self
                    .returning
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        Ok(sql)
    }
}

/// UPDATE query builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_values: Vec<(String, String)>,
    where_clause: Option<Condition>,
}

impl UpdateBuilder {
    /// Create a new UPDATE query builder
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            table: table_ref(schema, table),
            set_values: Vec::new(),
            where_clause: None,
        }
    }

    /// Set a column value
    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set_values.push((column.into(), format_value(&value)));
        self
    }

    /// Set a column to a raw SQL expression
    pub fn set_raw(mut self, column: impl Into<String>, expr: impl Into<String>) -> Self {
        self.set_values.push((column.into(), expr.into()));
        self
    }

    /// Add simple WHERE condition (column = value)
    pub fn where_eq(mut self, column: &str, value: Value) -> Self {
        let condition = Condition::eq(quote_ident(column), value);
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => Condition::and(vec![existing, condition]),
            None => condition,
        });
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> Result<String> {
        if self.set_values.is_empty() {
            return Err(EngineError::Query(
                "UPDATE must have at least one SET value".to_string(),
            ));
        }

        let mut sql = format!("UPDATE {} SET ", self.table);

        let set_clauses: Vec<String> = self
            .set_values
            .iter()
            .map(|(col, val)| format!("{} = {}", quote_ident(col), val))
            .collect();

        sql.push_str(&set_clauses.join(", "));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql());
        }

        Ok(sql)
    }
}

/// DELETE query builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Option<Condition>,
}

impl DeleteBuilder {
    /// Create a new DELETE query builder
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            table: table_ref(schema, table),
            where_clause: None,
        }
    }

    /// Add simple WHERE condition (column = value)
    pub fn where_eq(mut self, column: &str, value: Value) -> Self {
        let condition = Condition::eq(quote_ident(column), value);
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => Condition::and(vec![existing, condition]),
            None => condition,
        });
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> Result<String> {
        let mut sql = format!("DELETE FROM {}", self.table);

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql());
        }

        Ok(sql)
    }
}

/// Format a JSON value as a SQL literal
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) | Value::Object(_) => {
            format!("'{}'", value.to_string().replace('\'', "''"))
        }
    }
}
