//! Table registration.
//!
//! A [`TableDef`] is what the caller registers; the engine turns it into a
//! [`Table`] by introspecting storage and linking relations.

use crate::context::Params;
use crate::hooks::{
    ColumnRule, EagerGetter, Getter, IdGenerator, IdModifier, QueryModifier, Setter, WriteHook,
};
use crate::policy::Policy;
use crate::error::{EngineError, Result};
use crate::relations::{RelatedTableRef, TableRelations};
use crate::schema::{ColumnOverride, ForeignKeyRef, SqlType, TableMetadata, TableOverrides};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registration of one table with the engine
#[derive(Clone)]
pub struct TableDef {
    pub(crate) name: String,
    pub(crate) table_name: String,
    pub(crate) schema: Option<String>,
    pub(crate) path: Option<String>,
    pub(crate) type_name: Option<String>,
    pub(crate) tenant_column: Option<String>,
    pub(crate) soft_delete: bool,
    pub(crate) hidden: Vec<String>,
    pub(crate) readonly: Vec<String>,
    pub(crate) weight: i64,
    pub(crate) default_params: Params,
    pub(crate) overrides: TableOverrides,
    pub(crate) upsert_key: Option<Vec<String>>,
    pub(crate) policy: Option<Arc<dyn Policy>>,
    pub(crate) hook: Option<Arc<dyn WriteHook>>,
    pub(crate) id_generator: Option<Arc<dyn IdGenerator>>,
    pub(crate) setters: BTreeMap<String, Arc<dyn Setter>>,
    pub(crate) getters: BTreeMap<String, Arc<dyn Getter>>,
    pub(crate) eager_getters: BTreeMap<String, Arc<dyn EagerGetter>>,
    pub(crate) id_modifiers: BTreeMap<String, Arc<dyn IdModifier>>,
    pub(crate) query_modifiers: BTreeMap<String, Arc<dyn QueryModifier>>,
    pub(crate) rules: Vec<(String, Arc<dyn ColumnRule>)>,
}

impl TableDef {
    /// Register the storage table `name` under the same name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table_name: name.clone(),
            name,
            schema: None,
            path: None,
            type_name: None,
            tenant_column: None,
            soft_delete: false,
            hidden: Vec::new(),
            readonly: Vec::new(),
            weight: 1,
            default_params: Params::new(),
            overrides: TableOverrides::default(),
            upsert_key: None,
            policy: None,
            hook: None,
            id_generator: None,
            setters: BTreeMap::new(),
            getters: BTreeMap::new(),
            eager_getters: BTreeMap::new(),
            id_modifiers: BTreeMap::new(),
            query_modifiers: BTreeMap::new(),
            rules: Vec::new(),
        }
    }

    /// Storage table name, when it differs from the registered name
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// URL path segment; defaults to the registered name
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Value of `_type` on output rows; defaults to the registered name
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Require this column on every read and write
    pub fn tenant(mut self, column: impl Into<String>) -> Self {
        self.tenant_column = Some(column.into());
        self
    }

    /// Delete by stamping the deleted-at column instead of removing rows
    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Leave a column out of output rows
    pub fn hidden(mut self, column: impl Into<String>) -> Self {
        self.hidden.push(column.into());
        self
    }

    /// Ignore a column in write input
    pub fn readonly(mut self, column: impl Into<String>) -> Self {
        self.readonly.push(column.into());
        self
    }

    /// Complexity units charged per node of this table in a write graph
    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Param applied to every read unless the request gives its own
    pub fn default_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_params.insert(key.into(), value.into());
        self
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.overrides.id_column = Some(column.into());
        self
    }

    pub fn column(mut self, column: ColumnOverride) -> Self {
        self.overrides.columns.push(column);
        self
    }

    /// Shorthand for a type-only column override
    pub fn column_type(self, column: impl Into<String>, sql_type: SqlType) -> Self {
        self.column(ColumnOverride::new(column).sql_type(sql_type))
    }

    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides
            .unique_column_groups
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Declare a foreign key the catalog does not know about
    pub fn relation(mut self, column: impl Into<String>, target_table: impl Into<String>) -> Self {
        self.overrides.relations.push((
            column.into(),
            Some(ForeignKeyRef {
                ref_schema: String::new(),
                ref_table: target_table.into(),
            }),
        ));
        self
    }

    /// Hide an introspected foreign key
    pub fn without_relation(mut self, column: impl Into<String>) -> Self {
        self.overrides.relations.push((column.into(), None));
        self
    }

    /// Columns identifying an existing row when an insert node should update instead
    pub fn upsert_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upsert_key = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn policy(mut self, policy: impl Policy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn hook(mut self, hook: impl WriteHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    pub fn setter(mut self, name: impl Into<String>, setter: impl Setter + 'static) -> Self {
        self.setters.insert(name.into(), Arc::new(setter));
        self
    }

    pub fn getter(mut self, name: impl Into<String>, getter: impl Getter + 'static) -> Self {
        self.getters.insert(name.into(), Arc::new(getter));
        self
    }

    pub fn eager_getter(
        mut self,
        name: impl Into<String>,
        getter: impl EagerGetter + 'static,
    ) -> Self {
        self.eager_getters.insert(name.into(), Arc::new(getter));
        self
    }

    pub fn id_modifier(mut self, name: impl Into<String>, modifier: impl IdModifier + 'static) -> Self {
        self.id_modifiers.insert(name.into(), Arc::new(modifier));
        self
    }

    pub fn query_modifier(
        mut self,
        name: impl Into<String>,
        modifier: impl QueryModifier + 'static,
    ) -> Self {
        self.query_modifiers.insert(name.into(), Arc::new(modifier));
        self
    }

    pub fn rule(mut self, column: impl Into<String>, rule: impl ColumnRule + 'static) -> Self {
        self.rules.push((column.into(), Arc::new(rule)));
        self
    }
}

/// A registered table after introspection and linking
pub struct Table {
    pub(crate) def: TableDef,
    pub(crate) metadata: TableMetadata,
    pub(crate) relations: TableRelations,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn path(&self) -> &str {
        self.def.path.as_deref().unwrap_or(&self.def.name)
    }

    pub fn type_name(&self) -> &str {
        self.def.type_name.as_deref().unwrap_or(&self.def.name)
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn relations(&self) -> &TableRelations {
        &self.relations
    }

    pub fn schema(&self) -> &str {
        &self.metadata.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.metadata.table_name
    }

    pub fn id_column(&self) -> &str {
        &self.metadata.id_column_name
    }

    pub fn tenant_column(&self) -> Option<&str> {
        self.def.tenant_column.as_deref()
    }

    pub fn is_soft_delete(&self) -> bool {
        self.def.soft_delete
    }

    /// hasOne or hasMany relation by name
    pub(crate) fn relation(&self, name: &str) -> Result<&RelatedTableRef> {
        self.relations
            .has_one
            .get(name)
            .or_else(|| self.relations.has_many.get(name))
            .ok_or_else(|| {
                EngineError::Schema(format!("{} has no relation {}", self.def.name, name))
            })
    }

    pub(crate) fn policy(&self) -> Option<&dyn Policy> {
        self.def.policy.as_deref()
    }

    pub(crate) fn is_hidden(&self, column: &str) -> bool {
        self.def.hidden.iter().any(|c| c == column)
    }

    /// Drop hidden columns from a stored row, keeping the id
    pub(crate) fn strip_hidden(&self, values: &mut Map<String, Value>) {
        let id_column = self.id_column();
        values.retain(|column, _| column == id_column || !self.is_hidden(column));
    }

    /// Whether write input may set this column
    pub(crate) fn is_writable(&self, column: &str, deleted_at: &str) -> bool {
        self.metadata.has_column(column)
            && column != self.id_column()
            && !(self.def.soft_delete && column == deleted_at)
            && !self.def.readonly.iter().any(|c| c == column)
    }

    pub(crate) fn rules_for<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a dyn ColumnRule> {
        self.def
            .rules
            .iter()
            .filter(move |(c, _)| c == column)
            .map(|(_, rule)| rule.as_ref())
    }

    /// Whether a target table filters on the same tenant column as this one
    pub(crate) fn shares_tenant(&self, other: &Table) -> Option<&str> {
        match (self.tenant_column(), other.tenant_column()) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }
}
