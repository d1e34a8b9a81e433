//! Engine registry and the per-table entry points.

use crate::backend::{DatabaseBackend, Dialect};
use crate::changes::{ChangeBatch, ChangeSink};
use crate::commit::{self, WriteResult};
use crate::config::EngineConfig;
use crate::context::{Context, Params};
use crate::error::{EngineError, Result};
use crate::introspect::introspect;
use crate::read::{self, Page, ReadResult, Row};
use crate::relations::{self, InverseNames};
use crate::schema::TableMetadata;
use crate::table::{Table, TableDef};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    backend: Arc<dyn DatabaseBackend>,
    config: EngineConfig,
    defs: Vec<TableDef>,
    inverse: InverseNames,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl EngineBuilder {
    pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            defs: Vec::new(),
            inverse: InverseNames::new(),
            sink: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn table(mut self, def: TableDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Name the hasMany relation created by a foreign key. `key` is
    /// `table.column` or a bare `column`.
    pub fn inverse_name(mut self, key: impl Into<String>, name: impl Into<String>) -> Self {
        self.inverse.insert(key, name);
        self
    }

    pub fn change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Introspect every registered table and link relations
    pub async fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let dialect = self.backend.dialect();
        let default_schema = self
            .config
            .schema
            .clone()
            .unwrap_or_else(|| dialect.default_schema().to_string());

        let mut conn = self.backend.acquire().await?;
        let mut metadata: BTreeMap<String, TableMetadata> = BTreeMap::new();

        for def in &self.defs {
            if metadata.contains_key(&def.name) {
                return Err(EngineError::Schema(format!(
                    "table {} registered twice",
                    def.name
                )));
            }

            let schema = def.schema.clone().unwrap_or_else(|| default_schema.clone());
            let mut meta = introspect(conn.as_mut(), &schema, &def.table_name)
                .await?
                .with_overrides(&def.overrides)?;
            for target in meta.relations.values_mut() {
                if target.ref_schema.is_empty() {
                    target.ref_schema = schema.clone();
                }
            }

            check_definition(def, &meta, &self.config)?;
            debug!(
                table = %def.name,
                columns = meta.columns.len(),
                unique_groups = meta.unique_column_groups.len(),
                "table registered"
            );
            metadata.insert(def.name.clone(), meta);
        }

        let mut linked = relations::link(&metadata, &self.inverse, &self.config.id_suffix)?;

        let mut tables = BTreeMap::new();
        for def in self.defs {
            let Some(meta) = metadata.remove(&def.name) else {
                continue;
            };
            let relations = linked.remove(&def.name).unwrap_or_default();
            check_names(&def, &relations)?;
            tables.insert(
                def.name.clone(),
                Table {
                    def,
                    metadata: meta,
                    relations,
                },
            );
        }

        info!(tables = tables.len(), dialect = ?dialect, "engine ready");

        Ok(Engine {
            backend: self.backend,
            config: self.config,
            tables,
            sink: self.sink,
        })
    }
}

fn check_definition(def: &TableDef, meta: &TableMetadata, config: &EngineConfig) -> Result<()> {
    let missing = |what: &str, column: &str| {
        EngineError::Schema(format!("{} column {}.{} does not exist", what, def.name, column))
    };

    if def.soft_delete && !meta.has_column(&config.deleted_at_column) {
        return Err(missing("soft-delete", &config.deleted_at_column));
    }
    if let Some(tenant) = &def.tenant_column {
        if !meta.has_column(tenant) {
            return Err(missing("tenant", tenant));
        }
    }
    for column in &def.hidden {
        if !meta.has_column(column) {
            return Err(missing("hidden", column));
        }
    }
    for column in &def.readonly {
        if !meta.has_column(column) {
            return Err(missing("readonly", column));
        }
    }
    for (column, _) in &def.rules {
        if !meta.has_column(column) {
            return Err(missing("rule", column));
        }
    }
    if let Some(key) = &def.upsert_key {
        if key.is_empty() {
            return Err(EngineError::Schema(format!("empty upsert key on {}", def.name)));
        }
        for column in key {
            if !meta.has_column(column) {
                return Err(missing("upsert key", column));
            }
        }
    }
    if def.weight <= 0 {
        return Err(EngineError::Schema(format!(
            "table {} must have a positive weight",
            def.name
        )));
    }
    Ok(())
}

/// Getter names share the link namespace with relations
fn check_names(def: &TableDef, relations: &relations::TableRelations) -> Result<()> {
    for name in def.getters.keys().chain(def.eager_getters.keys()) {
        if relations.is_relation(name) {
            return Err(EngineError::Schema(format!(
                "getter {}.{} collides with a relation",
                def.name, name
            )));
        }
    }
    Ok(())
}

/// Registry of linked tables over one backend
pub struct Engine {
    backend: Arc<dyn DatabaseBackend>,
    config: EngineConfig,
    tables: BTreeMap<String, Table>,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl Engine {
    pub fn builder(backend: Arc<dyn DatabaseBackend>) -> EngineBuilder {
        EngineBuilder::new(backend)
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
        &self.backend
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Entry points for one registered table
    pub fn table(&self, name: &str) -> Result<TableHandle<'_>> {
        Ok(TableHandle {
            engine: self,
            table: self.get(name)?,
        })
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| EngineError::Schema(format!("table {} is not registered", name)))
    }

    pub(crate) fn emit(&self, batch: ChangeBatch) {
        if let Some(sink) = &self.sink {
            sink.emit(batch);
        }
    }
}

/// Reads and writes against one table
#[derive(Clone, Copy)]
pub struct TableHandle<'a> {
    engine: &'a Engine,
    table: &'a Table,
}

impl<'a> TableHandle<'a> {
    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// Single row when `params` carries a scalar id, a page otherwise
    pub async fn read(&self, params: &Params, ctx: &Context) -> Result<ReadResult> {
        read::read(self.engine, self.table, params, ctx).await
    }

    pub async fn read_one(&self, id: impl Into<Value>, params: &Params, ctx: &Context) -> Result<Row> {
        read::read_one(self.engine, self.table, &id.into(), params, ctx).await
    }

    pub async fn read_many(&self, params: &Params, ctx: &Context) -> Result<Page> {
        read::read_many(self.engine, self.table, params, ctx).await
    }

    pub async fn count(&self, params: &Params, ctx: &Context) -> Result<u64> {
        read::count(self.engine, self.table, params, ctx).await
    }

    pub async fn ids(&self, params: &Params, ctx: &Context) -> Result<Vec<Value>> {
        read::ids(self.engine, self.table, params, ctx).await
    }

    /// Value of a registered getter for one row
    pub async fn get(
        &self,
        id: impl Into<Value>,
        name: &str,
        params: &Params,
        ctx: &Context,
    ) -> Result<Value> {
        read::getter(self.engine, self.table, &id.into(), name, params, ctx).await
    }

    /// Validate and commit a nested write graph in one transaction
    pub async fn write(&self, graph: &Value, ctx: &Context) -> Result<WriteResult> {
        commit::write(self.engine, self.table, graph, ctx).await
    }
}
