//! tablegraph - schema-driven table engine
//!
//! tablegraph exposes relational tables as an authorization-gated read/write
//! graph. Everything it knows about a table comes from the database catalog:
//! columns, unique groups and foreign keys are introspected once, relations
//! are linked across all registered tables, and every request is compiled
//! against that registry.
//!
//! # Architecture
//!
//! - **Introspection**: catalog reads per table, merged with caller overrides
//! - **Linking**: hasOne / hasMany maps derived from foreign keys
//! - **Reads**: filters, policy, relation inclusion via correlated
//!   sub-selects, offset or keyset pagination
//! - **Writes**: nested graphs validated and committed in one transaction,
//!   with soft-delete cascade and a complexity budget
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tablegraph::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let backend = SqliteBackend::memory().await?;
//!     backend
//!         .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE)")
//!         .await?;
//!
//!     let engine = Engine::builder(Arc::new(backend))
//!         .table(TableDef::new("items"))
//!         .build()
//!         .await?;
//!
//!     let ctx = Context::new();
//!     let items = engine.table("items")?;
//!     let written = items.write(&json!({"value": "a"}), &ctx).await?;
//!     println!("created {:?}", written.generated_id);
//!
//!     let page = items.read_many(&Params::new(), &ctx).await?;
//!     println!("{} items", page.items.len());
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! ```toml
//! [dependencies]
//! tablegraph = { version = "0.1", features = ["postgres", "sqlite"] }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod backend;
pub mod builder;
pub mod changes;
pub mod commit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod hooks;
pub mod introspect;
pub mod policy;
pub mod read;
pub mod relations;
pub mod schema;
pub mod table;
pub mod validate;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Boxed future used by the recursive graph walkers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use backend::{DatabaseBackend, Dialect, Executor, QueryResult, QueryRow, Transaction};
pub use builder::{
    AggregateFunc, AliasGen, ComparisonOp, Condition, DeleteBuilder, InsertBuilder, JoinType,
    JsonShape, LogicalOp, SelectBuilder, SortDirection, UpdateBuilder,
};
pub use changes::{BroadcastSink, ChangeBatch, ChangeSink, ChangeSummary, MemorySink};
pub use commit::WriteResult;
pub use config::EngineConfig;
pub use context::{Context, Params};
pub use engine::{Engine, EngineBuilder, TableHandle};
pub use error::{EngineError, FieldError, Result, ValidationErrors};
pub use graph::{GraphNode, NodeKind};
pub use hooks::{
    ColumnRule, EagerGetter, EagerShape, Getter, IdGenerator, IdModifier, IdModifierFn,
    QueryModifier, QueryModifierFn, Setter, UuidV4Generator, WriteHook,
};
pub use policy::{Mode, Policy, PolicyFn};
pub use read::{Page, PageLinks, ReadResult, Row};
pub use relations::{InverseNames, RelatedTableRef, TableRelations};
pub use schema::{ColumnMeta, ColumnOverride, ForeignKeyRef, SqlType, TableMetadata, TableOverrides};
pub use table::{Table, TableDef};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{DatabaseBackend, QueryRow};
    pub use crate::builder::{Condition, SelectBuilder};
    pub use crate::changes::{ChangeBatch, ChangeSink, MemorySink};
    pub use crate::config::EngineConfig;
    pub use crate::context::{Context, Params};
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, Result};
    pub use crate::policy::{Mode, PolicyFn};
    pub use crate::read::{Page, ReadResult, Row};
    pub use crate::table::TableDef;

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _config = EngineConfig::default();
        let _sql_type = SqlType::Text;
        let _comp_op = ComparisonOp::Eq;
        let _mode = Mode::Read;
        assert!(ValidationErrors::new().is_empty());
    }
}
