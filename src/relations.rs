//! Relation linking across all registered tables.
//!
//! Linking runs once when the engine is built. Every name collision is a
//! hard error here so request handling can treat the relation maps as
//! trusted.

use crate::error::{EngineError, Result};
use crate::schema::TableMetadata;
use std::collections::{BTreeMap, HashMap};

/// A named edge from one registered table to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedTableRef {
    /// Relation name as it appears in params, graphs and output links
    pub name: String,
    /// Foreign key column. Lives on the owning table for hasOne and on the
    /// target table for hasMany.
    pub relation: String,
    /// Registered name of the target table
    pub table: String,
}

/// Linked relations of one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRelations {
    pub has_one: BTreeMap<String, RelatedTableRef>,
    pub has_many: BTreeMap<String, RelatedTableRef>,
}

impl TableRelations {
    pub fn is_relation(&self, name: &str) -> bool {
        self.has_one.contains_key(name) || self.has_many.contains_key(name)
    }
}

/// Names for hasMany relations, keyed by `table.column` or bare `column`
/// of the foreign key that points back.
#[derive(Debug, Clone, Default)]
pub struct InverseNames {
    names: HashMap<String, String>,
}

impl InverseNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, name: impl Into<String>) {
        self.names.insert(key.into(), name.into());
    }

    pub fn lookup(&self, table: &str, column: &str) -> Option<&str> {
        self.names
            .get(&format!("{}.{}", table, column))
            .or_else(|| self.names.get(column))
            .map(String::as_str)
    }
}

/// Relation name for a foreign key column: the column minus the id suffix
pub fn relation_name(column: &str, id_suffix: &str) -> String {
    match column.strip_suffix(id_suffix) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => column.to_string(),
    }
}

fn registered_name<'a>(
    tables: &'a BTreeMap<String, TableMetadata>,
    schema: &str,
    table: &str,
) -> Option<&'a String> {
    tables
        .iter()
        .find(|(_, meta)| meta.schema_name == schema && meta.table_name == table)
        .map(|(name, _)| name)
}

/// Compute hasOne and hasMany maps for every registered table
pub fn link(
    tables: &BTreeMap<String, TableMetadata>,
    inverse: &InverseNames,
    id_suffix: &str,
) -> Result<BTreeMap<String, TableRelations>> {
    let mut linked: BTreeMap<String, TableRelations> = tables
        .keys()
        .map(|name| (name.clone(), TableRelations::default()))
        .collect();

    for (name, meta) in tables {
        let relations = linked.entry(name.clone()).or_default();
        for (column, target) in &meta.relations {
            // foreign keys into unregistered tables are not exposed
            let Some(target_name) = registered_name(tables, &target.ref_schema, &target.ref_table)
            else {
                continue;
            };
            let relation = relation_name(column, id_suffix);
            if relation != *column && meta.has_column(&relation) {
                return Err(EngineError::Schema(format!(
                    "relation {}.{} collides with a column of the same name",
                    name, relation
                )));
            }
            relations.has_one.insert(
                relation.clone(),
                RelatedTableRef {
                    name: relation,
                    relation: column.clone(),
                    table: target_name.clone(),
                },
            );
        }
    }

    for (name, meta) in tables {
        for (other_name, other) in tables {
            for (column, target) in &other.relations {
                if target.ref_schema != meta.schema_name || target.ref_table != meta.table_name {
                    continue;
                }
                let relation = inverse
                    .lookup(other_name, column)
                    .map(String::from)
                    .unwrap_or_else(|| other_name.clone());

                let relations = linked.entry(name.clone()).or_default();
                if relations.is_relation(&relation) || meta.has_column(&relation) {
                    return Err(EngineError::Schema(format!(
                        "relation name {} on {} is ambiguous; register an inverse name for {}.{}",
                        relation, name, other_name, column
                    )));
                }
                relations.has_many.insert(
                    relation.clone(),
                    RelatedTableRef {
                        name: relation,
                        relation: column.clone(),
                        table: other_name.clone(),
                    },
                );
            }
        }
    }

    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ForeignKeyRef, SqlType};

    fn table(name: &str, fks: &[(&str, &str)]) -> TableMetadata {
        let mut columns = vec!["id".to_string()];
        columns.extend(fks.iter().map(|(c, _)| c.to_string()));
        TableMetadata {
            schema_name: "main".to_string(),
            table_name: name.to_string(),
            id_column_name: "id".to_string(),
            columns: columns
                .into_iter()
                .map(|name| ColumnMeta {
                    name,
                    sql_type: SqlType::Integer,
                    nullable: true,
                    default: None,
                    length: None,
                })
                .collect(),
            unique_column_groups: vec![],
            relations: fks
                .iter()
                .map(|(column, target)| {
                    (
                        column.to_string(),
                        ForeignKeyRef {
                            ref_schema: "main".to_string(),
                            ref_table: target.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn registry(tables: Vec<TableMetadata>) -> BTreeMap<String, TableMetadata> {
        tables
            .into_iter()
            .map(|t| (t.table_name.clone(), t))
            .collect()
    }

    #[test]
    fn test_has_one_and_has_many() {
        let tables = registry(vec![
            table("users", &[]),
            table("posts", &[("author_id", "users")]),
        ]);

        let linked = link(&tables, &InverseNames::new(), "_id").unwrap();

        let author = &linked["posts"].has_one["author"];
        assert_eq!(author.relation, "author_id");
        assert_eq!(author.table, "users");

        let posts = &linked["users"].has_many["posts"];
        assert_eq!(posts.relation, "author_id");
        assert_eq!(posts.table, "posts");
    }

    #[test]
    fn test_unregistered_target_dropped() {
        let tables = registry(vec![table("posts", &[("author_id", "users")])]);
        let linked = link(&tables, &InverseNames::new(), "_id").unwrap();
        assert!(linked["posts"].has_one.is_empty());
    }

    #[test]
    fn test_collision_requires_inverse_name() {
        let tables = registry(vec![
            table("users", &[]),
            table("messages", &[("sender_id", "users"), ("recipient_id", "users")]),
        ]);

        let err = link(&tables, &InverseNames::new(), "_id").unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));

        let mut inverse = InverseNames::new();
        inverse.insert("messages.sender_id", "sent");
        inverse.insert("recipient_id", "received");
        let linked = link(&tables, &inverse, "_id").unwrap();
        assert_eq!(linked["users"].has_many["sent"].relation, "sender_id");
        assert_eq!(linked["users"].has_many["received"].relation, "recipient_id");
    }

    #[test]
    fn test_self_reference() {
        let tables = registry(vec![table("nodes", &[("parent_id", "nodes")])]);
        let mut inverse = InverseNames::new();
        inverse.insert("nodes.parent_id", "children");

        let linked = link(&tables, &inverse, "_id").unwrap();
        assert_eq!(linked["nodes"].has_one["parent"].table, "nodes");
        assert_eq!(linked["nodes"].has_many["children"].relation, "parent_id");
    }

    #[test]
    fn test_relation_name() {
        assert_eq!(relation_name("owner_id", "_id"), "owner");
        assert_eq!(relation_name("owner", "_id"), "owner");
        assert_eq!(relation_name("_id", "_id"), "_id");
    }
}
