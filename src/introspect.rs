//! Catalog readers that turn a live table into [`TableMetadata`].

use crate::backend::{Dialect, Executor, QueryRow};
use crate::builder::{format_value, quote_ident};
use crate::error::{EngineError, Result};
use crate::schema::{ColumnMeta, ForeignKeyRef, SqlType, TableMetadata};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

/// Read column, unique-group and foreign-key metadata for one table
pub async fn introspect(
    exec: &mut dyn Executor,
    schema: &str,
    table: &str,
) -> Result<TableMetadata> {
    let metadata = match exec.dialect() {
        Dialect::Sqlite => introspect_sqlite(exec, schema, table).await?,
        Dialect::Postgres => introspect_postgres(exec, schema, table).await?,
    };
    trace!(
        table,
        columns = metadata.columns.len(),
        unique_groups = metadata.unique_column_groups.len(),
        relations = metadata.relations.len(),
        "introspected table"
    );
    Ok(metadata)
}

/// Convert catalog-native 1-based column ordinals to column names
pub fn resolve_ordinals(columns: &[ColumnMeta], ordinals: &[i64]) -> Result<Vec<String>> {
    ordinals
        .iter()
        .map(|&ordinal| {
            usize::try_from(ordinal - 1)
                .ok()
                .and_then(|index| columns.get(index))
                .map(|c| c.name.clone())
                .ok_or_else(|| EngineError::Schema(format!("unknown column ordinal {}", ordinal)))
        })
        .collect()
}

fn text(row: &QueryRow, key: &str) -> Option<String> {
    match row.value(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn flag(row: &QueryRow, key: &str) -> bool {
    match row.value(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.as_str(), "YES" | "yes" | "true" | "t" | "1"),
        _ => false,
    }
}

fn finish(
    schema: &str,
    table: &str,
    columns: Vec<ColumnMeta>,
    primary_key: Vec<String>,
    unique_groups: Vec<Vec<String>>,
    relations: BTreeMap<String, ForeignKeyRef>,
) -> Result<TableMetadata> {
    if columns.is_empty() {
        return Err(EngineError::Schema(format!(
            "table {}.{} not found",
            schema, table
        )));
    }

    let id_column_name = match primary_key.as_slice() {
        [single] => single.clone(),
        _ => "id".to_string(),
    };

    let mut unique_column_groups: Vec<Vec<String>> = Vec::new();
    for group in unique_groups {
        let id_only = group.len() == 1 && group[0] == id_column_name;
        if !id_only && !unique_column_groups.contains(&group) {
            unique_column_groups.push(group);
        }
    }

    Ok(TableMetadata {
        schema_name: schema.to_string(),
        table_name: table.to_string(),
        id_column_name,
        columns,
        unique_column_groups,
        relations,
    })
}

async fn introspect_sqlite(
    exec: &mut dyn Executor,
    schema: &str,
    table: &str,
) -> Result<TableMetadata> {
    let schema_ident = quote_ident(schema);
    let table_literal = format_value(&Value::String(table.to_string()));

    let rows = exec
        .query(&format!("PRAGMA {}.table_info({})", schema_ident, table_literal))
        .await?;

    let mut columns = Vec::new();
    let mut primary_key: Vec<(i64, String)> = Vec::new();
    for row in &rows {
        let name = text(row, "name").unwrap_or_default();
        let (sql_type, length) = SqlType::from_catalog(&text(row, "type").unwrap_or_default());
        let pk = row.get_i64("pk").unwrap_or(0);
        if pk > 0 {
            primary_key.push((pk, name.clone()));
        }
        columns.push(ColumnMeta {
            name,
            sql_type,
            nullable: !flag(row, "notnull") && pk == 0,
            default: text(row, "dflt_value"),
            length,
        });
    }
    primary_key.sort();
    let primary_key: Vec<String> = primary_key.into_iter().map(|(_, name)| name).collect();

    let indexes = exec
        .query(&format!("PRAGMA {}.index_list({})", schema_ident, table_literal))
        .await?;

    let mut unique_groups = Vec::new();
    for index in indexes.iter().filter(|i| flag(i, "unique") && !flag(i, "partial")) {
        let Some(index_name) = text(index, "name") else {
            continue;
        };
        let parts = exec
            .query(&format!(
                "PRAGMA {}.index_info({})",
                schema_ident,
                format_value(&Value::String(index_name))
            ))
            .await?;

        let mut ordered: Vec<(i64, i64)> = parts
            .iter()
            .map(|p| (p.get_i64("seqno").unwrap_or(0), p.get_i64("cid").unwrap_or(-1)))
            .collect();
        ordered.sort();

        // expression indexes report cid < 0
        if ordered.is_empty() || ordered.iter().any(|(_, cid)| *cid < 0) {
            continue;
        }
        let ordinals: Vec<i64> = ordered.iter().map(|(_, cid)| cid + 1).collect();
        unique_groups.push(resolve_ordinals(&columns, &ordinals)?);
    }

    let fks = exec
        .query(&format!("PRAGMA {}.foreign_key_list({})", schema_ident, table_literal))
        .await?;

    let mut by_constraint: BTreeMap<i64, Vec<&QueryRow>> = BTreeMap::new();
    for fk in &fks {
        by_constraint
            .entry(fk.get_i64("id").unwrap_or(0))
            .or_default()
            .push(fk);
    }

    let mut relations = BTreeMap::new();
    for parts in by_constraint.values() {
        if let [fk] = parts.as_slice() {
            if let (Some(from), Some(target)) = (text(fk, "from"), text(fk, "table")) {
                relations.insert(
                    from,
                    ForeignKeyRef {
                        ref_schema: schema.to_string(),
                        ref_table: target,
                    },
                );
            }
        }
    }

    finish(schema, table, columns, primary_key, unique_groups, relations)
}

async fn introspect_postgres(
    exec: &mut dyn Executor,
    schema: &str,
    table: &str,
) -> Result<TableMetadata> {
    let schema_literal = format_value(&Value::String(schema.to_string()));
    let table_literal = format_value(&Value::String(table.to_string()));

    let rows = exec
        .query(&format!(
            "SELECT c.column_name AS name, c.udt_name AS udt_name, c.is_nullable AS is_nullable, \
             c.column_default AS column_default, c.character_maximum_length AS max_length \
             FROM information_schema.columns c \
             WHERE c.table_schema = {} AND c.table_name = {} \
             ORDER BY c.ordinal_position",
            schema_literal, table_literal
        ))
        .await?;

    let columns: Vec<ColumnMeta> = rows
        .iter()
        .map(|row| {
            let (sql_type, _) = SqlType::from_catalog(&text(row, "udt_name").unwrap_or_default());
            ColumnMeta {
                name: text(row, "name").unwrap_or_default(),
                sql_type,
                nullable: flag(row, "is_nullable"),
                default: text(row, "column_default"),
                length: row.get_i64("max_length").and_then(|n| u32::try_from(n).ok()),
            }
        })
        .collect();

    let index_rows = exec
        .query(&format!(
            "SELECT i.indexrelid::bigint AS index_id, i.indisprimary AS is_primary, \
             k.attnum::bigint AS attnum, a.attname::text AS column_name, k.pos::bigint AS pos \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, pos) \
             LEFT JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum \
             WHERE i.indisunique AND i.indpred IS NULL AND n.nspname = {} AND c.relname = {} \
             ORDER BY index_id, pos",
            schema_literal, table_literal
        ))
        .await?;

    // members resolve by attnum, which survives dropped columns; expression
    // members have attnum 0 and no name
    let mut indexes: BTreeMap<i64, (bool, Vec<Option<String>>)> = BTreeMap::new();
    for row in &index_rows {
        let entry = indexes
            .entry(row.get_i64("index_id").unwrap_or(0))
            .or_insert_with(|| (flag(row, "is_primary"), Vec::new()));
        let member = match row.get_i64("attnum") {
            Some(attnum) if attnum > 0 => text(row, "column_name"),
            _ => None,
        };
        entry.1.push(member);
    }

    let mut primary_key = Vec::new();
    let mut unique_groups = Vec::new();
    for (is_primary, members) in indexes.into_values() {
        let Some(group) = members.into_iter().collect::<Option<Vec<String>>>() else {
            continue;
        };
        if group.iter().any(|name| !columns.iter().any(|c| &c.name == name)) {
            return Err(EngineError::Schema(format!(
                "unique index on {}.{} names an unknown column",
                schema, table
            )));
        }
        if is_primary {
            primary_key = group.clone();
        }
        unique_groups.push(group);
    }

    let fk_rows = exec
        .query(&format!(
            "SELECT tc.constraint_name AS constraint_name, kcu.column_name AS column_name, \
             ccu.table_schema AS ref_schema, ccu.table_name AS ref_table \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name AND kcu.constraint_schema = tc.constraint_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name AND ccu.constraint_schema = tc.constraint_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = {} AND tc.table_name = {}",
            schema_literal, table_literal
        ))
        .await?;

    let mut by_constraint: BTreeMap<String, Vec<&QueryRow>> = BTreeMap::new();
    for row in &fk_rows {
        by_constraint
            .entry(text(row, "constraint_name").unwrap_or_default())
            .or_default()
            .push(row);
    }

    let mut relations = BTreeMap::new();
    for parts in by_constraint.values() {
        if let [fk] = parts.as_slice() {
            if let (Some(column), Some(ref_schema), Some(ref_table)) = (
                text(fk, "column_name"),
                text(fk, "ref_schema"),
                text(fk, "ref_table"),
            ) {
                relations.insert(column, ForeignKeyRef { ref_schema, ref_table });
            }
        }
    }

    finish(schema, table, columns, primary_key, unique_groups, relations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            sql_type: SqlType::Text,
            nullable: true,
            default: None,
            length: None,
        }
    }

    #[test]
    fn test_resolve_ordinals() {
        let columns = vec![column("id"), column("org_id"), column("email")];
        assert_eq!(
            resolve_ordinals(&columns, &[2, 3]).unwrap(),
            vec!["org_id".to_string(), "email".to_string()]
        );
        assert!(resolve_ordinals(&columns, &[0]).is_err());
        assert!(resolve_ordinals(&columns, &[4]).is_err());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_introspect_sqlite() {
        use crate::backend::DatabaseBackend;
        use crate::sqlite::SqliteBackend;

        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(64) NOT NULL UNIQUE)")
            .await
            .unwrap();
        backend
            .execute(
                "CREATE TABLE posts (\
                 id INTEGER PRIMARY KEY, \
                 author_id INTEGER NOT NULL REFERENCES users(id), \
                 slug TEXT NOT NULL, \
                 lang TEXT NOT NULL DEFAULT 'en', \
                 UNIQUE (author_id, slug))",
            )
            .await
            .unwrap();

        let mut conn = backend.acquire().await.unwrap();
        let users = introspect(conn.as_mut(), "main", "users").await.unwrap();
        assert_eq!(users.id_column_name, "id");
        let email = users.column("email").unwrap();
        assert_eq!(email.sql_type, SqlType::Varchar);
        assert_eq!(email.length, Some(64));
        assert!(!email.nullable);
        assert_eq!(users.unique_column_groups, vec![vec!["email".to_string()]]);

        let posts = introspect(conn.as_mut(), "main", "posts").await.unwrap();
        assert_eq!(
            posts.unique_column_groups,
            vec![vec!["author_id".to_string(), "slug".to_string()]]
        );
        assert_eq!(posts.relations["author_id"].ref_table, "users");
        assert_eq!(posts.column("lang").unwrap().default.as_deref(), Some("'en'"));

        assert!(matches!(
            introspect(conn.as_mut(), "main", "missing").await,
            Err(EngineError::Schema(_))
        ));
    }
}
