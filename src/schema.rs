use crate::error::{EngineError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// SQL type mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    Real,
    DoublePrecision,
    Numeric,
    Text,
    Varchar,
    Char,
    Boolean,
    Timestamp,
    Date,
    Time,
    Json,
    Bytea,
    Uuid,
    Other(String),
}

/// A whole float inside the `i64` range
fn whole_i64(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl SqlType {
    /// Parse a catalog type string such as `VARCHAR(255)` or `int8` into a
    /// type and an optional declared length.
    pub fn from_catalog(raw: &str) -> (SqlType, Option<u32>) {
        let lower = raw.trim().to_lowercase();
        let (base, args) = match lower.find('(') {
            Some(open) => (
                lower[..open].trim(),
                Some(lower[open + 1..].trim_end_matches(')').trim()),
            ),
            None => (lower.as_str(), None),
        };

        let sql_type = match base {
            "int" | "int4" | "integer" | "serial" | "serial4" | "mediumint" => SqlType::Integer,
            "bigint" | "int8" | "bigserial" | "serial8" => SqlType::BigInt,
            "smallint" | "int2" | "tinyint" | "smallserial" => SqlType::SmallInt,
            "real" | "float4" => SqlType::Real,
            "double" | "double precision" | "float8" | "float" => SqlType::DoublePrecision,
            "numeric" | "decimal" => SqlType::Numeric,
            "text" | "clob" | "string" | "citext" => SqlType::Text,
            "varchar" | "character varying" | "nvarchar" => SqlType::Varchar,
            "char" | "character" | "bpchar" | "nchar" => SqlType::Char,
            "boolean" | "bool" => SqlType::Boolean,
            "timestamp" | "timestamptz" | "datetime" | "timestamp with time zone"
            | "timestamp without time zone" => SqlType::Timestamp,
            "date" => SqlType::Date,
            "time" | "timetz" => SqlType::Time,
            "json" | "jsonb" => SqlType::Json,
            "blob" | "bytea" => SqlType::Bytea,
            "uuid" => SqlType::Uuid,
            other => SqlType::Other(other.to_uppercase()),
        };

        let length = match sql_type {
            SqlType::Varchar | SqlType::Char => {
                args.and_then(|a| a.split(',').next()).and_then(|n| n.trim().parse().ok())
            }
            _ => None,
        };

        (sql_type, length)
    }

    /// Cast an input value to this type. `None` means the value cannot be
    /// represented. Null always passes; nullability is checked separately.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }

        match self {
            SqlType::BigInt | SqlType::Integer | SqlType::SmallInt => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().and_then(whole_i64))
                    .map(Value::from),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            SqlType::Real | SqlType::DoublePrecision | SqlType::Numeric => match value {
                Value::Number(_) => Some(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            SqlType::Boolean => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(Value::Bool(false)),
                    Some(1) => Some(Value::Bool(true)),
                    _ => None,
                },
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" | "t" | "yes" => Some(Value::Bool(true)),
                    "false" | "0" | "f" | "no" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            SqlType::Uuid => match value {
                Value::String(s) => uuid::Uuid::parse_str(s.trim())
                    .ok()
                    .map(|u| Value::String(u.hyphenated().to_string())),
                _ => None,
            },
            SqlType::Json => Some(value.clone()),
            SqlType::Text
            | SqlType::Varchar
            | SqlType::Char
            | SqlType::Timestamp
            | SqlType::Date
            | SqlType::Time
            | SqlType::Bytea => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            SqlType::Other(_) => match value {
                Value::Array(_) | Value::Object(_) => None,
                _ => Some(value.clone()),
            },
        }
    }

    /// Id value meaning "a row that the same write will create"
    pub fn placeholder_id(&self) -> Value {
        match self {
            SqlType::Uuid => Value::String(NIL_UUID.to_string()),
            _ => Value::from(0),
        }
    }
}

pub const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Whether an id value is the placeholder sentinel (`0` or the nil UUID)
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s == "0" || s == NIL_UUID,
        _ => false,
    }
}

/// Loose equality between a stored value and an input value, tolerant of
/// storage representations (booleans as integers, JSON stored as text,
/// numbers stored as strings).
pub fn values_equal(stored: &Value, input: &Value) -> bool {
    if stored == input {
        return true;
    }
    match (stored, input) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::Bool(b)) | (Value::Bool(b), Value::Number(n)) => {
            n.as_i64() == Some(i64::from(*b))
        }
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::String(s), other @ (Value::Object(_) | Value::Array(_)))
        | (other @ (Value::Object(_) | Value::Array(_)), Value::String(s)) => {
            serde_json::from_str::<Value>(s).ok().as_ref() == Some(other)
        }
        _ => false,
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub default: Option<String>,
    pub length: Option<u32>,
}

/// Target of an outgoing foreign key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub ref_schema: String,
    pub ref_table: String,
}

/// Introspected description of one table. Built once and not mutated after
/// overrides are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    pub schema_name: String,
    pub table_name: String,
    pub id_column_name: String,
    pub columns: Vec<ColumnMeta>,
    pub unique_column_groups: Vec<Vec<String>>,
    /// Foreign key column -> referenced table
    pub relations: BTreeMap<String, ForeignKeyRef>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn id_column(&self) -> Option<&ColumnMeta> {
        self.column(&self.id_column_name)
    }

    pub fn id_type(&self) -> SqlType {
        self.id_column()
            .map(|c| c.sql_type.clone())
            .unwrap_or(SqlType::Integer)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Merge caller overrides on top of the introspected values
    pub fn with_overrides(mut self, overrides: &TableOverrides) -> Result<Self> {
        if let Some(id) = &overrides.id_column {
            self.id_column_name = id.clone();
        }

        for column in &overrides.columns {
            let target = self
                .columns
                .iter_mut()
                .find(|c| c.name == column.name)
                .ok_or_else(|| {
                    EngineError::Schema(format!(
                        "override for unknown column {}.{}",
                        self.table_name, column.name
                    ))
                })?;
            if let Some(sql_type) = &column.sql_type {
                target.sql_type = sql_type.clone();
            }
            if let Some(nullable) = column.nullable {
                target.nullable = nullable;
            }
            if let Some(default) = &column.default {
                target.default = default.clone();
            }
            if let Some(length) = column.length {
                target.length = length;
            }
        }

        for group in &overrides.unique_column_groups {
            if let Some(missing) = group.iter().find(|c| !self.has_column(c)) {
                return Err(EngineError::Schema(format!(
                    "unique group on {} names unknown column {}",
                    self.table_name, missing
                )));
            }
            if !self.unique_column_groups.contains(group) {
                self.unique_column_groups.push(group.clone());
            }
        }

        for (column, target) in &overrides.relations {
            match target {
                Some(target) => {
                    self.relations.insert(column.clone(), target.clone());
                }
                None => {
                    self.relations.remove(column);
                }
            }
        }

        if !self.has_column(&self.id_column_name) {
            return Err(EngineError::Schema(format!(
                "table {} has no id column {}",
                self.table_name, self.id_column_name
            )));
        }

        Ok(self)
    }
}

/// Override of a single introspected column
#[derive(Debug, Clone, Default)]
pub struct ColumnOverride {
    pub name: String,
    pub sql_type: Option<SqlType>,
    pub nullable: Option<bool>,
    pub default: Option<Option<String>>,
    pub length: Option<Option<u32>>,
}

impl ColumnOverride {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn sql_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = Some(sql_type);
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn default_value(mut self, default: Option<&str>) -> Self {
        self.default = Some(default.map(String::from));
        self
    }

    pub fn length(mut self, length: Option<u32>) -> Self {
        self.length = Some(length);
        self
    }
}

/// Caller-supplied corrections to introspected metadata
#[derive(Debug, Clone, Default)]
pub struct TableOverrides {
    pub id_column: Option<String>,
    pub columns: Vec<ColumnOverride>,
    pub unique_column_groups: Vec<Vec<String>>,
    /// `None` removes an introspected relation
    pub relations: Vec<(String, Option<ForeignKeyRef>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items() -> TableMetadata {
        TableMetadata {
            schema_name: "main".to_string(),
            table_name: "items".to_string(),
            id_column_name: "id".to_string(),
            columns: vec![
                ColumnMeta {
                    name: "id".to_string(),
                    sql_type: SqlType::Integer,
                    nullable: true,
                    default: None,
                    length: None,
                },
                ColumnMeta {
                    name: "value".to_string(),
                    sql_type: SqlType::Varchar,
                    nullable: false,
                    default: None,
                    length: Some(8),
                },
                ColumnMeta {
                    name: "owner_id".to_string(),
                    sql_type: SqlType::Integer,
                    nullable: true,
                    default: None,
                    length: None,
                },
            ],
            unique_column_groups: vec![],
            relations: BTreeMap::from([(
                "owner_id".to_string(),
                ForeignKeyRef {
                    ref_schema: "main".to_string(),
                    ref_table: "users".to_string(),
                },
            )]),
        }
    }

    #[test]
    fn test_type_from_catalog() {
        assert_eq!(SqlType::from_catalog("VARCHAR(255)"), (SqlType::Varchar, Some(255)));
        assert_eq!(SqlType::from_catalog("int8"), (SqlType::BigInt, None));
        assert_eq!(SqlType::from_catalog("INTEGER"), (SqlType::Integer, None));
        assert_eq!(SqlType::from_catalog("numeric(10, 2)"), (SqlType::Numeric, None));
        assert_eq!(SqlType::from_catalog("timestamptz"), (SqlType::Timestamp, None));
        assert_eq!(SqlType::from_catalog("uuid"), (SqlType::Uuid, None));
        assert_eq!(
            SqlType::from_catalog("geometry"),
            (SqlType::Other("GEOMETRY".to_string()), None)
        );
    }

    #[test]
    fn test_coerce() {
        assert_eq!(SqlType::Integer.coerce(&json!("42")), Some(json!(42)));
        assert_eq!(SqlType::Integer.coerce(&json!(4.0)), Some(json!(4)));
        assert_eq!(SqlType::Integer.coerce(&json!("x")), None);
        assert_eq!(SqlType::Boolean.coerce(&json!("true")), Some(json!(true)));
        assert_eq!(SqlType::Boolean.coerce(&json!(0)), Some(json!(false)));
        assert_eq!(SqlType::Text.coerce(&json!(5)), Some(json!("5")));
        assert_eq!(SqlType::Text.coerce(&json!({"a": 1})), None);
        assert_eq!(SqlType::Real.coerce(&json!("1.5")), Some(json!(1.5)));
        assert_eq!(SqlType::Integer.coerce(&Value::Null), Some(Value::Null));
        assert_eq!(
            SqlType::Uuid.coerce(&json!("67E55044-10B1-426F-9247-BB680E5FE0C8")),
            Some(json!("67e55044-10b1-426f-9247-bb680e5fe0c8"))
        );
    }

    #[test]
    fn test_coerce_integer_range() {
        assert_eq!(SqlType::BigInt.coerce(&json!(1e30)), None);
        assert_eq!(SqlType::BigInt.coerce(&json!(-1e19)), None);
        assert_eq!(SqlType::BigInt.coerce(&json!(9.223372036854776e18)), None);
        assert_eq!(SqlType::BigInt.coerce(&json!(-9.0e18)), Some(json!(-9_000_000_000_000_000_000i64)));
        assert_eq!(SqlType::Integer.coerce(&json!(2.5)), None);
    }

    #[test]
    fn test_placeholders() {
        assert!(is_placeholder(&json!(0)));
        assert!(is_placeholder(&json!(NIL_UUID)));
        assert!(!is_placeholder(&json!(1)));
        assert_eq!(SqlType::Uuid.placeholder_id(), json!(NIL_UUID));
        assert_eq!(SqlType::BigInt.placeholder_id(), json!(0));
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&json!(1), &json!(true)));
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(values_equal(&json!("{\"a\":1}"), &json!({"a": 1})));
        assert!(!values_equal(&json!("a"), &json!("b")));
        assert!(!values_equal(&Value::Null, &json!(0)));
    }

    #[test]
    fn test_overrides_merge() {
        let overrides = TableOverrides {
            columns: vec![ColumnOverride::new("value").length(Some(16)).nullable(true)],
            unique_column_groups: vec![vec!["value".to_string()]],
            relations: vec![("owner_id".to_string(), None)],
            ..Default::default()
        };

        let merged = items().with_overrides(&overrides).unwrap();
        let value = merged.column("value").unwrap();
        assert_eq!(value.length, Some(16));
        assert!(value.nullable);
        assert_eq!(merged.unique_column_groups, vec![vec!["value".to_string()]]);
        assert!(merged.relations.is_empty());
    }

    #[test]
    fn test_overrides_reject_unknown_column() {
        let overrides = TableOverrides {
            columns: vec![ColumnOverride::new("missing").nullable(true)],
            ..Default::default()
        };
        assert!(matches!(
            items().with_overrides(&overrides),
            Err(EngineError::Schema(_))
        ));

        let overrides = TableOverrides {
            id_column: Some("uuid".to_string()),
            ..Default::default()
        };
        assert!(items().with_overrides(&overrides).is_err());
    }
}
