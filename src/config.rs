use crate::error::{EngineError, Result};
use serde::Deserialize;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every generated URL, without a trailing slash
    pub base_url: String,
    /// Page size when `limit` is not given
    pub default_limit: usize,
    /// Upper clamp for `limit`
    pub max_limit: usize,
    /// Rows per included hasMany relation
    pub has_many_limit: usize,
    /// Upper clamp for the ids pipeline
    pub max_ids: usize,
    /// Complexity units available to one write graph
    pub complexity_budget: i64,
    /// Suffix stripped from foreign key columns to name hasOne relations
    pub id_suffix: String,
    /// Timestamp column of soft-deletable tables
    pub deleted_at_column: String,
    /// Schema holding the tables; the dialect default when unset
    pub schema: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_limit: 50,
            max_limit: 250,
            has_many_limit: 10,
            max_ids: 100_000,
            complexity_budget: 1000,
            id_suffix: "_id".to_string(),
            deleted_at_column: "deleted_at".to_string(),
            schema: None,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML document; absent keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_limit > self.max_limit {
            return Err(EngineError::Config(format!(
                "default_limit {} exceeds max_limit {}",
                self.default_limit, self.max_limit
            )));
        }
        if self.complexity_budget <= 0 {
            return Err(EngineError::Config(
                "complexity_budget must be positive".to_string(),
            ));
        }
        if self.deleted_at_column.is_empty() {
            return Err(EngineError::Config(
                "deleted_at_column must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_limit, 50);
        assert_eq!(config.max_limit, 250);
        assert_eq!(config.has_many_limit, 10);
        assert_eq!(config.max_ids, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            base_url = "https://api.example.com/v1/"
            default_limit = 20
            complexity_budget = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.default_limit, 20);
        assert_eq!(config.complexity_budget, 5);
        assert_eq!(config.max_limit, 250);
        assert_eq!(config.base(), "https://api.example.com/v1");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            EngineConfig::from_toml_str("default_limit = 500"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("default_limit = \"many\""),
            Err(EngineError::Config(_))
        ));
    }
}
