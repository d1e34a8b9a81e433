use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// One entry of a [`ValidationErrors`] map.
///
/// The shape mirrors the write graph: a scalar column gets a message, a
/// hasOne relation gets a nested error object and a hasMany relation gets a
/// sparse map from child index to that child's errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldError {
    Message(String),
    Nested(ValidationErrors),
    Items(BTreeMap<usize, ValidationErrors>),
}

/// Field-keyed validation errors. An empty map means the input is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Single-field error set
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Record a message for a field. The first message recorded for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0
            .entry(field.into())
            .or_insert_with(|| FieldError::Message(message.into()));
    }

    /// Attach the errors of a hasOne child. Empty child errors are dropped.
    pub fn nest(&mut self, relation: impl Into<String>, errors: ValidationErrors) {
        if !errors.is_empty() {
            self.0.insert(relation.into(), FieldError::Nested(errors));
        }
    }

    /// Attach the errors of the `index`-th hasMany child.
    pub fn item(&mut self, relation: impl Into<String>, index: usize, errors: ValidationErrors) {
        if errors.is_empty() {
            return;
        }
        let entry = self
            .0
            .entry(relation.into())
            .or_insert_with(|| FieldError::Items(BTreeMap::new()));
        if let FieldError::Items(items) = entry {
            items.insert(index, errors);
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldError> {
        self.0.get(field)
    }

    /// Message recorded for a scalar field, if any
    pub fn message(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(FieldError::Message(msg)) => Some(msg.as_str()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldError)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Bad request: {0}")]
    BadRequest(ValidationErrors),

    /// Policy rejection or a row that vanished. Never says which.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Write graph exceeds the complexity budget")]
    Complexity,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for a single-field [`EngineError::BadRequest`]
    pub fn bad_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::BadRequest(ValidationErrors::single(field, message))
    }

    /// HTTP-style status code for the boundary layer
    pub fn status(&self) -> u16 {
        match self {
            EngineError::BadRequest(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::NotFound => 404,
            EngineError::Conflict(_) => 409,
            EngineError::Complexity => 413,
            _ => 500,
        }
    }

    /// Validation errors carried by a bad request
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            EngineError::BadRequest(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match &err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => EngineError::Conflict(db.message().to_string()),
                _ => EngineError::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                EngineError::Connection(err.to_string())
            }
            _ => EngineError::Database(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}
