use serde_json::{Map, Value};

/// Flat request parameters: column filters, `include`, `sort`, paging, modifiers
pub type Params = Map<String, Value>;

/// Per-request caller information handed to every policy, hook and modifier
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Authenticated principal, if any
    pub user_id: Option<Value>,
    /// Arbitrary claims (roles, tenant memberships, ...)
    pub claims: Map<String, Value>,
    /// Tag attached to emitted change batches so the initiator can recognize its own writes
    pub generation_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<Value>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn with_generation_id(mut self, id: impl Into<String>) -> Self {
        self.generation_id = Some(id.into());
        self
    }

    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }
}
