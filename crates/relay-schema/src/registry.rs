//! Concurrent schema registry

use crate::model::Schema;
use dashmap::DashMap;

/// Cache of fully merged schemas keyed by name. Safe to share across
/// worker tasks.
pub struct SchemaRegistry {
    schemas: DashMap<String, Schema>,
}

impl SchemaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    /// Register a schema under a name
    pub fn register(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.insert(name.into(), schema);
    }

    /// Get a schema by name
    pub fn get(&self, name: &str) -> Option<Schema> {
        self.schemas.get(name).map(|entry| entry.value().clone())
    }

    /// Check if a schema is registered
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Number of cached schemas
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
