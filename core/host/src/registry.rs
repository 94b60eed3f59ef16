//! Adapter registry mapping entity types to host file adapters.

use std::collections::HashMap;
use std::sync::Arc;

use cloudshelf_common::{Error, Result};

use crate::ports::FileAdapter;

/// Registry of host file adapters.
///
/// Built once at configuration time; the sync engine resolves adapters by
/// the entity type named in each model config.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn FileAdapter>>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its entity type.
    ///
    /// # Preconditions
    /// - The adapter's entity type must be unique within the registry
    ///
    /// # Errors
    /// - `Validation` if the entity type is empty or already registered
    pub fn register(&mut self, adapter: Arc<dyn FileAdapter>) -> Result<()> {
        let entity_type = adapter.entity_type().to_string();
        if entity_type.is_empty() {
            return Err(Error::Validation("Adapter entity type is empty".to_string()));
        }
        if self.adapters.contains_key(&entity_type) {
            return Err(Error::Validation(format!(
                "Adapter for '{}' is already registered",
                entity_type
            )));
        }
        self.adapters.insert(entity_type, adapter);
        Ok(())
    }

    /// Resolve the adapter for an entity type.
    ///
    /// # Errors
    /// - `Validation` if no adapter is registered for it
    pub fn resolve(&self, entity_type: &str) -> Result<Arc<dyn FileAdapter>> {
        self.adapters.get(entity_type).cloned().ok_or_else(|| {
            Error::Validation(format!("No adapter registered for '{}'", entity_type))
        })
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }

    /// Check if an entity type has an adapter.
    pub fn has_adapter(&self, entity_type: &str) -> bool {
        self.adapters.contains_key(entity_type)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
