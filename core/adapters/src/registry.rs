//! Named index backends resolved from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use indexsync_common::{Error, Result};

use crate::index::IndexClient;
use crate::memory::MemoryIndex;
use crate::sqlite::SqliteIndex;

/// Builds an index client from its JSON configuration.
pub type IndexFactory = Box<dyn Fn(Value) -> Result<Arc<dyn IndexClient>> + Send + Sync>;

/// Index backends known by name.
///
/// Operators pick a backend in configuration; the registry turns that name
/// and its config block into a live client.
pub struct IndexRegistry {
    factories: HashMap<String, IndexFactory>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add a backend under `name`.
    ///
    /// # Errors
    /// - `InvalidInput` if the name is taken
    pub fn register(&mut self, name: impl Into<String>, factory: IndexFactory) -> Result<()> {
        let name = name.into();
        if self.has_backend(&name) {
            return Err(Error::InvalidInput(format!(
                "Index backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Open the backend `name` with `config`.
    ///
    /// # Errors
    /// - `NotFound` for an unknown name, listing the known ones
    /// - Whatever the factory reports for a bad config
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn IndexClient>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!(
                "Index backend '{}' is not registered (known: {})",
                name,
                self.backends().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Registered names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local index. Its contents vanish with the process, so it only
/// suits tests and embedding.
fn memory_factory(_config: Value) -> Result<Arc<dyn IndexClient>> {
    Ok(Arc::new(MemoryIndex::new()))
}

fn sqlite_factory(config: Value) -> Result<Arc<dyn IndexClient>> {
    let path = config
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput("sqlite index requires 'path'".to_string()))?;
    Ok(Arc::new(SqliteIndex::open(path)?))
}

/// Registry holding the built-in `memory` and `sqlite` backends.
pub fn create_default_registry() -> Result<IndexRegistry> {
    let mut registry = IndexRegistry::new();
    registry.register("memory", Box::new(memory_factory))?;
    registry.register("sqlite", Box::new(sqlite_factory))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = IndexRegistry::new();

        registry
            .register("test", Box::new(memory_factory))
            .unwrap();

        let index = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(index.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = IndexRegistry::new();

        registry
            .register("test", Box::new(memory_factory))
            .unwrap();

        let result = registry.register("test", Box::new(memory_factory));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_backend() {
        let registry = create_default_registry().unwrap();
        match registry.resolve("elastic", Value::Null) {
            Err(Error::NotFound(msg)) => assert!(msg.contains("memory, sqlite"), "{}", msg),
            _ => panic!("expected NotFound"),
        }
    }

    #[test]
    fn test_default_registry_backends() {
        let registry = create_default_registry().unwrap();
        assert_eq!(registry.backends(), vec!["memory", "sqlite"]);
        assert!(registry.has_backend("sqlite"));
    }

    #[test]
    fn test_sqlite_backend_requires_path() {
        let registry = create_default_registry().unwrap();
        assert!(matches!(
            registry.resolve("sqlite", serde_json::json!({})),
            Err(Error::InvalidInput(_))
        ));

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.db");
        let index = registry
            .resolve("sqlite", serde_json::json!({ "path": path.to_str().unwrap() }))
            .unwrap();
        assert_eq!(index.name(), "sqlite");
    }
}
