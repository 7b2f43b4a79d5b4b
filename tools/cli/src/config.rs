//! Operator configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexsync_adapters::{
    create_default_registry, IndexClient, SqliteRecordSource, TableMapping,
};
use indexsync_common::ClassTag;
use indexsync_engine::{EngineConfig, SyncEngine};

/// Backends that lose their contents when the process exits.
const EPHEMERAL_BACKENDS: &[&str] = &["memory"];

/// Which index backend to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSection {
    /// Registered backend name, e.g. "sqlite".
    pub backend: String,
    /// Backend-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Contents of `indexsync.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub index: IndexSection,
    /// SQLite database holding the records.
    pub store: PathBuf,
    /// Table mapping per record class.
    #[serde(default)]
    pub classes: BTreeMap<String, TableMapping>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: CliConfig = serde_json::from_str(raw)?;
        Ok(config)
    }

    /// Class tag for a name, provided the class is mapped.
    pub fn class(&self, name: &str) -> Result<ClassTag> {
        if !self.classes.contains_key(name) {
            anyhow::bail!(
                "Class {} is not configured. Known classes: {}",
                name,
                self.classes.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(ClassTag::new(name)?)
    }

    /// Open the index backend and wrap it in an engine.
    ///
    /// Every invocation is a separate process, so only backends that
    /// persist their contents are accepted.
    pub fn open_engine(&self) -> Result<SyncEngine<dyn IndexClient>> {
        let registry = create_default_registry()?;
        let backend = self.index.backend.as_str();
        if !registry.has_backend(backend) {
            anyhow::bail!(
                "Unknown index backend {}. Available: {}",
                backend,
                registry.backends().join(", ")
            );
        }
        if EPHEMERAL_BACKENDS.contains(&backend) {
            anyhow::bail!(
                "Index backend {} does not persist between runs; configure a durable backend such as sqlite",
                backend
            );
        }

        let index: Arc<dyn IndexClient> = registry
            .resolve(backend, self.index.config.clone())
            .with_context(|| format!("Failed to open {} index", backend))?;
        Ok(SyncEngine::from_arc(index, self.engine.clone()))
    }

    /// Open the record store with every configured class mapped.
    pub fn open_source(&self) -> Result<SqliteRecordSource> {
        let mut source = SqliteRecordSource::open(&self.store)
            .with_context(|| format!("Failed to open record store {}", self.store.display()))?;
        for (name, mapping) in &self.classes {
            source = source
                .with_table(ClassTag::new(name.as_str())?, mapping.clone())
                .with_context(|| format!("Invalid table mapping for {}", name))?;
        }
        source.check_tables().context("Record store is missing tables")?;
        Ok(source)
    }
}

/// Config pointing at a fresh store in `dir` holding articles 1 and 2.
#[cfg(test)]
pub(crate) fn sqlite_fixture(dir: &Path) -> CliConfig {
    let store = dir.join("records.db");
    let conn = rusqlite::Connection::open(&store).unwrap();
    conn.execute_batch(
        "CREATE TABLE articles (id INTEGER PRIMARY KEY, title TEXT);
         INSERT INTO articles VALUES (1, 'one'), (2, 'two');",
    )
    .unwrap();

    let mut config = CliConfig::parse(tests::SAMPLE).unwrap();
    config.store = store;
    config.index.config = serde_json::json!({ "path": dir.join("index.db") });
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexsync_adapters::RecordSource;
    use tempfile::TempDir;

    pub(super) const SAMPLE: &str = r#"{
        "index": { "backend": "sqlite", "config": { "path": "index.db" } },
        "store": "records.db",
        "classes": {
            "Article": { "table": "articles", "key_column": "id", "fields": ["title"] }
        }
    }"#;

    #[test]
    fn test_parse_uses_engine_defaults() {
        let config = CliConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.index.backend, "sqlite");
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.classes["Article"].fields, vec!["title".to_string()]);
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let config = CliConfig::parse(SAMPLE).unwrap();
        assert!(config.class("Article").is_ok());
        let err = config.class("Comment").unwrap_err();
        assert!(err.to_string().contains("Article"));
    }

    #[test]
    fn test_unknown_backend_lists_available() {
        let mut config = CliConfig::parse(SAMPLE).unwrap();
        config.index.backend = "elastic".to_string();
        let err = config.open_engine().err().unwrap();
        assert!(err.to_string().contains("memory, sqlite"), "{}", err);
    }

    #[test]
    fn test_memory_backend_is_refused() {
        let mut config = CliConfig::parse(SAMPLE).unwrap();
        config.index.backend = "memory".to_string();
        let err = config.open_engine().err().unwrap();
        assert!(err.to_string().contains("does not persist"), "{}", err);
    }

    #[tokio::test]
    async fn test_open_source_and_engine() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_fixture(dir.path());
        let source = config.open_source().unwrap();
        let engine = config.open_engine().unwrap();
        let class = config.class("Article").unwrap();

        assert_eq!(source.count(&class).await.unwrap(), 2);
        let report = engine
            .reindex_class(&source, &class, engine.default_reindex_options())
            .await
            .unwrap();
        assert_eq!(report.records_indexed, 2);
    }

    #[test]
    fn test_missing_table_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = CliConfig::parse(SAMPLE).unwrap();
        config.store = dir.path().join("empty.db");
        assert!(config.open_source().is_err());
    }
}
