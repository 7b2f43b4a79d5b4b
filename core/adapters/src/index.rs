//! Search index client trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use indexsync_common::{ClassTag, Error, RecordKey, Result};

/// Searchable representation of a record.
///
/// The primary key is always carried as a retrievable field so that the
/// index can be diffed against the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Class the backing record belongs to.
    pub class: ClassTag,
    /// Primary key of the backing record.
    pub key: RecordKey,
    /// Extracted text fields, by name.
    pub fields: BTreeMap<String, String>,
}

impl Document {
    /// Create a document with no fields.
    pub fn new(class: ClassTag, key: RecordKey) -> Self {
        Self {
            class,
            key,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// All field values joined for full-text indexing.
    pub fn body(&self) -> String {
        self.fields
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Query criteria understood by every index client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every document of the class.
    MatchAll,
    /// Documents matching a full-text term.
    Text(String),
    /// The document with the given key, if any.
    Key(RecordKey),
}

/// A single query hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHit {
    /// Stored primary key. `None` if the backend did not return it.
    pub key: Option<RecordKey>,
    /// Stored fields.
    pub fields: BTreeMap<String, String>,
}

/// Search index client for different backends.
///
/// Mutations are not visible to queries until [`IndexClient::commit`] is
/// called. Each call is at-least-once; implementations do not retry.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert or replace a single document.
    ///
    /// # Errors
    /// - `AdapterUnavailable` if the backend cannot be reached
    /// - `DocumentRejected` if the document cannot be indexed
    async fn index_one(&self, doc: &Document) -> Result<()>;

    /// Insert or replace a set of documents as one call.
    ///
    /// # Postconditions
    /// - On error, no document of the call is applied
    async fn index_many(&self, docs: &[Document]) -> Result<()>;

    /// Remove the document with the given key. Removing an absent key is not an error.
    async fn remove_one(&self, class: &ClassTag, key: &RecordKey) -> Result<()>;

    /// Remove every document of a class.
    async fn remove_all(&self, class: &ClassTag) -> Result<()>;

    /// Make all prior mutations durable and visible to queries.
    async fn commit(&self) -> Result<()>;

    /// Run a class-scoped query against committed documents.
    async fn query(&self, class: &ClassTag, query: &Query) -> Result<Vec<IndexHit>>;

    /// Run a query and return only primary keys.
    ///
    /// # Errors
    /// - `InvalidInput` if a hit does not carry its primary key
    async fn query_keys(&self, class: &ClassTag, query: &Query) -> Result<Vec<RecordKey>> {
        let hits = self.query(class, query).await?;
        hits.into_iter()
            .map(|hit| {
                hit.key.ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{} index returned a {} hit without a primary key",
                        self.name(),
                        class
                    ))
                })
            })
            .collect()
    }
}
