//! Record source trait and the `Syncable` capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use indexsync_common::{ClassTag, RecordKey, Result};

use crate::index::Document;

/// A record type that takes part in index synchronization.
///
/// Implementing this trait is the only way for a record to reach the index.
pub trait Syncable: Send + Sync {
    /// Class the record belongs to.
    fn class_tag(&self) -> ClassTag;

    /// Primary key, used for document identity and pagination order.
    fn primary_key(&self) -> RecordKey;

    /// Extract the searchable document.
    ///
    /// # Errors
    /// - `Serialization` if a field cannot be extracted
    fn to_document(&self) -> Result<Document>;
}

/// Placeholder carrying only a class and a key.
///
/// Used to remove index entries whose backing record is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStub {
    pub class: ClassTag,
    pub key: RecordKey,
}

impl KeyStub {
    pub fn new(class: ClassTag, key: RecordKey) -> Self {
        Self { class, key }
    }
}

impl Syncable for KeyStub {
    fn class_tag(&self) -> ClassTag {
        self.class.clone()
    }

    fn primary_key(&self) -> RecordKey {
        self.key.clone()
    }

    fn to_document(&self) -> Result<Document> {
        Ok(Document::new(self.class.clone(), self.key.clone()))
    }
}

/// Generic record made of named text fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub class: ClassTag,
    pub key: RecordKey,
    pub fields: BTreeMap<String, String>,
}

impl FieldRecord {
    pub fn new(class: ClassTag, key: impl Into<RecordKey>) -> Self {
        Self {
            class,
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl Syncable for FieldRecord {
    fn class_tag(&self) -> ClassTag {
        self.class.clone()
    }

    fn primary_key(&self) -> RecordKey {
        self.key.clone()
    }

    fn to_document(&self) -> Result<Document> {
        Ok(Document {
            class: self.class.clone(),
            key: self.key.clone(),
            fields: self.fields.clone(),
        })
    }
}

/// Read access to the system of record.
///
/// Pages are always ordered by primary key ascending so that consecutive
/// offsets never overlap.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Record type produced by this source.
    type Record: Syncable;

    /// Get the source name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Number of records in a class.
    async fn count(&self, class: &ClassTag) -> Result<u64>;

    /// Fetch up to `limit` records starting at `offset`, ordered by primary key.
    async fn fetch_page(
        &self,
        class: &ClassTag,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Self::Record>>;

    /// Fetch every record of a class in one call.
    async fn fetch_all(&self, class: &ClassTag) -> Result<Vec<Self::Record>>;

    /// Primary keys of every record in a class, without loading full records.
    async fn keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>>;
}
