//! Core sync engine that orchestrates all index operations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use indexsync_adapters::{IndexClient, RecordSource, Syncable};
use indexsync_common::{ClassTag, RecordKey, Result};

use crate::batch::{BatchCoordinator, ReindexOptions, ReindexReport};
use crate::hooks::HookConfig;
use crate::orphans::{ConsistencyReport, OrphanReconciler, OrphanReport};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Records per reindex batch. `None` rebuilds a class in a single call.
    pub batch_size: Option<usize>,
    /// Commit after every reindex batch, not only at the end.
    pub commit_per_batch: bool,
    /// Lifecycle hook switches.
    pub hooks: HookConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(crate::batch::DEFAULT_BATCH_SIZE as usize),
            commit_per_batch: true,
            hooks: HookConfig::default(),
        }
    }
}

/// Main engine keeping an index in step with a record store.
///
/// The engine holds no locks of its own. Concurrent calls are serialized by
/// the index client.
pub struct SyncEngine<I: IndexClient + ?Sized> {
    /// Search index receiving all mutations.
    index: Arc<I>,
    /// Configuration.
    config: EngineConfig,
}

impl<I: IndexClient + 'static> SyncEngine<I> {
    /// Create a new sync engine.
    pub fn new(index: I, config: EngineConfig) -> Self {
        Self {
            index: Arc::new(index),
            config,
        }
    }
}

impl<I: IndexClient + ?Sized> SyncEngine<I> {
    /// Create a new sync engine from an Arc-wrapped index client.
    pub fn from_arc(index: Arc<I>, config: EngineConfig) -> Self {
        Self { index, config }
    }

    /// Get the index client.
    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reindex options derived from the configuration.
    pub fn default_reindex_options(&self) -> ReindexOptions {
        ReindexOptions::from(&self.config)
    }

    /// Send a record to the index. Not visible to queries until the next commit.
    pub async fn index_record<R: Syncable + ?Sized>(&self, record: &R) -> Result<()> {
        let doc = record.to_document()?;
        debug!("Indexing {} {}", doc.class, doc.key);
        self.index.index_one(&doc).await
    }

    /// Index a record and commit, so it is queryable on return.
    pub async fn index_record_and_commit<R: Syncable + ?Sized>(&self, record: &R) -> Result<()> {
        self.index_record(record).await?;
        self.index.commit().await
    }

    /// Remove a record's index entry. Not visible to queries until the next commit.
    pub async fn remove_record<R: Syncable + ?Sized>(&self, record: &R) -> Result<()> {
        let class = record.class_tag();
        let key = record.primary_key();
        debug!("Removing {} {}", class, key);
        self.index.remove_one(&class, &key).await
    }

    /// Remove a record's index entry and commit.
    pub async fn remove_record_and_commit<R: Syncable + ?Sized>(&self, record: &R) -> Result<()> {
        self.remove_record(record).await?;
        self.index.commit().await
    }

    /// Remove every index entry of a class.
    ///
    /// Until a commit follows, queries still see the old entries.
    pub async fn remove_all_of_class(&self, class: &ClassTag) -> Result<()> {
        info!("Removing all {} entries from the {} index", class, self.index.name());
        self.index.remove_all(class).await
    }

    /// Remove every index entry of a class and commit.
    pub async fn remove_all_of_class_and_commit(&self, class: &ClassTag) -> Result<()> {
        self.remove_all_of_class(class).await?;
        self.index.commit().await
    }

    /// Commit pending index mutations.
    pub async fn commit(&self) -> Result<()> {
        self.index.commit().await
    }

    /// Rebuild the index for a class from the record source.
    ///
    /// Always ends with a commit, so the rebuilt entries are visible on return.
    ///
    /// # Errors
    /// - `InvalidBatchSize` before anything is removed
    /// - `AdapterUnavailable` if either backend fails
    /// - `PartialBatchFailure` if a record cannot be indexed
    /// - `Cancelled` if the cancel flag was raised between batches
    pub async fn reindex_class<S: RecordSource>(
        &self,
        source: &S,
        class: &ClassTag,
        options: ReindexOptions,
    ) -> Result<ReindexReport> {
        BatchCoordinator::new(self, source).run(class, options).await
    }

    /// Keys present in the index but absent from the record source.
    pub async fn find_orphans<S: RecordSource>(
        &self,
        source: &S,
        class: &ClassTag,
    ) -> Result<Vec<RecordKey>> {
        OrphanReconciler::new(self, source).find_orphans(class).await
    }

    /// Remove orphaned index entries without committing.
    pub async fn repair_orphans<S: RecordSource>(
        &self,
        source: &S,
        class: &ClassTag,
    ) -> Result<OrphanReport> {
        OrphanReconciler::new(self, source).repair_orphans(class).await
    }

    /// Remove orphaned index entries and commit.
    pub async fn repair_orphans_and_commit<S: RecordSource>(
        &self,
        source: &S,
        class: &ClassTag,
    ) -> Result<OrphanReport> {
        OrphanReconciler::new(self, source)
            .repair_orphans_and_commit(class)
            .await
    }

    /// Compare index and record source in both directions.
    pub async fn verify_class<S: RecordSource>(
        &self,
        source: &S,
        class: &ClassTag,
    ) -> Result<ConsistencyReport> {
        OrphanReconciler::new(self, source).verify(class).await
    }
}
