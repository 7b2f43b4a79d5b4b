//! Orphan detection and repair.
//!
//! An orphan is an index entry whose backing record no longer exists.
//! Detection loads the indexed keys and the stored keys of a class and takes
//! the set difference in memory.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use indexsync_adapters::{IndexClient, KeyStub, Query, RecordSource};
use indexsync_common::{ClassTag, Error, RecordKey, Result};

use crate::engine::SyncEngine;

/// Outcome of an orphan repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub class: ClassTag,
    /// Orphaned keys found by the scan.
    pub orphans: Vec<RecordKey>,
    /// Removals issued.
    pub removed: usize,
    /// Whether the removals were committed.
    pub committed: bool,
}

impl OrphanReport {
    /// Whether the scan found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Two-way comparison of index and record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub class: ClassTag,
    pub indexed: usize,
    pub stored: usize,
    /// In the index, not in the store.
    pub orphans: Vec<RecordKey>,
    /// In the store, not in the index.
    pub missing: Vec<RecordKey>,
    /// Keys with more than one index entry.
    pub duplicates: Vec<RecordKey>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty() && self.duplicates.is_empty()
    }
}

/// Keys of `indexed` that do not appear in `stored`, sorted and deduplicated.
pub fn orphan_keys(indexed: &[RecordKey], stored: &[RecordKey]) -> Vec<RecordKey> {
    let stored: BTreeSet<&RecordKey> = stored.iter().collect();
    indexed
        .iter()
        .filter(|key| !stored.contains(key))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Finds and removes index entries with no backing record.
pub struct OrphanReconciler<'a, I: IndexClient + ?Sized, S> {
    engine: &'a SyncEngine<I>,
    source: &'a S,
}

impl<'a, I: IndexClient + ?Sized, S: RecordSource> OrphanReconciler<'a, I, S> {
    pub fn new(engine: &'a SyncEngine<I>, source: &'a S) -> Self {
        Self { engine, source }
    }

    async fn indexed_keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
        self.engine
            .index()
            .query_keys(class, &Query::MatchAll)
            .await
            .map_err(|err| {
                Error::OrphanScanIncomplete(format!("index query for {} failed: {}", class, err))
            })
    }

    async fn stored_keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
        self.source.keys(class).await.map_err(|err| {
            Error::OrphanScanIncomplete(format!("record store scan for {} failed: {}", class, err))
        })
    }

    /// Keys present in the index but absent from the record store.
    ///
    /// # Errors
    /// - `OrphanScanIncomplete` if either side cannot be read completely
    pub async fn find_orphans(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
        let indexed = self.indexed_keys(class).await?;
        let stored = self.stored_keys(class).await?;

        let orphans = orphan_keys(&indexed, &stored);
        info!(
            class = %class,
            indexed = indexed.len(),
            stored = stored.len(),
            orphans = orphans.len(),
            "Orphan scan finished"
        );
        Ok(orphans)
    }

    /// Remove every orphan through the engine's single-record path.
    ///
    /// Nothing is committed; removals become visible with the next commit.
    pub async fn repair_orphans(&self, class: &ClassTag) -> Result<OrphanReport> {
        let orphans = self.find_orphans(class).await?;

        let mut removed = 0;
        for key in &orphans {
            let stub = KeyStub::new(class.clone(), key.clone());
            if let Err(err) = self.engine.remove_record(&stub).await {
                warn!(
                    class = %class,
                    "Orphan repair stopped after {} of {} removals: {}",
                    removed,
                    orphans.len(),
                    err
                );
                return Err(err);
            }
            removed += 1;
        }

        if removed > 0 {
            info!(class = %class, "Removed {} orphaned index entries", removed);
        }
        Ok(OrphanReport {
            class: class.clone(),
            orphans,
            removed,
            committed: false,
        })
    }

    /// Remove every orphan and commit.
    pub async fn repair_orphans_and_commit(&self, class: &ClassTag) -> Result<OrphanReport> {
        let mut report = self.repair_orphans(class).await?;
        self.engine.commit().await?;
        report.committed = true;
        Ok(report)
    }

    /// Compare index and record store in both directions.
    pub async fn verify(&self, class: &ClassTag) -> Result<ConsistencyReport> {
        let indexed = self.indexed_keys(class).await?;
        let stored = self.stored_keys(class).await?;

        let mut seen: BTreeMap<&RecordKey, usize> = BTreeMap::new();
        for key in &indexed {
            *seen.entry(key).or_default() += 1;
        }
        let duplicates = seen
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(key, _)| (*key).clone())
            .collect();

        let report = ConsistencyReport {
            class: class.clone(),
            indexed: indexed.len(),
            stored: stored.len(),
            orphans: orphan_keys(&indexed, &stored),
            missing: orphan_keys(&stored, &indexed),
            duplicates,
        };
        if !report.is_consistent() {
            warn!(
                class = %class,
                orphans = report.orphans.len(),
                missing = report.missing.len(),
                duplicates = report.duplicates.len(),
                "Index and record store diverge"
            );
        }
        Ok(report)
    }
}
