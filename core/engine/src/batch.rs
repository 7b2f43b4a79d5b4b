//! Batched full rebuild of a record class.
//!
//! A rebuild clears the class from the index, streams the record source
//! page by page in primary-key order, indexes each page with one call and
//! finishes with an unconditional commit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use indexsync_adapters::{Document, IndexClient, RecordSource, Syncable};
use indexsync_common::{ClassTag, Error, Result};

use crate::engine::{EngineConfig, SyncEngine};

/// Batch size used when the caller does not choose one.
pub const DEFAULT_BATCH_SIZE: i64 = 500;

/// Per-call options for a rebuild.
#[derive(Debug, Clone)]
pub struct ReindexOptions {
    /// Records per batch. `None` indexes the whole class in one call.
    pub batch_size: Option<i64>,
    /// Commit after every batch in addition to the final commit.
    pub commit_per_batch: bool,
    /// Checked between batches; when raised the rebuild stops.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ReindexOptions {
    /// Index the whole class in a single call.
    pub fn unbatched() -> Self {
        Self {
            batch_size: None,
            ..Self::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Enable or disable per-batch commits.
    pub fn with_commit_per_batch(mut self, commit_per_batch: bool) -> Self {
        self.commit_per_batch = commit_per_batch;
        self
    }

    /// Attach a cooperative cancel flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Validated page size, `None` for the unbatched path.
    ///
    /// # Errors
    /// - `InvalidBatchSize` if the size is zero or negative
    pub fn page_size(&self) -> Result<Option<u64>> {
        match self.batch_size {
            None => Ok(None),
            Some(size) if size > 0 => Ok(Some(size as u64)),
            Some(size) => Err(Error::InvalidBatchSize(size)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            batch_size: Some(DEFAULT_BATCH_SIZE),
            commit_per_batch: true,
            cancel: None,
        }
    }
}

impl From<&EngineConfig> for ReindexOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config
                .batch_size
                .map(|size| i64::try_from(size).unwrap_or(i64::MAX)),
            commit_per_batch: config.commit_per_batch,
            cancel: None,
        }
    }
}

/// Position of a rebuild in its class. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    pub offset: u64,
    pub limit: u64,
    pub record_count: u64,
    /// Number of the next batch, starting at 1.
    pub batch_number: u64,
}

impl BatchCursor {
    pub fn new(limit: u64, record_count: u64) -> Self {
        Self {
            offset: 0,
            limit,
            record_count,
            batch_number: 1,
        }
    }

    /// Whether records remain past the current offset.
    pub fn has_more(&self) -> bool {
        self.offset < self.record_count
    }

    /// Move to the next page.
    pub fn advance(&mut self) {
        self.offset = self.offset.saturating_add(self.limit);
        self.batch_number += 1;
    }
}

/// Timing of a single indexed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub batch_number: u64,
    pub offset: u64,
    /// Records indexed in this batch.
    pub size: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub records_per_sec: f64,
    /// Whether a commit followed this batch.
    pub committed: bool,
}

impl BatchStats {
    fn throughput(size: usize, elapsed: Duration) -> f64 {
        // Clamp so a sub-microsecond batch does not divide by zero.
        size as f64 / elapsed.as_secs_f64().max(1e-6)
    }
}

/// Outcome of a completed rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub run_id: Uuid,
    pub class: ClassTag,
    pub started_at: DateTime<Utc>,
    /// Whether the class was paged or fetched in one call.
    pub batched: bool,
    pub records_indexed: u64,
    pub batches: Vec<BatchStats>,
    /// Commits issued, including the final one.
    pub commits: u64,
    pub elapsed: Duration,
}

impl ReindexReport {
    /// Sizes of the indexed batches, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.size).collect()
    }
}

/// Streams a record class into the index in bounded chunks.
pub struct BatchCoordinator<'a, I: IndexClient + ?Sized, S> {
    engine: &'a SyncEngine<I>,
    source: &'a S,
}

impl<'a, I: IndexClient + ?Sized, S: RecordSource> BatchCoordinator<'a, I, S> {
    pub fn new(engine: &'a SyncEngine<I>, source: &'a S) -> Self {
        Self { engine, source }
    }

    /// Run a full rebuild of `class`.
    pub async fn run(&self, class: &ClassTag, options: ReindexOptions) -> Result<ReindexReport> {
        // Validate before anything destructive happens.
        let page_size = options.page_size()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(
            %run_id,
            class = %class,
            batch_size = ?page_size,
            commit_per_batch = options.commit_per_batch,
            "Starting reindex"
        );

        self.engine.remove_all_of_class(class).await?;

        let mut batches = Vec::new();
        let mut commits = 0u64;

        match page_size {
            None => {
                let records = self.source.fetch_all(class).await?;
                if !records.is_empty() {
                    batches.push(self.index_batch(class, 1, 0, &records).await?);
                }
            }
            Some(limit) => {
                let record_count = self.source.count(class).await?;
                let mut cursor = BatchCursor::new(limit, record_count);
                debug!("{} has {} records, {} per batch", class, record_count, limit);

                while cursor.has_more() {
                    if options.is_cancelled() {
                        warn!(%run_id, class = %class, "Reindex cancelled at offset {}", cursor.offset);
                        return Err(Error::Cancelled(format!(
                            "reindex of {} stopped after {} batches",
                            class,
                            batches.len()
                        )));
                    }

                    let page = self
                        .source
                        .fetch_page(class, cursor.offset, cursor.limit)
                        .await?;
                    if page.is_empty() {
                        // Records were deleted since the count was taken.
                        warn!(
                            class = %class,
                            "Source returned no records at offset {} of {}",
                            cursor.offset, cursor.record_count
                        );
                        break;
                    }

                    let mut stats = self
                        .index_batch(class, cursor.batch_number, cursor.offset, &page)
                        .await?;
                    if options.commit_per_batch {
                        self.engine.commit().await?;
                        commits += 1;
                        stats.committed = true;
                    }
                    batches.push(stats);
                    cursor.advance();
                }
            }
        }

        self.engine.commit().await?;
        commits += 1;

        let report = ReindexReport {
            run_id,
            class: class.clone(),
            started_at,
            batched: page_size.is_some(),
            records_indexed: batches.iter().map(|b| b.size as u64).sum(),
            batches,
            commits,
            elapsed: start.elapsed(),
        };
        info!(
            %run_id,
            class = %class,
            records = report.records_indexed,
            batches = report.batches.len(),
            commits = report.commits,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Reindex completed"
        );
        Ok(report)
    }

    /// Index one page as a single call.
    ///
    /// Any record that fails aborts the whole batch.
    async fn index_batch(
        &self,
        class: &ClassTag,
        batch_number: u64,
        offset: u64,
        records: &[S::Record],
    ) -> Result<BatchStats> {
        let started_at = Utc::now();
        let start = Instant::now();

        let docs = records
            .iter()
            .map(|record| Self::document_for(class, batch_number, record))
            .collect::<Result<Vec<Document>>>()?;

        self.engine
            .index()
            .index_many(&docs)
            .await
            .map_err(|err| match err {
                Error::DocumentRejected { key, reason } => Error::PartialBatchFailure {
                    batch: batch_number,
                    key,
                    reason,
                },
                other => other,
            })?;

        let elapsed = start.elapsed();
        let stats = BatchStats {
            batch_number,
            offset,
            size: docs.len(),
            started_at,
            elapsed,
            records_per_sec: BatchStats::throughput(docs.len(), elapsed),
            committed: false,
        };
        info!(
            class = %class,
            batch = stats.batch_number,
            offset = stats.offset,
            size = stats.size,
            elapsed_ms = elapsed.as_millis() as u64,
            records_per_sec = stats.records_per_sec,
            "Indexed batch"
        );
        Ok(stats)
    }

    fn document_for(class: &ClassTag, batch: u64, record: &S::Record) -> Result<Document> {
        let doc = record.to_document().map_err(|err| Error::PartialBatchFailure {
            batch,
            key: record.primary_key(),
            reason: err.to_string(),
        })?;
        if &doc.class != class {
            return Err(Error::PartialBatchFailure {
                batch,
                key: doc.key,
                reason: format!("record belongs to {}, not {}", doc.class, class),
            });
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{article, record, seeded_source};
    use indexsync_adapters::{FieldRecord, MemoryIndex, MemoryRecordSource, Query};
    use indexsync_common::RecordKey;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU64;

    /// Wraps a memory source to mimic records deleted while a rebuild runs
    /// and an operator interrupting it.
    struct ScriptedSource {
        inner: MemoryRecordSource<FieldRecord>,
        /// Added to the real count, as if those records were deleted after counting.
        vanished: u64,
        /// Raise the flag once this many pages have been served.
        cancel_after: Option<(u64, Arc<AtomicBool>)>,
        pages: AtomicU64,
    }

    impl ScriptedSource {
        fn new(inner: MemoryRecordSource<FieldRecord>) -> Self {
            Self {
                inner,
                vanished: 0,
                cancel_after: None,
                pages: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        type Record = FieldRecord;

        fn name(&self) -> &str {
            "scripted"
        }

        async fn count(&self, class: &ClassTag) -> Result<u64> {
            Ok(self.inner.count(class).await? + self.vanished)
        }

        async fn fetch_page(
            &self,
            class: &ClassTag,
            offset: u64,
            limit: u64,
        ) -> Result<Vec<FieldRecord>> {
            let page = self.inner.fetch_page(class, offset, limit).await?;
            let served = self.pages.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, flag)) = &self.cancel_after {
                if served >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(page)
        }

        async fn fetch_all(&self, class: &ClassTag) -> Result<Vec<FieldRecord>> {
            self.inner.fetch_all(class).await
        }

        async fn keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
            self.inner.keys(class).await
        }
    }

    fn engine() -> SyncEngine<MemoryIndex> {
        SyncEngine::new(MemoryIndex::new(), EngineConfig::default())
    }

    fn keys(range: std::ops::RangeInclusive<i64>) -> Vec<RecordKey> {
        range.map(RecordKey::Int).collect()
    }

    #[test]
    fn test_cursor_progression() {
        let mut cursor = BatchCursor::new(500, 1200);
        let mut offsets = Vec::new();
        while cursor.has_more() {
            offsets.push((cursor.batch_number, cursor.offset));
            cursor.advance();
        }
        assert_eq!(offsets, vec![(1, 0), (2, 500), (3, 1000)]);
    }

    #[test]
    fn test_page_size_validation() {
        assert_eq!(ReindexOptions::default().page_size().unwrap(), Some(500));
        assert_eq!(ReindexOptions::unbatched().page_size().unwrap(), None);
        assert!(matches!(
            ReindexOptions::default().with_batch_size(0).page_size(),
            Err(Error::InvalidBatchSize(0))
        ));
        assert!(matches!(
            ReindexOptions::default().with_batch_size(-5).page_size(),
            Err(Error::InvalidBatchSize(-5))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let config = EngineConfig {
            batch_size: None,
            commit_per_batch: false,
            ..EngineConfig::default()
        };
        let options = ReindexOptions::from(&config);
        assert_eq!(options.batch_size, None);
        assert!(!options.commit_per_batch);
    }

    #[tokio::test]
    async fn test_article_example_commit_per_batch() {
        let engine = engine();
        let source = seeded_source(1200);

        let report = engine
            .reindex_class(&source, &article(), ReindexOptions::default())
            .await
            .unwrap();

        assert_eq!(report.batch_sizes(), vec![500, 500, 200]);
        assert_eq!(report.commits, 4);
        assert_eq!(engine.index().commit_count(), 4);
        assert_eq!(report.records_indexed, 1200);
        assert!(report.batches.iter().all(|b| b.committed));
        assert_eq!(engine.index().committed_keys(&article()), keys(1..=1200));
    }

    #[tokio::test]
    async fn test_article_example_single_commit() {
        let engine = engine();
        let source = seeded_source(1200);

        let report = engine
            .reindex_class(
                &source,
                &article(),
                ReindexOptions::default().with_commit_per_batch(false),
            )
            .await
            .unwrap();

        assert_eq!(report.batch_sizes(), vec![500, 500, 200]);
        assert_eq!(report.commits, 1);
        assert_eq!(engine.index().commit_count(), 1);
        assert!(report.batches.iter().all(|b| !b.committed));
    }

    #[tokio::test]
    async fn test_empty_class_reindex_commits() {
        let engine = engine();
        let source = seeded_source(0);

        let report = engine
            .reindex_class(&source, &article(), ReindexOptions::default())
            .await
            .unwrap();

        assert!(report.batches.is_empty());
        assert_eq!(report.commits, 1);
        assert!(engine.index().committed_keys(&article()).is_empty());
        assert!(!engine.index().has_pending_changes());
    }

    #[tokio::test]
    async fn test_invalid_batch_size_removes_nothing() {
        let engine = engine();
        engine.index_record_and_commit(&record(42)).await.unwrap();
        let source = seeded_source(10);

        for size in [0, -1] {
            let result = engine
                .reindex_class(
                    &source,
                    &article(),
                    ReindexOptions::default().with_batch_size(size),
                )
                .await;
            assert!(matches!(result, Err(Error::InvalidBatchSize(s)) if s == size));
        }

        assert_eq!(engine.index().working_keys(&article()), vec![RecordKey::Int(42)]);
        assert_eq!(engine.index().commit_count(), 1);
    }

    #[tokio::test]
    async fn test_unbatched_matches_batched_coverage() {
        let source = seeded_source(137);

        let batched = engine();
        batched
            .reindex_class(&source, &article(), ReindexOptions::default().with_batch_size(50))
            .await
            .unwrap();

        let unbatched = engine();
        let report = unbatched
            .reindex_class(&source, &article(), ReindexOptions::unbatched())
            .await
            .unwrap();

        assert!(!report.batched);
        assert_eq!(report.batch_sizes(), vec![137]);
        // No page-by-page commits on the unbatched path.
        assert_eq!(report.commits, 1);
        assert_eq!(
            batched.index().committed_keys(&article()),
            unbatched.index().committed_keys(&article())
        );
    }

    #[tokio::test]
    async fn test_reindex_clears_stale_entries() {
        let engine = engine();
        engine.index_record_and_commit(&record(999)).await.unwrap();
        let source = seeded_source(5);

        engine
            .reindex_class(&source, &article(), ReindexOptions::default().with_batch_size(2))
            .await
            .unwrap();

        assert_eq!(engine.index().committed_keys(&article()), keys(1..=5));
    }

    #[tokio::test]
    async fn test_reindex_leaves_other_classes_alone() {
        let engine = engine();
        let comment = ClassTag::new("Comment").unwrap();
        engine
            .index_record_and_commit(&FieldRecord::new(comment.clone(), RecordKey::Int(1)))
            .await
            .unwrap();

        engine
            .reindex_class(&seeded_source(3), &article(), ReindexOptions::default())
            .await
            .unwrap();

        assert_eq!(engine.index().committed_keys(&comment), vec![RecordKey::Int(1)]);
    }

    #[tokio::test]
    async fn test_rejected_document_aborts_batch() {
        let engine = engine();
        engine.index().reject_key(RecordKey::Int(7));
        let source = seeded_source(12);

        let result = engine
            .reindex_class(&source, &article(), ReindexOptions::default().with_batch_size(5))
            .await;

        match result {
            Err(Error::PartialBatchFailure { batch, key, .. }) => {
                assert_eq!(batch, 2);
                assert_eq!(key, RecordKey::Int(7));
            }
            other => panic!("expected PartialBatchFailure, got {:?}", other.map(|r| r.commits)),
        }
        // First batch committed, second never applied, no final commit.
        assert_eq!(engine.index().commit_count(), 1);
        assert_eq!(engine.index().committed_keys(&article()), keys(1..=5));
    }

    #[derive(Clone)]
    struct BrokenRecord {
        key: i64,
        broken: bool,
    }

    impl Syncable for BrokenRecord {
        fn class_tag(&self) -> ClassTag {
            article()
        }

        fn primary_key(&self) -> RecordKey {
            RecordKey::Int(self.key)
        }

        fn to_document(&self) -> Result<Document> {
            if self.broken {
                return Err(Error::Serialization("title is not valid UTF-8".to_string()));
            }
            Ok(Document::new(article(), self.primary_key()))
        }
    }

    #[tokio::test]
    async fn test_serialization_failure_aborts_batch() {
        let engine = engine();
        let source = MemoryRecordSource::new();
        for key in 1..=4 {
            source.insert(BrokenRecord { key, broken: key == 3 });
        }

        let result = engine
            .reindex_class(&source, &article(), ReindexOptions::unbatched())
            .await;

        match result {
            Err(Error::PartialBatchFailure { batch, key, reason }) => {
                assert_eq!(batch, 1);
                assert_eq!(key, RecordKey::Int(3));
                assert!(reason.contains("UTF-8"));
            }
            other => panic!("expected PartialBatchFailure, got {:?}", other.map(|r| r.commits)),
        }
        assert!(engine.index().working_keys(&article()).is_empty());
    }

    #[tokio::test]
    async fn test_source_failure_mid_rebuild_propagates() {
        let engine = engine();
        let source = seeded_source(30);
        source.fail_after_pages(2);

        let result = engine
            .reindex_class(&source, &article(), ReindexOptions::default().with_batch_size(10))
            .await;

        assert!(matches!(result, Err(Error::AdapterUnavailable(_))));
        assert_eq!(engine.index().commit_count(), 2);
        assert_eq!(engine.index().committed_keys(&article()), keys(1..=20));
    }

    #[tokio::test]
    async fn test_index_offline_aborts_before_fetching() {
        let engine = engine();
        engine.index().set_unavailable(true);

        let result = engine
            .reindex_class(&seeded_source(3), &article(), ReindexOptions::default())
            .await;
        assert!(matches!(result, Err(Error::AdapterUnavailable(_))));
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_between_batches() {
        let engine = engine();
        let flag = Arc::new(AtomicBool::new(true));

        let result = engine
            .reindex_class(
                &seeded_source(10),
                &article(),
                ReindexOptions::default()
                    .with_batch_size(3)
                    .with_cancel_flag(flag),
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(engine.index().commit_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_committed_batch_keeps_it() {
        let engine = engine();
        let flag = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(seeded_source(10));
        source.cancel_after = Some((1, flag.clone()));

        let result = engine
            .reindex_class(
                &source,
                &article(),
                ReindexOptions::default()
                    .with_batch_size(3)
                    .with_cancel_flag(flag),
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
        // Batch 1 was committed before the flag was seen; no final commit.
        assert_eq!(engine.index().commit_count(), 1);
        assert_eq!(engine.index().committed_keys(&article()), keys(1..=3));
        assert!(!engine.index().has_pending_changes());
    }

    #[tokio::test]
    async fn test_empty_page_mid_rebuild_stops_and_commits() {
        let engine = engine();
        let mut source = ScriptedSource::new(seeded_source(5));
        source.vanished = 5;

        let report = engine
            .reindex_class(&source, &article(), ReindexOptions::default().with_batch_size(2))
            .await
            .unwrap();

        assert_eq!(report.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(report.records_indexed, 5);
        // Three per-batch commits plus the final one.
        assert_eq!(report.commits, 4);
        assert_eq!(engine.index().commit_count(), 4);
        assert_eq!(engine.index().committed_keys(&article()), keys(1..=5));
    }

    #[tokio::test]
    async fn test_unbatched_empty_class_skips_index_call() {
        let engine = engine();
        engine.index_record_and_commit(&record(9)).await.unwrap();

        let report = engine
            .reindex_class(&seeded_source(0), &article(), ReindexOptions::unbatched())
            .await
            .unwrap();

        assert!(!report.batched);
        assert!(report.batches.is_empty());
        assert_eq!(report.commits, 1);
        assert_eq!(engine.index().index_many_count(), 0);
        assert_eq!(engine.index().commit_count(), 2);
        assert!(engine.index().committed_keys(&article()).is_empty());
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let engine = engine();
        let report = engine
            .reindex_class(&seeded_source(3), &article(), ReindexOptions::default())
            .await
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["class"], "Article");
        assert_eq!(json["records_indexed"], 3);
        assert_eq!(json["batches"][0]["size"], 3);
    }

    #[tokio::test]
    async fn test_rebuilt_records_are_queryable() {
        let engine = engine();
        engine
            .reindex_class(&seeded_source(20), &article(), ReindexOptions::default())
            .await
            .unwrap();

        let hits = engine
            .index()
            .query_keys(&article(), &Query::Text("Article 17".to_string()))
            .await
            .unwrap();
        assert_eq!(hits, vec![RecordKey::Int(17)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_reindex_covers_every_record(count in 0i64..300, batch_size in 1i64..320) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let engine = engine();
                let source = seeded_source(count);

                let report = engine
                    .reindex_class(
                        &source,
                        &article(),
                        ReindexOptions::default().with_batch_size(batch_size),
                    )
                    .await
                    .unwrap();

                let expected_batches = (count + batch_size - 1) / batch_size;
                assert_eq!(report.batches.len() as i64, expected_batches);
                assert_eq!(report.commits as i64, expected_batches + 1);
                assert_eq!(engine.index().committed_keys(&article()), keys(1..=count));
                assert!(engine.find_orphans(&source, &article()).await.unwrap().is_empty());
            });
        }
    }
}
