//! In-memory index and record source for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use indexsync_common::{ClassTag, Error, RecordKey, Result};

use crate::index::{Document, IndexClient, IndexHit, Query};
use crate::source::{RecordSource, Syncable};

type DocMap = BTreeMap<(ClassTag, RecordKey), Document>;

fn poisoned(what: &str) -> Error {
    Error::AdapterUnavailable(format!("{} lock poisoned", what))
}

/// Documents as seen by writers and by readers.
#[derive(Debug, Default)]
struct IndexState {
    /// Every mutation applied so far, committed or not.
    working: DocMap,
    /// Snapshot published by the last commit.
    committed: DocMap,
}

/// In-memory search index.
///
/// Writes land in a working set; `commit` publishes the working set to the
/// view that queries read. Failures can be injected to exercise error paths.
pub struct MemoryIndex {
    state: RwLock<IndexState>,
    commits: AtomicU64,
    batch_calls: AtomicU64,
    unavailable: AtomicBool,
    rejected: RwLock<HashSet<RecordKey>>,
}

impl MemoryIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            commits: AtomicU64::new(0),
            batch_calls: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            rejected: RwLock::new(HashSet::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>> {
        self.state.read().map_err(|_| poisoned("memory index"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>> {
        self.check_available()?;
        self.state.write().map_err(|_| poisoned("memory index"))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::AdapterUnavailable(
                "memory index is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn check_accepted(&self, doc: &Document) -> Result<()> {
        let rejected = self.rejected.read().map_err(|_| poisoned("rejection set"))?;
        if rejected.contains(&doc.key) {
            return Err(Error::DocumentRejected {
                key: doc.key.clone(),
                reason: "document refused by index".to_string(),
            });
        }
        Ok(())
    }

    /// Simulate the backend going offline or coming back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Refuse any document carrying this key.
    pub fn reject_key(&self, key: RecordKey) {
        if let Ok(mut rejected) = self.rejected.write() {
            rejected.insert(key);
        }
    }

    /// Number of commits performed so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of `index_many` calls received so far.
    pub fn index_many_count(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Keys of committed documents in a class, sorted.
    pub fn committed_keys(&self, class: &ClassTag) -> Vec<RecordKey> {
        self.read()
            .map(|state| keys_of(&state.committed, class))
            .unwrap_or_default()
    }

    /// Keys of documents in a class including uncommitted writes, sorted.
    pub fn working_keys(&self, class: &ClassTag) -> Vec<RecordKey> {
        self.read()
            .map(|state| keys_of(&state.working, class))
            .unwrap_or_default()
    }

    /// Whether any mutation is waiting for a commit.
    pub fn has_pending_changes(&self) -> bool {
        self.read()
            .map(|state| state.working != state.committed)
            .unwrap_or(false)
    }
}

fn keys_of(docs: &DocMap, class: &ClassTag) -> Vec<RecordKey> {
    docs.keys()
        .filter(|(c, _)| c == class)
        .map(|(_, key)| key.clone())
        .collect()
}

fn hit_matches(doc: &Document, query: &Query) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Key(key) => &doc.key == key,
        Query::Text(term) => {
            let term = term.to_lowercase();
            doc.fields
                .values()
                .any(|value| value.to_lowercase().contains(&term))
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexClient for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn index_one(&self, doc: &Document) -> Result<()> {
        self.check_accepted(doc)?;
        let mut state = self.write()?;
        state
            .working
            .insert((doc.class.clone(), doc.key.clone()), doc.clone());
        Ok(())
    }

    async fn index_many(&self, docs: &[Document]) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        // Validate the whole call before touching state.
        for doc in docs {
            self.check_accepted(doc)?;
        }

        let mut state = self.write()?;
        for doc in docs {
            state
                .working
                .insert((doc.class.clone(), doc.key.clone()), doc.clone());
        }
        debug!("Indexed {} documents in memory", docs.len());
        Ok(())
    }

    async fn remove_one(&self, class: &ClassTag, key: &RecordKey) -> Result<()> {
        let mut state = self.write()?;
        state.working.remove(&(class.clone(), key.clone()));
        Ok(())
    }

    async fn remove_all(&self, class: &ClassTag) -> Result<()> {
        let mut state = self.write()?;
        state.working.retain(|(c, _), _| c != class);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.write()?;
        state.committed = state.working.clone();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self, class: &ClassTag, query: &Query) -> Result<Vec<IndexHit>> {
        self.check_available()?;
        let state = self.read()?;

        Ok(state
            .committed
            .iter()
            .filter(|((c, _), doc)| c == class && hit_matches(doc, query))
            .map(|(_, doc)| IndexHit {
                key: Some(doc.key.clone()),
                fields: doc.fields.clone(),
            })
            .collect())
    }
}

/// In-memory record store.
///
/// Records are kept per class in primary-key order.
pub struct MemoryRecordSource<R> {
    records: RwLock<BTreeMap<ClassTag, BTreeMap<RecordKey, R>>>,
    unavailable: AtomicBool,
    /// Pages served before fetches start failing. `u64::MAX` disables the limit.
    pages_before_failure: AtomicU64,
    pages_served: AtomicU64,
}

impl<R: Syncable + Clone> MemoryRecordSource<R> {
    /// Create a new empty source.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            pages_before_failure: AtomicU64::new(u64::MAX),
            pages_served: AtomicU64::new(0),
        }
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: R) {
        if let Ok(mut records) = self.records.write() {
            records
                .entry(record.class_tag())
                .or_default()
                .insert(record.primary_key(), record);
        }
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, class: &ClassTag, key: &RecordKey) -> bool {
        self.records
            .write()
            .ok()
            .and_then(|mut records| records.get_mut(class).and_then(|m| m.remove(key)))
            .is_some()
    }

    /// Simulate the store going offline or coming back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Let `pages` page fetches succeed, then fail every following one.
    pub fn fail_after_pages(&self, pages: u64) {
        self.pages_served.store(0, Ordering::SeqCst);
        self.pages_before_failure.store(pages, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::AdapterUnavailable(
                "memory record store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn with_class<T>(
        &self,
        class: &ClassTag,
        f: impl FnOnce(Option<&BTreeMap<RecordKey, R>>) -> T,
    ) -> Result<T> {
        self.check_available()?;
        let records = self
            .records
            .read()
            .map_err(|_| poisoned("memory record store"))?;
        Ok(f(records.get(class)))
    }
}

impl<R: Syncable + Clone> Default for MemoryRecordSource<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Syncable + Clone + 'static> RecordSource for MemoryRecordSource<R> {
    type Record = R;

    fn name(&self) -> &str {
        "memory"
    }

    async fn count(&self, class: &ClassTag) -> Result<u64> {
        self.with_class(class, |records| records.map_or(0, |m| m.len() as u64))
    }

    async fn fetch_page(&self, class: &ClassTag, offset: u64, limit: u64) -> Result<Vec<R>> {
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst);
        if served >= self.pages_before_failure.load(Ordering::SeqCst) {
            return Err(Error::AdapterUnavailable(format!(
                "memory record store failed fetching page at offset {}",
                offset
            )));
        }

        self.with_class(class, |records| {
            records
                .map(|m| {
                    m.values()
                        .skip(offset as usize)
                        .take(limit as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn fetch_all(&self, class: &ClassTag) -> Result<Vec<R>> {
        self.with_class(class, |records| {
            records
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
        self.with_class(class, |records| {
            records
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        })
    }
}
