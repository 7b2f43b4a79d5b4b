//! Shared fixtures for engine tests.

use indexsync_adapters::{FieldRecord, MemoryRecordSource};
use indexsync_common::{ClassTag, RecordKey};

pub fn article() -> ClassTag {
    ClassTag::new("Article").unwrap()
}

pub fn record(key: i64) -> FieldRecord {
    FieldRecord::new(article(), RecordKey::Int(key)).with_field("title", format!("Article {}", key))
}

/// Source holding articles with keys `1..=count`.
pub fn seeded_source(count: i64) -> MemoryRecordSource<FieldRecord> {
    let source = MemoryRecordSource::new();
    for key in 1..=count {
        source.insert(record(key));
    }
    source
}
