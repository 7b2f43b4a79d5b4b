//! Adapter contracts between the sync engine and its collaborators.
//!
//! The engine talks to two external systems:
//! - the search index, through [`IndexClient`]
//! - the system of record, through [`RecordSource`]
//!
//! Record types take part in synchronization by implementing [`Syncable`].
//! In-memory implementations back the tests; the SQLite implementations
//! (an FTS5 index and a table-backed record source) back the operator CLI.

pub mod index;
pub mod memory;
pub mod registry;
pub mod source;
pub mod sqlite;

pub use index::{Document, IndexClient, IndexHit, Query};
pub use memory::{MemoryIndex, MemoryRecordSource};
pub use registry::{create_default_registry, IndexFactory, IndexRegistry};
pub use source::{FieldRecord, KeyStub, RecordSource, Syncable};
pub use sqlite::{SqliteIndex, SqliteRecordSource, TableMapping};
