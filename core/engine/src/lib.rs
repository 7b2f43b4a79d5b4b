//! Index Synchronization Engine
//!
//! Keeps a full-text search index consistent with a system of record:
//! - Incremental index/remove of single records, with commit variants
//! - Full rebuild of a record class in bounded batches
//! - Orphan detection and repair (index entries with no backing record)
//! - Mutation hooks wiring record lifecycle events to the engine

pub mod batch;
pub mod engine;
pub mod hooks;
pub mod orphans;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use batch::{BatchCoordinator, BatchCursor, BatchStats, ReindexOptions, ReindexReport};
pub use engine::{EngineConfig, SyncEngine};
pub use hooks::{HookConfig, HookOutcome, LifecycleEvent, MutationHooks};
pub use orphans::{ConsistencyReport, OrphanReconciler, OrphanReport};
