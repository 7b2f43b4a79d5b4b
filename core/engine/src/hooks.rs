//! Mutation hooks - record lifecycle events wired to the engine.
//!
//! The host registers one `MutationHooks` at startup, subscribes the record
//! classes that should be searchable, and forwards save/destroy events to it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use indexsync_adapters::{IndexClient, Syncable};
use indexsync_common::{ClassTag, Result};

use crate::engine::SyncEngine;

/// Switches for automatic index maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Index a record after it is created or updated.
    pub auto_index_on_save: bool,
    /// Remove a record's entry after it is deleted.
    ///
    /// Turning this off lets orphans accumulate until the next repair.
    pub auto_remove_on_delete: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            auto_index_on_save: true,
            auto_remove_on_delete: true,
        }
    }
}

/// Lifecycle event raised by the record store.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a, R: ?Sized> {
    /// Record was created or updated.
    Saved(&'a R),
    /// Record was deleted.
    Destroyed(&'a R),
}

/// What a hook did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Indexed,
    Removed,
    /// The class is not subscribed or the switch is off.
    Skipped,
}

/// Event subscriber forwarding lifecycle events to a shared engine.
pub struct MutationHooks<I: IndexClient + ?Sized> {
    engine: Arc<SyncEngine<I>>,
    config: HookConfig,
    classes: HashSet<ClassTag>,
}

impl<I: IndexClient + ?Sized> MutationHooks<I> {
    /// Create hooks with no subscribed classes.
    pub fn new(engine: Arc<SyncEngine<I>>, config: HookConfig) -> Self {
        if !config.auto_remove_on_delete {
            warn!("auto_remove_on_delete is disabled; deleted records will leave orphans in the index");
        }
        Self {
            engine,
            config,
            classes: HashSet::new(),
        }
    }

    /// Create hooks using the engine's configured switches.
    pub fn from_engine(engine: Arc<SyncEngine<I>>) -> Self {
        let config = engine.config().hooks;
        Self::new(engine, config)
    }

    /// Subscribe a record class to lifecycle events.
    pub fn subscribe(mut self, class: ClassTag) -> Self {
        self.classes.insert(class);
        self
    }

    /// Whether events for this class reach the engine.
    pub fn is_subscribed(&self, class: &ClassTag) -> bool {
        self.classes.contains(class)
    }

    /// Get the hook configuration.
    pub fn config(&self) -> HookConfig {
        self.config
    }

    /// Handle a post-create or post-update event.
    pub async fn after_save<R: Syncable + ?Sized>(&self, record: &R) -> Result<HookOutcome> {
        if !self.config.auto_index_on_save || !self.is_subscribed(&record.class_tag()) {
            return Ok(HookOutcome::Skipped);
        }
        self.engine.index_record(record).await?;
        debug!("Save hook indexed {} {}", record.class_tag(), record.primary_key());
        Ok(HookOutcome::Indexed)
    }

    /// Handle a post-delete event.
    pub async fn after_destroy<R: Syncable + ?Sized>(&self, record: &R) -> Result<HookOutcome> {
        if !self.config.auto_remove_on_delete || !self.is_subscribed(&record.class_tag()) {
            return Ok(HookOutcome::Skipped);
        }
        self.engine.remove_record(record).await?;
        debug!("Destroy hook removed {} {}", record.class_tag(), record.primary_key());
        Ok(HookOutcome::Removed)
    }

    /// Dispatch a lifecycle event.
    pub async fn handle<R: Syncable + ?Sized>(
        &self,
        event: LifecycleEvent<'_, R>,
    ) -> Result<HookOutcome> {
        match event {
            LifecycleEvent::Saved(record) => self.after_save(record).await,
            LifecycleEvent::Destroyed(record) => self.after_destroy(record).await,
        }
    }
}
