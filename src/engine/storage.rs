// Storage abstraction for the workflow engine
// This defines the interface for persisting definitions, entries and steps

//! # Storage Abstraction Layer
//!
//! This module provides a storage abstraction that allows the workflow engine
//! to persist its records using different backends. The engine only needs
//! keyed-record operations (create, find by id, update, delete) over four
//! record kinds:
//!
//! - **Definitions**: workflow configuration documents
//! - **Entries**: workflow instances
//! - **Current steps**: active positions, grouped by entry in creation order
//! - **History steps**: closed positions, append-only
//!
//! ## Atomic Step Moves
//!
//! Retiring a current step and creating its successors must never be
//! observed half-done. Rather than asking the engine to sequence several
//! deletes and inserts, the trait exposes a single `commit_steps` call that
//! a backend applies as one unit (one lock in memory, one transaction in a
//! database).
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate provides a macro to enable async trait methods
//! usable through `Arc<dyn WorkflowStorage>`.
//!
//! ### `Result<Option<T>>`
//! - `Ok(Some(record))`: found it
//! - `Ok(None)`: no record with that id (not an error)
//! - `Err(error)`: the lookup itself failed

use std::collections::HashMap;

use anyhow::anyhow;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{CurrentStep, Entry, HistoryStep, WorkflowDefinition};
use crate::Result;

/// One atomic change to an entry's steps
///
/// Applied all-or-nothing by [`WorkflowStorage::commit_steps`]:
/// 1. `retire`: delete the current step with the given id and append its
///    history record (fails if the current step no longer exists)
/// 2. `create`: insert the new current steps
/// 3. `entry`: replace the stored entry
#[derive(Debug, Clone, Default)]
pub struct StepCommit {
    pub retire: Option<(Uuid, HistoryStep)>,
    pub create: Vec<CurrentStep>,
    pub entry: Option<Entry>,
}

/// Storage trait for workflow persistence
///
/// ## Design Principles
///
/// - **Async by Default**: All operations return futures for non-blocking I/O
/// - **Result-Based**: All operations can fail and return Result types
/// - **Thread-Safe**: Send + Sync bounds allow sharing across async tasks
///
/// Updates and deletes of records that do not exist are errors; the engine
/// propagates them unmodified.
#[async_trait::async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Create or replace a definition, keyed by its id
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition>;

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>>;

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    async fn delete_definition(&self, id: &str) -> Result<()>;

    async fn create_entry(&self, entry: Entry) -> Result<Entry>;

    async fn get_entry(&self, id: &Uuid) -> Result<Option<Entry>>;

    async fn update_entry(&self, entry: Entry) -> Result<Entry>;

    /// Current steps of an entry, in the order they were created
    async fn list_current_steps(&self, entry_id: &Uuid) -> Result<Vec<CurrentStep>>;

    /// History steps of an entry, in the order they were closed
    async fn list_history_steps(&self, entry_id: &Uuid) -> Result<Vec<HistoryStep>>;

    /// Apply a step move atomically
    async fn commit_steps(&self, commit: StepCommit) -> Result<()>;
}

#[derive(Default)]
struct Records {
    definitions: HashMap<String, WorkflowDefinition>,
    entries: HashMap<Uuid, Entry>,
    current_steps: HashMap<Uuid, Vec<CurrentStep>>,
    history_steps: HashMap<Uuid, Vec<HistoryStep>>,
}

/// In-memory storage implementation for development and testing
///
/// All records live behind a single `RwLock`, which is what makes
/// `commit_steps` atomic: readers either see the state before the commit or
/// after it, never in between.
///
/// ## Limitations
///
/// - **Not persistent**: Data is lost when process restarts
/// - **Not distributed**: Cannot share data across multiple processes
#[derive(Default)]
pub struct InMemoryStorage {
    records: RwLock<Records>,
}

#[async_trait::async_trait]
impl WorkflowStorage for InMemoryStorage {
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        let mut records = self.records.write().await;
        records.definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let records = self.records.read().await;
        Ok(records.definitions.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let records = self.records.read().await;
        let mut definitions: Vec<WorkflowDefinition> = records.definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn delete_definition(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .definitions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("definition record '{}' does not exist", id).into())
    }

    async fn create_entry(&self, entry: Entry) -> Result<Entry> {
        let mut records = self.records.write().await;
        if records.entries.contains_key(&entry.id) {
            return Err(anyhow!("entry record {} already exists", entry.id).into());
        }
        records.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: &Uuid) -> Result<Option<Entry>> {
        let records = self.records.read().await;
        Ok(records.entries.get(id).cloned())
    }

    async fn update_entry(&self, entry: Entry) -> Result<Entry> {
        let mut records = self.records.write().await;
        match records.entries.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(entry)
            }
            None => Err(anyhow!("entry record {} does not exist", entry.id).into()),
        }
    }

    async fn list_current_steps(&self, entry_id: &Uuid) -> Result<Vec<CurrentStep>> {
        let records = self.records.read().await;
        Ok(records.current_steps.get(entry_id).cloned().unwrap_or_default())
    }

    async fn list_history_steps(&self, entry_id: &Uuid) -> Result<Vec<HistoryStep>> {
        let records = self.records.read().await;
        Ok(records.history_steps.get(entry_id).cloned().unwrap_or_default())
    }

    async fn commit_steps(&self, commit: StepCommit) -> Result<()> {
        let mut records = self.records.write().await;

        // Check everything before touching anything
        if let Some(entry) = &commit.entry {
            if !records.entries.contains_key(&entry.id) {
                return Err(anyhow!("entry record {} does not exist", entry.id).into());
            }
        }
        let retire_index = match &commit.retire {
            Some((current_id, history)) => {
                let position = records
                    .current_steps
                    .get(&history.entry_id)
                    .and_then(|steps| steps.iter().position(|s| s.id == *current_id));
                match position {
                    Some(index) => Some(index),
                    None => {
                        return Err(anyhow!("current step record {} does not exist", current_id).into());
                    }
                }
            }
            None => None,
        };

        if let (Some((_, history)), Some(index)) = (commit.retire, retire_index) {
            if let Some(steps) = records.current_steps.get_mut(&history.entry_id) {
                steps.remove(index);
            }
            records.history_steps.entry(history.entry_id).or_default().push(history);
        }
        for step in commit.create {
            records.current_steps.entry(step.entry_id).or_default().push(step);
        }
        if let Some(entry) = commit.entry {
            records.entries.insert(entry.id, entry);
        }
        Ok(())
    }
}
