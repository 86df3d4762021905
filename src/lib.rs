// actionflow
// A configuration-driven workflow engine: steps, actions, splits and joins

//! # actionflow Library
//!
//! `actionflow` advances long-lived business entities ("entries") through
//! the steps of a workflow definition. Callers create an entry from a
//! definition, initialize it, and then perform named actions with inputs;
//! the engine evaluates conditions, fans out (split), fans in (join), and
//! runs registered hook functions at every transition boundary.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`WorkflowDefinition`] / [`DefinitionContents`]: the typed configuration graph
//! - [`Entry`]: one running workflow instance with its property bag
//! - [`CurrentStep`] / [`HistoryStep`]: where an entry is, and where it has been
//!
//! ### Engine
//! - [`WorkflowEngine`]: the transition engine and query facade
//! - [`FunctionRegistry`]: named hook and condition capabilities
//! - [`ConditionEvaluator`]: and/or condition trees and result selection
//! - [`WorkflowStorage`]: keyed-record storage abstraction ([`InMemoryStorage`])
//! - [`EventBus`]: broadcast of lifecycle events to listeners
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use actionflow::{InMemoryStorage, FunctionRegistry, WorkflowEngine, WorkflowDefinition};
//!
//! # async fn run(definition: WorkflowDefinition) -> actionflow::Result<()> {
//! let engine = WorkflowEngine::new(Arc::new(InMemoryStorage::default()), Arc::new(FunctionRegistry::new()));
//! let definition = engine.save_definition(definition).await?;
//!
//! let entry = engine.create_instance(&definition.id).await?;
//! engine.initialize(entry.id).await?;
//! let outcome = engine.do_action(entry.id, &"4".into(), serde_json::Map::new()).await?;
//! assert!(outcome.is_clean());
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure. Instead of `use actionflow::models::entry::Entry`,
//! users can write `use actionflow::Entry`.

// Core domain models
pub mod models;

// Transition engine, function registry, storage and events
pub mod engine;

// Configuration loading
pub mod config;

pub use models::{
    ActionDescriptor, ActionId, ConditionType, Conditions, CurrentStep, DefinitionContents, Entry,
    EntryState, FunctionRef, HistoryStep, JoinDescriptor, PropertySet, RestrictTo,
    ResultDescriptor, SplitDescriptor, StepDescriptor, StepId, WorkflowDefinition,
};

pub use engine::{
    clock::{Clock, ManualClock, SystemClock},
    conditions::ConditionEvaluator,
    events::{EventBus, WorkflowEvent},
    functions::{FunctionContext, FunctionRegistry, Hook, Predicate},
    storage::{InMemoryStorage, StepCommit, WorkflowStorage},
    workflow::{AvailableAction, Transition, TransitionOutcome, WorkflowEngine},
};

pub use config::EngineConfig;

use thiserror::Error;
use uuid::Uuid;

/// Error types for workflow operations
///
/// Every validation failure below is detected before anything is written,
/// so an `Err` from the engine means persisted state is unchanged. The one
/// exception is a hook failing after a step has already been retired; that
/// case is reported through [`TransitionOutcome::HookFailed`] rather than
/// as an `Err`.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types with `?`
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Instance id does not resolve
    #[error("Entry not found: {id}")]
    EntryNotFound { id: Uuid },

    /// Definition id does not resolve
    #[error("Workflow definition not found: {id}")]
    DefinitionNotFound { id: String },

    /// The entry's definition exists but has no contents
    #[error("Workflow definition '{id}' has no contents")]
    ConfigNotFound { id: String },

    /// Action missing from every reachable step (or no initial actions)
    #[error("Action not found: {action}")]
    ActionNotFound { action: String },

    /// Action present but its availability conditions fail
    #[error("Action not available: {action}")]
    ActionNotAvailable { action: String },

    /// No result descriptor qualifies
    #[error("No result available for action {action}")]
    ResultNotAvailable { action: String },

    /// A current step or descriptor references an unknown step id
    #[error("Step not found: {step}")]
    StepNotFound { step: String },

    #[error("Split not found: {split}")]
    SplitNotFound { split: String },

    #[error("Join not found: {join}")]
    JoinNotFound { join: String },

    /// Action requested but the entry has no active step
    #[error("Entry {entry} has no current step")]
    CurrentStepNotFound { entry: Uuid },

    /// Action requested while the entry is suspended, completed or killed
    #[error("Entry {entry} is {state}; actions require CREATED or ACTIVATED")]
    StateNotActivated { entry: Uuid, state: EntryState },

    /// A hook or condition reference cannot be resolved
    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    /// A definition failed validation when it was saved
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A dispatched function returned an error
    #[error("Function '{name}' failed: {message}")]
    Hook { name: String, message: String },

    /// Storage-layer failures, propagated unmodified
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, WorkflowError>;
