// Core domain models for actionflow
// These are plain data structures with no storage or dispatch logic

//! # Domain Models Module
//!
//! This module contains the core domain models for the workflow engine:
//!
//! - `ids`: `StepId` / `ActionId` newtypes
//! - `definition`: the typed configuration graph (steps, actions, results,
//!   splits, joins, conditions, function references)
//! - `entry`: workflow instances and their property bag
//! - `step`: current and history step records
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API. Users can write
//! `use actionflow::models::Entry` instead of
//! `use actionflow::models::entry::Entry`.

pub mod ids;

pub mod definition;

pub mod entry;

pub mod step;

pub use ids::{ActionId, StepId};

pub use definition::{
    ActionDescriptor, ConditionType, Conditions, DefinitionContents, FunctionRef, JoinDescriptor,
    RestrictTo, ResultDescriptor, SplitDescriptor, StepDescriptor, WorkflowDefinition, NO_SCREEN,
};

pub use entry::{Entry, EntryState, PropertySet};

pub use step::{CurrentStep, HistoryStep};
