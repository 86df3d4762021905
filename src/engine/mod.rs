// actionflow engine
// Transition engine plus the pieces it is assembled from

//! # Engine Module
//!
//! This module contains everything that acts on the domain models: the
//! transition engine itself and the collaborators it is built from.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: plain data (in `models/`)
//! - **Engine Layer**: behavior over that data (this module)
//! - **Binaries**: the `actionflow` admin CLI (in `bin/`)
//!
//! ## Engine Components
//!
//! ### Workflow Engine (`workflow` module)
//! - Creates and initializes entries
//! - Performs actions: split, join and plain transitions
//! - Answers queries (available actions, screens, step count)
//!
//! ### Storage Engine (`storage` module)
//! - Abstracts storage operations behind an async trait
//! - Provides an in-memory implementation for development/testing
//! - Applies step moves atomically
//!
//! ### Condition Evaluator (`conditions` module)
//! - Evaluates and/or condition trees
//! - Selects the result an action leads to
//!
//! ### Function Registry (`functions` module)
//! - Maps `Capability@entry_point` names to hooks and predicates
//! - Builds the variable context handed to each call
//!
//! ### Event System (`events` module)
//! - Broadcasts lifecycle events to in-process listeners
//!
//! ### Clock (`clock` module)
//! - Injectable time source for step timestamps
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! This is a common Rust pattern for organizing large modules:
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API

/// Time source abstraction
pub mod clock;

/// Condition trees and result selection
pub mod conditions;

/// Lifecycle event broadcast
pub mod events;

/// Hook and predicate registry
///
/// Contains:
/// - `Hook` / `Predicate` traits
/// - Name resolution (`Capability@entry_point`)
/// - Variable context construction
pub mod functions;

/// Storage abstraction layer
///
/// Contains:
/// - Storage trait definition
/// - In-memory storage implementation
/// - Atomic step commits
pub mod storage;

/// Transition engine and query facade
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::ConditionEvaluator;
pub use events::{EventBus, WorkflowEvent};
pub use functions::{FunctionContext, FunctionRegistry, Hook, Predicate};
pub use storage::{InMemoryStorage, StepCommit, WorkflowStorage};
pub use workflow::{AvailableAction, Transition, TransitionOutcome, WorkflowEngine};
