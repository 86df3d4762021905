// Transition engine - moves entries through their workflow definitions

//! # Workflow Engine
//!
//! `WorkflowEngine` is the single entry point collaborators use to drive
//! workflow instances. It owns no state of its own beyond per-entry locks;
//! everything durable goes through a [`WorkflowStorage`].
//!
//! ## Performing an Action
//!
//! `do_action` locates the action on the entry's current steps and then
//! runs this sequence:
//!
//! 1. action `pre_functions`
//! 2. select the result (the empty result when none qualifies)
//! 3. result `pre_functions`
//! 4. the current step's `post_functions`
//! 5. move the current step to history and create its successor(s),
//!    following a split, a join or the plain result, as one storage commit;
//!    then run each new step's `pre_functions`
//! 6. result `post_functions`
//! 7. action `post_functions`
//!
//! Anything that fails up to and including the commit returns `Err` with
//! the entry untouched. Once the commit has happened the step move is
//! durable, so a hook failing in 5-7 is reported as
//! [`TransitionOutcome::HookFailed`] instead.
//!
//! ## Joins
//!
//! A join closes the arriving branch. By default the successor is created
//! as soon as the join's conditions pass for that branch. A join marked
//! `"barrier": true` additionally waits while any sibling branch from the
//! same split can still reach it; the successor then lists every arrived
//! history step in `merged_ids`. A sibling that moves somewhere the join
//! cannot be reached from releases the waiting join in the same commit.
//!
//! ## Rust Learning Notes:
//!
//! ### Per-Key Async Locks
//! `entry_locks` is a `DashMap<Uuid, Arc<Mutex<()>>>`. Each call clones
//! the `Arc` for its entry out of the map (releasing the map shard lock
//! right away) and then awaits the `tokio::sync::Mutex`. Calls on the same
//! entry queue up; calls on different entries never contend.
//!
//! `EntryGuard` implements `Drop`: it releases the mutex and then removes
//! the map slot with `remove_if`, which only succeeds when the map holds
//! the last `Arc` (no other call is waiting on it).
//!
//! ### Borrowing from a Loaded Definition
//! `ActionMatch<'a>` borrows the step and action descriptors out of the
//! `DefinitionContents` loaded for this call, so the search result can be
//! passed around without cloning descriptor trees.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::clock::{Clock, SystemClock};
use crate::engine::conditions::ConditionEvaluator;
use crate::engine::events::{EventBus, WorkflowEvent};
use crate::engine::functions::{FunctionContext, FunctionRegistry};
use crate::engine::storage::{StepCommit, WorkflowStorage};
use crate::models::{
    ActionDescriptor, ActionId, CurrentStep, DefinitionContents, Entry, EntryState, FunctionRef,
    HistoryStep, ResultDescriptor, StepDescriptor, StepId, WorkflowDefinition,
};
use crate::{Result, WorkflowError};

/// An action the entry can currently perform
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableAction {
    pub id: ActionId,
    pub name: String,
    pub screen: Option<String>,
}

/// What a committed transition changed
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub action_id: ActionId,

    /// History record of the step that was closed (`None` for `initialize`)
    pub retired: Option<HistoryStep>,

    /// Current steps created by the transition
    pub created: Vec<CurrentStep>,
}

/// Result of a committed transition
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Every hook ran
    Completed(Transition),

    /// The step move is durable but a later hook failed; the remaining
    /// hooks were skipped
    HookFailed {
        transition: Transition,
        error: WorkflowError,
    },
}

impl TransitionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, TransitionOutcome::Completed(_))
    }

    pub fn transition(&self) -> &Transition {
        match self {
            TransitionOutcome::Completed(transition) => transition,
            TransitionOutcome::HookFailed { transition, .. } => transition,
        }
    }

    /// Treat a post-commit hook failure as an error
    pub fn into_result(self) -> Result<Transition> {
        match self {
            TransitionOutcome::Completed(transition) => Ok(transition),
            TransitionOutcome::HookFailed { error, .. } => Err(error),
        }
    }
}

/// The current step, step descriptor and action an action id resolved to
struct ActionMatch<'a> {
    current: &'a CurrentStep,
    step: &'a StepDescriptor,
    action: &'a ActionDescriptor,
}

/// Everything a transition writes, computed before anything is written
struct PlannedMove<'a> {
    history: HistoryStep,
    created: Vec<(CurrentStep, &'a StepDescriptor)>,
    entry: Option<Entry>,
}

/// Held for the duration of a call on one entry
struct EntryGuard<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    entry_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.entry_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct WorkflowEngine {
    storage: Arc<dyn WorkflowStorage>,
    functions: Arc<FunctionRegistry>,
    conditions: ConditionEvaluator,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: EngineConfig,
    entry_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WorkflowEngine {
    pub fn new(storage: Arc<dyn WorkflowStorage>, functions: Arc<FunctionRegistry>) -> Self {
        let config = EngineConfig::default();
        Self {
            storage,
            conditions: ConditionEvaluator::new(functions.clone()),
            functions,
            clock: Arc::new(SystemClock),
            events: EventBus::new(config.event_buffer),
            config,
            entry_locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply engine configuration
    ///
    /// Replaces the event bus, so call this before subscribing. Function
    /// names are resolved by the registry, which must be built with
    /// [`FunctionRegistry::with_config`] from the same configuration for
    /// `function_delimiter` and `default_entry_point` to apply.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        if !self.functions.uses_naming_of(&config) {
            warn!(
                delimiter = %config.function_delimiter,
                entry_point = %config.default_entry_point,
                "function registry was built with different naming settings"
            );
        }
        self.events = EventBus::new(config.event_buffer);
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Create or replace a definition
    ///
    /// An empty id is replaced with a fresh one. Contents are validated
    /// before anything is stored.
    pub async fn save_definition(&self, mut definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        if definition.id.is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        if let Some(contents) = &definition.contents {
            contents.validate().map_err(WorkflowError::InvalidDefinition)?;
            if self.config.verify_functions {
                self.functions.verify_references(contents)?;
            }
        }
        definition.updated_at = self.clock.now();

        let saved = self.storage.save_definition(definition).await?;
        info!(definition_id = %saved.id, name = %saved.name, "workflow definition saved");
        Ok(saved)
    }

    pub async fn remove_definition(&self, definition_id: &str) -> Result<()> {
        self.storage.delete_definition(definition_id).await?;
        info!(definition_id, "workflow definition removed");
        Ok(())
    }

    pub async fn get_definition(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        self.storage
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound { id: definition_id.to_string() })
    }

    /// Names of every stored definition
    pub async fn get_workflow_names(&self) -> Result<Vec<String>> {
        let definitions = self.storage.list_definitions().await?;
        Ok(definitions.into_iter().map(|d| d.name).collect())
    }

    /// Distinct screens referenced by a definition's actions
    pub fn get_screens(contents: &DefinitionContents) -> Vec<String> {
        contents.screens()
    }

    pub fn get_step_num(contents: &DefinitionContents) -> usize {
        contents.step_count()
    }

    // ------------------------------------------------------------------
    // Instance lifecycle
    // ------------------------------------------------------------------

    /// Create a `Created` entry for a definition, with no current step
    pub async fn create_instance(&self, definition_id: &str) -> Result<Entry> {
        let definition = self.get_definition(definition_id).await?;
        if definition.contents.is_none() {
            return Err(WorkflowError::ConfigNotFound { id: definition.id });
        }

        let entry = self
            .storage
            .create_entry(Entry::new(definition.id, self.clock.now()))
            .await?;

        info!(entry_id = %entry.id, definition_id = %entry.definition_id, "workflow instance created");
        self.events.publish(WorkflowEvent::EntryCreated {
            entry_id: entry.id,
            definition_id: entry.definition_id.clone(),
            timestamp: entry.created_at,
        });
        Ok(entry)
    }

    /// Seed the root current step and activate the entry
    ///
    /// Uses the first available initial action and its selected result.
    /// The entry's lifecycle state is not checked, so any entry can be
    /// (re)activated this way. Calling this twice creates a second root step.
    pub async fn initialize(&self, entry_id: Uuid) -> Result<TransitionOutcome> {
        let _guard = self.lock_entry(entry_id).await;

        let mut entry = self.load_entry(entry_id).await?;
        let contents = self.load_contents(&entry).await?;
        let ctx = FunctionContext::new(&entry, &Map::new());

        let first = contents
            .initial_actions
            .first()
            .ok_or_else(|| WorkflowError::ActionNotFound { action: "initial".to_string() })?;

        let mut chosen = None;
        for action in &contents.initial_actions {
            if self.conditions.is_available(action.gate(), &ctx).await? {
                chosen = Some(action);
                break;
            }
        }
        let action = chosen.ok_or_else(|| WorkflowError::ActionNotAvailable { action: first.id.to_string() })?;

        let result = self
            .conditions
            .available_result(&action.results, &ctx)
            .await?
            .ok_or_else(|| WorkflowError::ResultNotAvailable { action: action.id.to_string() })?;

        let now = self.clock.now();
        let (root, descriptor) = build_step(&contents, entry.id, &action.id, result, None, now)?;

        let previous_state = entry.state;
        entry.change_state(EntryState::Activated, now);
        self.storage
            .commit_steps(StepCommit {
                retire: None,
                create: vec![root.clone()],
                entry: Some(entry.clone()),
            })
            .await?;

        info!(entry_id = %entry.id, action_id = %action.id, step_id = %root.step_id, "workflow instance initialized");
        self.events.publish(WorkflowEvent::step_created(&root));
        self.events.publish(WorkflowEvent::EntryActivated {
            entry_id: entry.id,
            step_id: root.step_id.clone(),
            timestamp: now,
        });
        self.publish_state_change(&entry, previous_state);

        let transition = Transition {
            action_id: action.id.clone(),
            retired: None,
            created: vec![root],
        };
        let hooks = [descriptor.pre_functions.as_slice()];
        Ok(self.finish(transition, &hooks, &FunctionContext::new(&entry, &Map::new())).await)
    }

    /// Perform an action on an entry
    ///
    /// `inputs` are handed to every hook and condition under the `inputs`
    /// key; a string `caller` input is recorded on the history step.
    pub async fn do_action(
        &self,
        entry_id: Uuid,
        action_id: &ActionId,
        inputs: Map<String, Value>,
    ) -> Result<TransitionOutcome> {
        let _guard = self.lock_entry(entry_id).await;

        let entry = self.load_entry(entry_id).await?;
        ensure_accepts_actions(&entry)?;
        let contents = self.load_contents(&entry).await?;

        let current_steps = self.storage.list_current_steps(&entry.id).await?;
        if current_steps.is_empty() {
            return Err(WorkflowError::CurrentStepNotFound { entry: entry.id });
        }

        let found = find_action(&contents, &current_steps, action_id)?;
        let ctx = FunctionContext::new(&entry, &inputs);
        if !self.conditions.is_available(found.action.gate(), &ctx).await? {
            return Err(WorkflowError::ActionNotAvailable { action: action_id.to_string() });
        }
        debug!(
            entry_id = %entry.id,
            action_id = %action_id,
            step_id = %found.current.step_id,
            "action located"
        );

        // 1
        self.functions.run_hooks(&found.action.pre_functions, &ctx).await?;

        // 2
        let empty = ResultDescriptor::default();
        let result = self
            .conditions
            .available_result(&found.action.results, &ctx)
            .await?
            .unwrap_or(&empty);

        // 3, 4
        self.functions.run_hooks(&result.pre_functions, &ctx).await?;
        self.functions.run_hooks(&found.step.post_functions, &ctx).await?;

        // 5
        let caller = inputs.get("caller").and_then(Value::as_str).map(str::to_string);
        let planned = self
            .plan_move(&contents, &entry, &current_steps, &found, result, caller, &ctx)
            .await?;

        let created: Vec<CurrentStep> = planned.created.iter().map(|(step, _)| step.clone()).collect();
        self.storage
            .commit_steps(StepCommit {
                retire: Some((found.current.id, planned.history.clone())),
                create: created.clone(),
                entry: planned.entry.clone(),
            })
            .await?;

        info!(
            entry_id = %entry.id,
            action_id = %action_id,
            from_step = %found.current.step_id,
            created = created.len(),
            "action performed"
        );
        self.events.publish(WorkflowEvent::step_retired(&planned.history));
        for step in &created {
            self.events.publish(WorkflowEvent::step_created(step));
        }

        let mut hooks: Vec<&[FunctionRef]> = planned
            .created
            .iter()
            .map(|(_, descriptor)| descriptor.pre_functions.as_slice())
            .collect();
        // 6, 7
        hooks.push(result.post_functions.as_slice());
        hooks.push(found.action.post_functions.as_slice());

        let after = planned.entry.as_ref().unwrap_or(&entry);
        let transition = Transition {
            action_id: action_id.clone(),
            retired: Some(planned.history),
            created,
        };
        Ok(self.finish(transition, &hooks, &FunctionContext::new(after, &inputs)).await)
    }

    /// Actions the entry can perform now, across every current step
    ///
    /// Steps whose own gate fails contribute nothing. An action exposed by
    /// several current steps is listed once, as first seen.
    pub async fn get_available_actions(&self, entry_id: Uuid) -> Result<Vec<AvailableAction>> {
        let entry = self.load_entry(entry_id).await?;
        let contents = self.load_contents(&entry).await?;
        let current_steps = self.storage.list_current_steps(&entry.id).await?;
        let ctx = FunctionContext::new(&entry, &Map::new());

        let mut available: Vec<AvailableAction> = Vec::new();
        for current in &current_steps {
            let step = contents
                .step(&current.step_id)
                .ok_or_else(|| WorkflowError::StepNotFound { step: current.step_id.to_string() })?;
            if step.actions.is_empty() || !self.conditions.is_available(step.gate(), &ctx).await? {
                continue;
            }
            for action in &step.actions {
                if available.iter().any(|a| a.id == action.id) {
                    continue;
                }
                if self.conditions.is_available(action.gate(), &ctx).await? {
                    available.push(AvailableAction {
                        id: action.id.clone(),
                        name: action.name.clone(),
                        screen: action.screen.clone(),
                    });
                }
            }
        }
        Ok(available)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.load_entry(entry_id).await
    }

    pub async fn get_entry_state(&self, entry_id: Uuid) -> Result<EntryState> {
        Ok(self.load_entry(entry_id).await?.state)
    }

    pub async fn get_current_steps(&self, entry_id: Uuid) -> Result<Vec<CurrentStep>> {
        self.storage.list_current_steps(&entry_id).await
    }

    pub async fn get_history_steps(&self, entry_id: Uuid) -> Result<Vec<HistoryStep>> {
        self.storage.list_history_steps(&entry_id).await
    }

    // ------------------------------------------------------------------
    // State changes
    // ------------------------------------------------------------------

    /// Move an entry to any lifecycle state
    pub async fn change_entry_state(&self, entry_id: Uuid, state: EntryState) -> Result<Entry> {
        let _guard = self.lock_entry(entry_id).await;

        let mut entry = self.load_entry(entry_id).await?;
        let previous = entry.state;
        entry.change_state(state, self.clock.now());
        let entry = self.storage.update_entry(entry).await?;

        info!(entry_id = %entry.id, from = %previous, to = %state, "entry state changed");
        self.publish_state_change(&entry, previous);
        Ok(entry)
    }

    pub async fn complete_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.change_entry_state(entry_id, EntryState::Completed).await
    }

    pub async fn suspend_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.change_entry_state(entry_id, EntryState::Suspended).await
    }

    pub async fn kill_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.change_entry_state(entry_id, EntryState::Killed).await
    }

    // ------------------------------------------------------------------
    // Property sets
    // ------------------------------------------------------------------

    /// One property, or the whole bag as an object when `key` is `None`
    pub async fn get_property_set(&self, entry_id: Uuid, key: Option<&str>) -> Result<Option<Value>> {
        let entry = self.load_entry(entry_id).await?;
        Ok(match key {
            Some(key) => entry.property(key).cloned(),
            None => Some(Value::Object(entry.propertysets)),
        })
    }

    pub async fn set_property_set(&self, entry_id: Uuid, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock_entry(entry_id).await;

        let mut entry = self.load_entry(entry_id).await?;
        entry.set_property(key, value, self.clock.now());
        self.storage.update_entry(entry).await?;
        debug!(entry_id = %entry_id, key, "property set");
        Ok(())
    }

    /// Remove one property, or every property when `key` is `None`
    pub async fn remove_property_set(&self, entry_id: Uuid, key: Option<&str>) -> Result<()> {
        let _guard = self.lock_entry(entry_id).await;

        let mut entry = self.load_entry(entry_id).await?;
        entry.remove_property(key, self.clock.now());
        self.storage.update_entry(entry).await?;
        debug!(entry_id = %entry_id, key = key.unwrap_or("*"), "property removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn lock_entry(&self, entry_id: Uuid) -> EntryGuard<'_> {
        let lock = self
            .entry_locks
            .entry(entry_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        EntryGuard {
            locks: &self.entry_locks,
            entry_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.storage
            .get_entry(&entry_id)
            .await?
            .ok_or(WorkflowError::EntryNotFound { id: entry_id })
    }

    async fn load_contents(&self, entry: &Entry) -> Result<DefinitionContents> {
        let definition = self.get_definition(&entry.definition_id).await?;
        definition
            .contents
            .ok_or(WorkflowError::ConfigNotFound { id: definition.id })
    }

    /// Work out the history record and successors for step 5
    #[allow(clippy::too_many_arguments)]
    async fn plan_move<'a>(
        &self,
        contents: &'a DefinitionContents,
        entry: &Entry,
        current_steps: &[CurrentStep],
        found: &ActionMatch<'_>,
        result: &ResultDescriptor,
        caller: Option<String>,
        ctx: &FunctionContext,
    ) -> Result<PlannedMove<'a>> {
        let now = self.clock.now();
        let action_id = &found.action.id;
        let branch = found.current.branch_of;
        let history = found.current.close(result.old_status.as_deref(), caller, now);
        let mut updated = entry.clone();
        let mut created = Vec::new();
        // Where this branch goes on to, when it stays in its split
        let mut continuing: Option<StepId> = None;

        if let Some(split_id) = &result.split {
            let split = contents
                .split(split_id)
                .ok_or_else(|| WorkflowError::SplitNotFound { split: split_id.clone() })?;
            for target in &split.list {
                let (mut step, descriptor) = build_step(contents, entry.id, action_id, target, Some(history.id), now)?;
                step.branch_of = Some(history.id);
                created.push((step, descriptor));
            }
            debug!(entry_id = %entry.id, split = %split.id, branches = created.len(), "splitting");
        } else if let Some(join_id) = &result.join {
            let join = contents
                .join(join_id)
                .ok_or_else(|| WorkflowError::JoinNotFound { join: join_id.clone() })?;

            let mut ready = true;
            let mut merged_ids = Vec::new();
            if join.barrier {
                let key = Entry::join_key(&join.id, branch);
                updated.record_join_arrival(&key, history.id);
                let pending = siblings_heading_to(contents, current_steps, found.current, &join.id);
                if pending > 0 {
                    debug!(entry_id = %entry.id, join = %join.id, pending, "waiting for sibling branches");
                    ready = false;
                } else {
                    merged_ids = updated.take_join_arrivals(&key);
                }
            }

            if ready {
                if self.conditions.is_available(join.conditions.as_ref(), ctx).await? {
                    let (mut step, descriptor) =
                        build_step(contents, entry.id, action_id, &join.successor(), Some(history.id), now)?;
                    step.merged_ids = merged_ids;
                    created.push((step, descriptor));
                } else {
                    debug!(entry_id = %entry.id, join = %join.id, "join conditions not met, branch ends");
                }
            }
        } else {
            if result.is_empty() {
                return Err(WorkflowError::ResultNotAvailable { action: action_id.to_string() });
            }
            let (mut step, descriptor) = build_step(contents, entry.id, action_id, result, Some(history.id), now)?;
            step.branch_of = branch;
            continuing = Some(step.step_id.clone());
            created.push((step, descriptor));
        }

        if branch.is_some() {
            let released = self
                .release_stranded_joins(contents, &mut updated, current_steps, found.current, continuing.as_ref(), action_id, ctx, now)
                .await?;
            created.extend(released);
        }

        let entry = if updated.join_arrivals != entry.join_arrivals {
            updated.updated_at = now;
            Some(updated)
        } else {
            None
        };
        Ok(PlannedMove { history, created, entry })
    }

    /// Fire barrier joins whose last outstanding branch is `leaving`
    ///
    /// Called when `leaving` moves on without arriving at them. A join
    /// fires once no branch of the same split can still reach it; its
    /// successor points at the latest arrival.
    #[allow(clippy::too_many_arguments)]
    async fn release_stranded_joins<'a>(
        &self,
        contents: &'a DefinitionContents,
        entry: &mut Entry,
        current_steps: &[CurrentStep],
        leaving: &CurrentStep,
        continuing: Option<&StepId>,
        action_id: &ActionId,
        ctx: &FunctionContext,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<(CurrentStep, &'a StepDescriptor)>> {
        let mut released = Vec::new();
        for join in contents.joins.iter().filter(|join| join.barrier) {
            let key = Entry::join_key(&join.id, leaving.branch_of);
            if !entry.join_arrivals.contains_key(&key) {
                continue;
            }
            let still_reachable = continuing.map_or(false, |step| contents.can_reach_join(step, &join.id));
            if still_reachable || siblings_heading_to(contents, current_steps, leaving, &join.id) > 0 {
                continue;
            }

            let merged_ids = entry.take_join_arrivals(&key);
            if !self.conditions.is_available(join.conditions.as_ref(), ctx).await? {
                debug!(entry_id = %entry.id, join = %join.id, "join conditions not met, arrivals dropped");
                continue;
            }
            let (mut step, descriptor) =
                build_step(contents, entry.id, action_id, &join.successor(), merged_ids.last().copied(), now)?;
            step.merged_ids = merged_ids;
            debug!(entry_id = %entry.id, join = %join.id, "barrier join released");
            released.push((step, descriptor));
        }
        Ok(released)
    }

    /// Run post-commit hook lists in order and wrap up the outcome
    async fn finish(&self, transition: Transition, hooks: &[&[FunctionRef]], ctx: &FunctionContext) -> TransitionOutcome {
        for list in hooks {
            if let Err(error) = self.functions.run_hooks(list, ctx).await {
                let entry_id = ctx.entry_id().unwrap_or_default();
                warn!(
                    entry_id = %entry_id,
                    action_id = %transition.action_id,
                    error = %error,
                    "hook failed after the step moved"
                );
                self.events.publish(WorkflowEvent::HookFailed {
                    entry_id,
                    action_id: transition.action_id.clone(),
                    message: error.to_string(),
                    timestamp: self.clock.now(),
                });
                return TransitionOutcome::HookFailed { transition, error };
            }
        }
        TransitionOutcome::Completed(transition)
    }

    fn publish_state_change(&self, entry: &Entry, previous: EntryState) {
        if entry.state != previous {
            self.events.publish(WorkflowEvent::EntryStateChanged {
                entry_id: entry.id,
                from: previous,
                to: entry.state,
                timestamp: entry.updated_at,
            });
        }
    }
}

fn ensure_accepts_actions(entry: &Entry) -> Result<()> {
    if entry.state.accepts_actions() {
        Ok(())
    } else {
        Err(WorkflowError::StateNotActivated { entry: entry.id, state: entry.state })
    }
}

/// Other current steps of `leaving`'s split that can still reach the join
fn siblings_heading_to(
    contents: &DefinitionContents,
    current_steps: &[CurrentStep],
    leaving: &CurrentStep,
    join_id: &str,
) -> usize {
    let branch = match leaving.branch_of {
        Some(branch) => branch,
        None => return 0,
    };
    current_steps
        .iter()
        .filter(|step| step.id != leaving.id && step.branch_of == Some(branch))
        .filter(|step| contents.can_reach_join(&step.step_id, join_id))
        .count()
}

/// First current step (in creation order) whose step exposes the action
fn find_action<'a>(
    contents: &'a DefinitionContents,
    current_steps: &'a [CurrentStep],
    action_id: &ActionId,
) -> Result<ActionMatch<'a>> {
    for current in current_steps {
        let step = contents
            .step(&current.step_id)
            .ok_or_else(|| WorkflowError::StepNotFound { step: current.step_id.to_string() })?;
        if let Some(action) = step.action(action_id) {
            return Ok(ActionMatch { current, step, action });
        }
    }
    Err(WorkflowError::ActionNotFound { action: action_id.to_string() })
}

/// A new current step for `result`, paired with its step descriptor
fn build_step<'a>(
    contents: &'a DefinitionContents,
    entry_id: Uuid,
    action_id: &ActionId,
    result: &ResultDescriptor,
    previous_id: Option<Uuid>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(CurrentStep, &'a StepDescriptor)> {
    let step = CurrentStep::from_result(entry_id, action_id, result, previous_id, now)
        .ok_or_else(|| WorkflowError::ResultNotAvailable { action: action_id.to_string() })?;
    let descriptor = contents
        .step(&step.step_id)
        .ok_or_else(|| WorkflowError::StepNotFound { step: step.step_id.to_string() })?;
    Ok((step, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::engine::storage::InMemoryStorage;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn issue_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": "issue",
            "name": "Issue",
            "contents": {
                "initial_actions": [
                    {"id": 0, "name": "create", "results": [{"step": 1, "status": "Underway"}]}
                ],
                "steps": [
                    {"id": 1, "name": "Open", "pre_functions": [{"name": "Audit@record"}], "actions": [
                        {"id": 4, "name": "Start Progress", "screen": "-1",
                         "results": [{"step": 2, "status": "Underway", "old_status": "Finished"}]},
                        {"id": 7, "name": "Escalate",
                         "restrict_to": {"conditions": {"list": [{"name": "IsAdmin"}]}},
                         "results": [{"step": 2, "status": "Escalated"}]}
                    ]},
                    {"id": 2, "name": "In Progress", "actions": [
                        {"id": 5, "name": "Resolve", "screen": "resolve",
                         "post_functions": [{"name": "Notify@send"}],
                         "results": [{"step": 3, "status": "Finished"}]}
                    ]},
                    {"id": 3, "name": "Resolved"}
                ]
            }
        }))
        .unwrap()
    }

    struct Harness {
        engine: WorkflowEngine,
        clock: Arc<ManualClock>,
        audits: Arc<AtomicUsize>,
    }

    async fn harness(notify_fails: bool) -> Harness {
        let audits = Arc::new(AtomicUsize::new(0));
        let counter = audits.clone();
        let mut registry = FunctionRegistry::new();
        registry
            .register_hook_fn("Audit@record", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register_hook_fn("Notify@send", move |_| {
                if notify_fails {
                    Err(anyhow::anyhow!("mail server down"))
                } else {
                    Ok(())
                }
            })
            .register_predicate_fn("IsAdmin", |ctx| Ok(ctx.input("role") == Some(&json!("admin"))));

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = WorkflowEngine::new(Arc::new(InMemoryStorage::default()), Arc::new(registry))
            .with_clock(clock.clone());
        engine.save_definition(issue_definition()).await.unwrap();
        Harness { engine, clock, audits }
    }

    #[tokio::test]
    async fn test_initialize_activates_and_runs_step_pre_functions() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        assert_eq!(entry.state, EntryState::Created);
        assert!(h.engine.get_current_steps(entry.id).await.unwrap().is_empty());

        let outcome = h.engine.initialize(entry.id).await.unwrap();
        assert!(outcome.is_clean());
        assert_eq!(h.audits.load(Ordering::SeqCst), 1);

        let steps = h.engine.get_current_steps(entry.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_id, StepId::from(1));
        assert!(steps[0].previous_id.is_none());
        assert_eq!(h.engine.get_entry_state(entry.id).await.unwrap(), EntryState::Activated);
    }

    #[tokio::test]
    async fn test_do_action_moves_step_to_history() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.initialize(entry.id).await.unwrap();
        let started = h.clock.now();
        h.clock.advance(Duration::minutes(10));

        let mut inputs = Map::new();
        inputs.insert("caller".to_string(), json!("alice"));
        let outcome = h.engine.do_action(entry.id, &ActionId::from(4), inputs).await.unwrap();
        assert!(outcome.is_clean());

        let history = h.engine.get_history_steps(entry.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "Finished");
        assert_eq!(history[0].caller.as_deref(), Some("alice"));
        assert_eq!(history[0].start_time, started);
        assert_eq!(history[0].finish_time, h.clock.now());

        let current = h.engine.get_current_steps(entry.id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].step_id, StepId::from(2));
        assert_eq!(current[0].previous_id, Some(history[0].id));
        assert_eq!(outcome.transition().created, current);
    }

    #[tokio::test]
    async fn test_gated_action() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.initialize(entry.id).await.unwrap();

        let err = h.engine.do_action(entry.id, &ActionId::from(7), Map::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ActionNotAvailable { .. }));

        let mut inputs = Map::new();
        inputs.insert("role".to_string(), json!("admin"));
        let outcome = h.engine.do_action(entry.id, &ActionId::from(7), inputs).await.unwrap();
        assert_eq!(outcome.transition().created[0].status, "Escalated");
    }

    #[tokio::test]
    async fn test_post_commit_hook_failure_is_reported() {
        let h = harness(true).await;
        let mut events = h.engine.subscribe();
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.initialize(entry.id).await.unwrap();
        h.engine.do_action(entry.id, &ActionId::from(4), Map::new()).await.unwrap();

        let outcome = h.engine.do_action(entry.id, &ActionId::from(5), Map::new()).await.unwrap();
        assert!(!outcome.is_clean());
        match &outcome {
            TransitionOutcome::HookFailed { error, transition } => {
                assert!(matches!(error, WorkflowError::Hook { name, .. } if name == "Notify@send"));
                assert_eq!(transition.created[0].step_id, StepId::from(3));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The move itself stuck
        let current = h.engine.get_current_steps(entry.id).await.unwrap();
        assert_eq!(current[0].step_id, StepId::from(3));
        assert!(outcome.into_result().is_err());

        let mut saw_hook_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkflowEvent::HookFailed { .. }) {
                saw_hook_failure = true;
            }
        }
        assert!(saw_hook_failure);
    }

    #[tokio::test]
    async fn test_available_actions_and_queries() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.initialize(entry.id).await.unwrap();

        let actions = h.engine.get_available_actions(entry.id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, ActionId::from(4));
        assert_eq!(actions[0].screen.as_deref(), Some("-1"));

        let definition = h.engine.get_definition("issue").await.unwrap();
        let contents = definition.contents.unwrap();
        assert_eq!(WorkflowEngine::get_screens(&contents), vec!["resolve".to_string()]);
        assert_eq!(WorkflowEngine::get_step_num(&contents), 3);
        assert_eq!(h.engine.get_workflow_names().await.unwrap(), vec!["Issue".to_string()]);
    }

    #[tokio::test]
    async fn test_create_instance_requires_contents() {
        let h = harness(false).await;
        let err = h.engine.create_instance("missing").await.unwrap_err();
        assert!(matches!(err, WorkflowError::DefinitionNotFound { .. }));

        let mut empty = WorkflowDefinition::new("", "Draft", DefinitionContents::default());
        empty.contents = None;
        let saved = h.engine.save_definition(empty).await.unwrap();
        assert!(!saved.id.is_empty());
        let err = h.engine.create_instance(&saved.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_verify_functions_on_save() {
        let h = harness(false).await;
        let engine = WorkflowEngine::new(Arc::new(InMemoryStorage::default()), Arc::new(FunctionRegistry::new()))
            .with_config(EngineConfig { verify_functions: true, ..EngineConfig::default() });
        let err = engine.save_definition(issue_definition()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::FunctionNotFound { .. }));

        // The harness registry knows every referenced function
        assert!(h.engine.functions().verify_references(&issue_definition().contents.unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_state_changes_emit_events() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        let mut events = h.engine.subscribe();

        let suspended = h.engine.suspend_entry(entry.id).await.unwrap();
        assert_eq!(suspended.state, EntryState::Suspended);
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            WorkflowEvent::EntryStateChanged {
                entry_id: entry.id,
                from: EntryState::Created,
                to: EntryState::Suspended,
                timestamp: h.clock.now(),
            }
        );

        let err = h.engine.do_action(entry.id, &ActionId::from(4), Map::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::StateNotActivated { state: EntryState::Suspended, .. }));

        assert_eq!(h.engine.kill_entry(entry.id).await.unwrap().state, EntryState::Killed);
        assert_eq!(h.engine.complete_entry(entry.id).await.unwrap().state, EntryState::Completed);
    }

    #[tokio::test]
    async fn test_initialize_reactivates_suspended_entry() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.suspend_entry(entry.id).await.unwrap();

        let outcome = h.engine.initialize(entry.id).await.unwrap();
        assert!(outcome.is_clean());
        assert_eq!(h.engine.get_entry_state(entry.id).await.unwrap(), EntryState::Activated);
        assert_eq!(h.engine.get_current_steps(entry.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_locks_are_released_after_each_call() {
        let h = harness(false).await;
        let entry = h.engine.create_instance("issue").await.unwrap();
        h.engine.initialize(entry.id).await.unwrap();
        assert!(h.engine.entry_locks.is_empty());

        h.engine.do_action(entry.id, &ActionId::from(4), Map::new()).await.unwrap();
        h.engine.set_property_set(entry.id, "k", json!(1)).await.unwrap();
        h.engine.complete_entry(entry.id).await.unwrap();
        assert!(h.engine.entry_locks.is_empty());

        // Failed calls release too
        assert!(h.engine.do_action(entry.id, &ActionId::from(5), Map::new()).await.is_err());
        assert!(h.engine.entry_locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_locks_are_released_under_contention() {
        let h = harness(false).await;
        let engine = Arc::new(h.engine);
        let entry = engine.create_instance("issue").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.set_property_set(entry.id, &format!("k{}", i), json!(i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(engine.entry_locks.is_empty());
        let bag = engine.get_property_set(entry.id, None).await.unwrap().unwrap();
        assert_eq!(bag.as_object().unwrap().len(), 16);
    }
}
