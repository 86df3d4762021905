// Workflow definitions - the configuration graph an entry moves through

//! # Workflow Definitions
//!
//! A `WorkflowDefinition` is the immutable configuration for one workflow
//! type. Its `contents` describe a graph:
//!
//! - **Steps**: positions an entry can occupy, each exposing actions
//! - **Actions**: named triggers, each with an ordered list of results
//! - **Results**: where an action leads (a step, a split, or a join)
//! - **Splits**: fan-out of one branch into several concurrent steps
//! - **Joins**: fan-in points that close a branch and optionally continue
//! - **Initial actions**: actions usable only to seed a fresh entry
//!
//! Conditions and hooks are referenced by name (`"Capability@entry_point"`)
//! and resolved through the function registry at run time.
//!
//! ## Example document
//!
//! ```json
//! {
//!   "initial_actions": [{"id": 0, "name": "create", "results": [{"step": 1, "status": "Underway"}]}],
//!   "steps": [
//!     {"id": 1, "name": "Open", "actions": [
//!       {"id": 4, "name": "Start", "screen": "-1", "results": [{"step": 2, "status": "Underway", "old_status": "Finished"}]}
//!     ]},
//!     {"id": 2, "name": "In Progress", "actions": []}
//!   ]
//! }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Parse, Don't Validate Later
//! The whole tree is deserialized into typed structs once, then checked by
//! `DefinitionContents::validate`. The transition engine never has to ask
//! "is this key present?" halfway through a transition.
//!
//! ### `#[serde(default)]`
//! Most lists are optional in hand-written definitions. `default` turns a
//! missing key into an empty `Vec` (or `None`), which keeps the structs
//! free of `Option<Vec<_>>` noise.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::ids::{ActionId, StepId};

/// Screen reference that marks "no screen" in definitions
pub const NO_SCREEN: &str = "-1";

/// A reference to a registered function: a condition predicate or a hook
///
/// `name` has the form `"Capability@entry_point"`; the entry point defaults
/// to `handle` when omitted. `args` are merged over the variable context
/// the function receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl FunctionRef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        FunctionRef {
            name: name.into(),
            args: Map::new(),
        }
    }

    /// Builder helper that adds one static argument
    pub fn with_arg<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// How the leaves of a `Conditions` node are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    #[default]
    And,
    Or,
}

/// A condition tree: `{"type": "and"|"or", "list": [function refs]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(rename = "type", default)]
    pub kind: ConditionType,

    #[serde(default)]
    pub list: Vec<FunctionRef>,
}

impl Conditions {
    pub fn all(list: Vec<FunctionRef>) -> Self {
        Conditions {
            kind: ConditionType::And,
            list,
        }
    }

    pub fn any(list: Vec<FunctionRef>) -> Self {
        Conditions {
            kind: ConditionType::Or,
            list,
        }
    }
}

/// Availability gate on an action or step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestrictTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

/// Outcome of an action: where the entry goes next
///
/// Exactly one of `step`, `split` or `join` drives the transition. A
/// descriptor with none of them is the "empty result" produced when no
/// entry of a results list qualifies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_functions: Vec<FunctionRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_functions: Vec<FunctionRef>,

    /// Status stamped on the step being closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
}

impl ResultDescriptor {
    /// Plain result leading to `step` with the given status
    pub fn to_step<S: Into<StepId>, T: Into<String>>(step: S, status: T) -> Self {
        ResultDescriptor {
            step: Some(step.into()),
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_none() && self.split.is_none() && self.join.is_none()
    }
}

/// Action available from a step (or as an initial action)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub id: ActionId,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_to: Option<RestrictTo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_functions: Vec<FunctionRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_functions: Vec<FunctionRef>,

    #[serde(default)]
    pub results: Vec<ResultDescriptor>,

    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub screen: Option<String>,
}

impl ActionDescriptor {
    pub fn new<I: Into<ActionId>, N: Into<String>>(id: I, name: N, results: Vec<ResultDescriptor>) -> Self {
        ActionDescriptor {
            id: id.into(),
            name: name.into(),
            restrict_to: None,
            pre_functions: Vec::new(),
            post_functions: Vec::new(),
            results,
            screen: None,
        }
    }

    /// Availability conditions, if any are declared
    pub fn gate(&self) -> Option<&Conditions> {
        self.restrict_to.as_ref().and_then(|r| r.conditions.as_ref())
    }
}

/// A named position in the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: StepId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_to: Option<RestrictTo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_functions: Vec<FunctionRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_functions: Vec<FunctionRef>,
}

impl StepDescriptor {
    pub fn new<I: Into<StepId>, N: Into<String>>(id: I, name: N, actions: Vec<ActionDescriptor>) -> Self {
        StepDescriptor {
            id: id.into(),
            name: name.into(),
            actions,
            restrict_to: None,
            pre_functions: Vec::new(),
            post_functions: Vec::new(),
        }
    }

    /// Step-level gate applied to every action on this step
    pub fn gate(&self) -> Option<&Conditions> {
        self.restrict_to.as_ref().and_then(|r| r.conditions.as_ref())
    }

    pub fn action(&self, action_id: &ActionId) -> Option<&ActionDescriptor> {
        self.actions.iter().find(|a| a.id == *action_id)
    }
}

/// Fan-out descriptor: every listed result becomes a concurrent branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitDescriptor {
    pub id: String,

    #[serde(default)]
    pub list: Vec<ResultDescriptor>,
}

/// Fan-in descriptor
///
/// The join's own `step`/`status`/`owners` form the result used for the
/// successor step. With `barrier` unset a join continues as soon as its
/// `conditions` pass for the arriving branch; with `barrier` set it also
/// waits until no other branch of the same split can still reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDescriptor {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Value>,

    #[serde(default)]
    pub barrier: bool,
}

impl JoinDescriptor {
    /// Result descriptor for the merged successor step
    pub fn successor(&self) -> ResultDescriptor {
        ResultDescriptor {
            step: self.step.clone(),
            status: self.status.clone(),
            owners: self.owners.clone(),
            ..Default::default()
        }
    }
}

/// The configuration graph of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionContents {
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,

    #[serde(default)]
    pub initial_actions: Vec<ActionDescriptor>,

    #[serde(default)]
    pub splits: Vec<SplitDescriptor>,

    #[serde(default)]
    pub joins: Vec<JoinDescriptor>,
}

impl DefinitionContents {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == *step_id)
    }

    pub fn split(&self, split_id: &str) -> Option<&SplitDescriptor> {
        self.splits.iter().find(|s| s.id == split_id)
    }

    pub fn join(&self, join_id: &str) -> Option<&JoinDescriptor> {
        self.joins.iter().find(|j| j.id == join_id)
    }

    /// Screens referenced by step actions, distinct and in first-seen order
    ///
    /// The `"-1"` sentinel (no screen) is skipped.
    pub fn screens(&self) -> Vec<String> {
        let mut screens: Vec<String> = Vec::new();
        for action in self.steps.iter().flat_map(|s| &s.actions) {
            match action.screen.as_deref() {
                Some(screen) if !screen.is_empty() && screen != NO_SCREEN => {
                    if !screens.iter().any(|s| s == screen) {
                        screens.push(screen.to_string());
                    }
                }
                _ => {}
            }
        }
        screens
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Whether a branch sitting on `from` can still arrive at `join_id`
    ///
    /// Follows every action result through plain moves, splits and other
    /// joins. Conditions are ignored, so this is an upper bound.
    pub fn can_reach_join(&self, from: &StepId, join_id: &str) -> bool {
        let mut seen: HashSet<&StepId> = HashSet::new();
        let mut pending: Vec<&StepId> = vec![from];
        while let Some(step_id) = pending.pop() {
            if !seen.insert(step_id) {
                continue;
            }
            let step = match self.step(step_id) {
                Some(step) => step,
                None => continue,
            };
            for result in step.actions.iter().flat_map(|a| &a.results) {
                if result.join.as_deref() == Some(join_id) {
                    return true;
                }
                if let Some(split) = result.split.as_deref().and_then(|id| self.split(id)) {
                    pending.extend(split.list.iter().filter_map(|branch| branch.step.as_ref()));
                } else if let Some(join) = result.join.as_deref().and_then(|id| self.join(id)) {
                    pending.extend(join.step.as_ref());
                } else if let Some(next) = &result.step {
                    pending.push(next);
                }
            }
        }
        false
    }

    /// Every function reference in the graph: hooks and condition leaves
    pub fn function_refs(&self) -> Vec<&FunctionRef> {
        fn from_conditions<'a>(conditions: Option<&'a Conditions>, out: &mut Vec<&'a FunctionRef>) {
            if let Some(c) = conditions {
                out.extend(c.list.iter());
            }
        }
        fn from_result<'a>(result: &'a ResultDescriptor, out: &mut Vec<&'a FunctionRef>) {
            from_conditions(result.conditions.as_ref(), out);
            out.extend(result.pre_functions.iter());
            out.extend(result.post_functions.iter());
        }
        fn from_action<'a>(action: &'a ActionDescriptor, out: &mut Vec<&'a FunctionRef>) {
            from_conditions(action.gate(), out);
            out.extend(action.pre_functions.iter());
            out.extend(action.post_functions.iter());
            for result in &action.results {
                from_result(result, out);
            }
        }

        let mut refs = Vec::new();
        for action in &self.initial_actions {
            from_action(action, &mut refs);
        }
        for step in &self.steps {
            from_conditions(step.gate(), &mut refs);
            refs.extend(step.pre_functions.iter());
            refs.extend(step.post_functions.iter());
            for action in &step.actions {
                from_action(action, &mut refs);
            }
        }
        for split in &self.splits {
            for result in &split.list {
                from_result(result, &mut refs);
            }
        }
        for join in &self.joins {
            from_conditions(join.conditions.as_ref(), &mut refs);
        }
        refs
    }

    /// Check that the graph is well-formed
    ///
    /// Rejects duplicate ids, results that point at unknown steps, splits or
    /// joins, results that name both a split and a join (or nothing at all),
    /// split branches that do not lead directly to a step, and blank
    /// function names. Running this once at load time means a
    /// transition never discovers a broken reference halfway through.
    pub fn validate(&self) -> Result<(), String> {
        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(&step.id) {
                return Err(format!("Duplicate step id '{}'", step.id));
            }
            let mut action_ids = HashSet::new();
            for action in &step.actions {
                if !action_ids.insert(&action.id) {
                    return Err(format!(
                        "Step '{}' declares action '{}' more than once",
                        step.id, action.id
                    ));
                }
            }
        }

        let split_ids: HashSet<&str> = self.splits.iter().map(|s| s.id.as_str()).collect();
        if split_ids.len() != self.splits.len() {
            return Err("Duplicate split id".to_string());
        }
        let join_ids: HashSet<&str> = self.joins.iter().map(|j| j.id.as_str()).collect();
        if join_ids.len() != self.joins.len() {
            return Err("Duplicate join id".to_string());
        }

        let check_result = |owner: &str, result: &ResultDescriptor| -> Result<(), String> {
            match (&result.split, &result.join) {
                (Some(_), Some(_)) => {
                    return Err(format!("{} has a result naming both a split and a join", owner));
                }
                (Some(split), None) => {
                    if !split_ids.contains(split.as_str()) {
                        return Err(format!("{} references unknown split '{}'", owner, split));
                    }
                }
                (None, Some(join)) => {
                    if !join_ids.contains(join.as_str()) {
                        return Err(format!("{} references unknown join '{}'", owner, join));
                    }
                }
                (None, None) => match &result.step {
                    Some(step) if !step_ids.contains(step) => {
                        return Err(format!("{} references unknown step '{}'", owner, step));
                    }
                    Some(_) => {}
                    None => {
                        return Err(format!("{} has a result without a step, split or join", owner));
                    }
                },
            }
            Ok(())
        };

        for action in &self.initial_actions {
            let owner = format!("Initial action '{}'", action.id);
            if action.results.is_empty() {
                return Err(format!("{} has no results", owner));
            }
            for result in &action.results {
                if result.split.is_some() || result.join.is_some() {
                    return Err(format!("{} must lead directly to a step", owner));
                }
                check_result(&owner, result)?;
            }
        }

        for step in &self.steps {
            for action in &step.actions {
                let owner = format!("Action '{}' on step '{}'", action.id, step.id);
                for result in &action.results {
                    check_result(&owner, result)?;
                }
            }
        }

        for split in &self.splits {
            let owner = format!("Split '{}'", split.id);
            if split.list.is_empty() {
                return Err(format!("{} has no branches", owner));
            }
            for result in &split.list {
                if result.split.is_some() || result.join.is_some() {
                    return Err(format!("{} has a branch that does not lead directly to a step", owner));
                }
                check_result(&owner, result)?;
            }
        }

        for join in &self.joins {
            match &join.step {
                Some(step) if step_ids.contains(step) => {}
                Some(step) => {
                    return Err(format!("Join '{}' references unknown step '{}'", join.id, step));
                }
                None => return Err(format!("Join '{}' has no successor step", join.id)),
            }
        }

        if let Some(f) = self.function_refs().into_iter().find(|f| f.name.trim().is_empty()) {
            return Err(format!("Function reference with empty name (args: {:?})", f.args));
        }

        Ok(())
    }
}

/// A stored workflow definition
///
/// `contents` is optional because definitions are created by name first and
/// filled in later by the designer; an entry cannot run until it is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<DefinitionContents>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, contents: DefinitionContents) -> Self {
        WorkflowDefinition {
            id: id.into(),
            name: name.into(),
            contents: Some(contents),
            updated_at: Utc::now(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
