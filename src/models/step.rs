// Step records - where an entry is now, and where it has been

//! # Current and History Steps
//!
//! - `CurrentStep`: an active position of an entry, waiting for an action.
//!   An entry has one per live branch.
//! - `HistoryStep`: the closed copy of a former current step, stamped with
//!   a closing status and finish time. History steps are never modified.
//!
//! Each new current step points back at the history step it descended from
//! through `previous_id`, so the history forms a linked audit trail.
//! Steps created by a split also carry `branch_of`, the history id of the
//! step that split, which plain moves hand down to their successors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::ResultDescriptor;
use super::ids::{ActionId, StepId};

/// An active position of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub id: Uuid,

    pub entry_id: Uuid,

    /// Action that produced this step
    pub action_id: ActionId,

    pub step_id: StepId,

    pub status: String,

    pub start_time: DateTime<Utc>,

    /// History step this one descended from; `None` for the root step
    #[serde(default)]
    pub previous_id: Option<Uuid>,

    /// Every history step merged into this one by a barrier join
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_ids: Vec<Uuid>,

    /// History id of the split this branch descends from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_of: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Value>,
}

impl CurrentStep {
    /// Build the step a result descriptor leads to
    ///
    /// Returns `None` when the descriptor has no target step.
    pub fn from_result(
        entry_id: Uuid,
        action_id: &ActionId,
        result: &ResultDescriptor,
        previous_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let step_id = result.step.clone()?;
        Some(CurrentStep {
            id: Uuid::new_v4(),
            entry_id,
            action_id: action_id.clone(),
            step_id,
            status: result.status.clone(),
            start_time: now,
            previous_id,
            merged_ids: Vec::new(),
            branch_of: None,
            owners: result.owners.clone(),
        })
    }

    /// Close this step into its history record
    ///
    /// A missing closing status is recorded as an empty string.
    pub fn close(&self, old_status: Option<&str>, caller: Option<String>, now: DateTime<Utc>) -> HistoryStep {
        HistoryStep {
            id: Uuid::new_v4(),
            entry_id: self.entry_id,
            action_id: self.action_id.clone(),
            step_id: self.step_id.clone(),
            status: old_status.unwrap_or_default().to_string(),
            start_time: self.start_time,
            finish_time: now,
            previous_id: self.previous_id,
            merged_ids: self.merged_ids.clone(),
            branch_of: self.branch_of,
            owners: self.owners.clone(),
            caller,
        }
    }
}

/// An immutable, closed step record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryStep {
    pub id: Uuid,

    pub entry_id: Uuid,

    pub action_id: ActionId,

    pub step_id: StepId,

    /// Closing status
    pub status: String,

    pub start_time: DateTime<Utc>,

    pub finish_time: DateTime<Utc>,

    #[serde(default)]
    pub previous_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_ids: Vec<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_of: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Value>,

    /// Who performed the action that closed the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}
