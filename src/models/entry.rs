// Entry domain model - one running instance of a workflow

//! # Entry Model
//!
//! An `Entry` is a single instance of a workflow definition: an issue moving
//! through "Open → In Progress → Resolved", for example. The entry itself
//! only holds identity, lifecycle state and a free-form property bag; the
//! position in the graph lives in separate current-step records (see
//! `step.rs`) because a split can put one entry in several steps at once.
//!
//! ## Rust Learning Notes:
//!
//! ### Enums with Serde Renaming
//! `EntryState` serializes as `"CREATED"`, `"ACTIVATED"`, ... using
//! `#[serde(rename_all = "SCREAMING_SNAKE_CASE")]`, so stored records stay
//! readable without hand-written string conversions.
//!
//! ### Injected Timestamps
//! Constructors take `now: DateTime<Utc>` instead of calling `Utc::now()`
//! themselves. The engine passes in the time from its clock, which lets
//! tests pin timestamps to known values.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque per-entry key/value bag for business data
///
/// The engine moves values in and out but never interprets them.
pub type PropertySet = Map<String, Value>;

/// Lifecycle state of an entry
///
/// The engine itself only moves entries from `Created` to `Activated`.
/// The remaining states are set by callers; once an entry leaves
/// `Created`/`Activated` no further actions are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Created,
    Activated,
    Suspended,
    Completed,
    Killed,
}

impl EntryState {
    /// Whether actions may still be performed in this state
    pub fn accepts_actions(&self) -> bool {
        matches!(self, EntryState::Created | EntryState::Activated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Created => "CREATED",
            EntryState::Activated => "ACTIVATED",
            EntryState::Suspended => "SUSPENDED",
            EntryState::Completed => "COMPLETED",
            EntryState::Killed => "KILLED",
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,

    /// Owning definition (lookup only; the definition is stored separately)
    pub definition_id: String,

    pub state: EntryState,

    #[serde(default)]
    pub propertysets: PropertySet,

    /// History ids of branches that have arrived at each barrier join
    ///
    /// Keyed by join id, qualified with the split the branches came from
    /// (see `join_key`).
    ///
    /// Engine bookkeeping for barrier joins. Kept apart from `propertysets`
    /// so business data and engine state never collide.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub join_arrivals: HashMap<String, Vec<Uuid>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Create a fresh entry in the `Created` state
    pub fn new<S: Into<String>>(definition_id: S, now: DateTime<Utc>) -> Self {
        Entry {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            state: EntryState::Created,
            propertysets: PropertySet::new(),
            join_arrivals: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn change_state(&mut self, state: EntryState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.propertysets.get(key)
    }

    pub fn set_property<K: Into<String>>(&mut self, key: K, value: Value, now: DateTime<Utc>) {
        self.propertysets.insert(key.into(), value);
        self.updated_at = now;
    }

    /// Remove one key, or the whole bag when `key` is `None`
    pub fn remove_property(&mut self, key: Option<&str>, now: DateTime<Utc>) {
        match key {
            Some(key) => {
                self.propertysets.remove(key);
            }
            None => self.propertysets.clear(),
        }
        self.updated_at = now;
    }

    /// Bookkeeping key for arrivals at `join_id` from one split
    pub fn join_key(join_id: &str, branch_of: Option<Uuid>) -> String {
        match branch_of {
            Some(split) => format!("{}#{}", join_id, split),
            None => join_id.to_string(),
        }
    }

    /// Record a branch arriving at a join, returning every arrival so far
    pub fn record_join_arrival(&mut self, join_id: &str, history_id: Uuid) -> &[Uuid] {
        let arrivals = self.join_arrivals.entry(join_id.to_string()).or_default();
        arrivals.push(history_id);
        arrivals
    }

    /// Consume the arrivals for a join once it fires
    pub fn take_join_arrivals(&mut self, join_id: &str) -> Vec<Uuid> {
        self.join_arrivals.remove(join_id).unwrap_or_default()
    }

    /// Flatten the entry into the variable map handed to functions
    ///
    /// Every serialized field becomes a top-level key (`id`,
    /// `definition_id`, `state`, `propertysets`, ...).
    pub fn to_vars(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_is_created() {
        let now = Utc::now();
        let entry = Entry::new("wf-1", now);
        assert_eq!(entry.state, EntryState::Created);
        assert_eq!(entry.definition_id, "wf-1");
        assert!(entry.propertysets.is_empty());
        assert_eq!(entry.created_at, now);
    }

    #[test]
    fn test_accepts_actions() {
        assert!(EntryState::Created.accepts_actions());
        assert!(EntryState::Activated.accepts_actions());
        assert!(!EntryState::Suspended.accepts_actions());
        assert!(!EntryState::Completed.accepts_actions());
        assert!(!EntryState::Killed.accepts_actions());
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_value(EntryState::Activated).unwrap(), json!("ACTIVATED"));
        assert_eq!(EntryState::Killed.to_string(), "KILLED");
    }

    #[test]
    fn test_property_bag() {
        let now = Utc::now();
        let mut entry = Entry::new("wf-1", now);
        entry.set_property("assignee", json!("alice"), now);
        entry.set_property("priority", json!(3), now);
        assert_eq!(entry.property("assignee"), Some(&json!("alice")));

        entry.remove_property(Some("assignee"), now);
        assert!(entry.property("assignee").is_none());
        assert_eq!(entry.propertysets.len(), 1);

        entry.remove_property(None, now);
        assert!(entry.propertysets.is_empty());
    }

    #[test]
    fn test_join_arrivals() {
        let mut entry = Entry::new("wf-1", Utc::now());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(entry.record_join_arrival("merge", first).len(), 1);
        assert_eq!(entry.record_join_arrival("merge", second), &[first, second]);

        assert_eq!(entry.take_join_arrivals("merge"), vec![first, second]);
        assert!(entry.take_join_arrivals("merge").is_empty());
    }

    #[test]
    fn test_join_key_is_scoped_to_split() {
        let split = Uuid::new_v4();
        assert_eq!(Entry::join_key("merge", None), "merge");
        assert_eq!(Entry::join_key("merge", Some(split)), format!("merge#{}", split));
        assert_ne!(Entry::join_key("merge", Some(split)), Entry::join_key("merge", Some(Uuid::new_v4())));
    }

    #[test]
    fn test_vars_contain_entry_fields() {
        let mut entry = Entry::new("wf-1", Utc::now());
        entry.set_property("k", json!("v"), Utc::now());
        let vars = entry.to_vars();
        assert_eq!(vars["definition_id"], json!("wf-1"));
        assert_eq!(vars["state"], json!("CREATED"));
        assert_eq!(vars["propertysets"]["k"], json!("v"));
        assert_eq!(vars["id"], json!(entry.id.to_string()));
    }
}
