// Identifier types for steps and actions

//! # Step and Action Identifiers
//!
//! Definitions written by hand (or exported from older tooling) use either
//! numbers or strings for step and action ids: `{"step": 2}` and
//! `{"step": "2"}` mean the same thing. These newtypes normalize both forms
//! into a string at parse time so the rest of the engine compares ids by
//! value without caring how they were spelled.
//!
//! ## Rust Learning Notes:
//!
//! ### Newtype Pattern
//! Wrapping a `String` in a one-field struct gives it a distinct type, so a
//! `StepId` can never be passed where an `ActionId` is expected even though
//! both are strings underneath.
//!
//! ### `#[serde(from = "...")]`
//! Deserialization goes through an intermediate type (`RawId`) and then a
//! `From` conversion. Serialization is still derived normally, so ids are
//! always written back out as strings.

use serde::{Deserialize, Serialize};

/// Raw id as it appears in a definition document: a number or a string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Str(String),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Int(n) => n.to_string(),
            RawId::Str(s) => s,
        }
    }
}

macro_rules! workflow_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "RawId")]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn new<S: Into<String>>(name: S) -> Self {
                $name(name.into())
            }
        }

        impl From<RawId> for $name {
            fn from(raw: RawId) -> Self {
                $name(raw.into())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<i64> for $name {
            fn from(n: i64) -> Self {
                $name(n.to_string())
            }
        }

        impl From<i32> for $name {
            fn from(n: i32) -> Self {
                $name(n.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

workflow_id! {
    /// Identifies a step (a position in the workflow graph)
    ///
    /// Examples: "1" (open), "2" (in progress), "resolved"
    StepId
}

workflow_id! {
    /// Identifies an action (a named transition trigger)
    ///
    /// Examples: "start_progress", "resolve", "5"
    ActionId
}
