//! Types for representing what happened on each device.

use crate::core::Value;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// Classifies a failed device session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The connection could not be established.
    Connect,

    /// The connection attempt or the function call exceeded the device's timeout.
    Timeout,

    /// The function ran and returned an error.
    Invocation,

    /// No function is registered under the requested name.
    UnknownFunction,

    /// The function panicked, or the session's worker died before it produced an outcome.
    Crashed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FailureKind::*;
        let name = match self {
            Connect => "connection failed",
            Timeout => "timed out",
            Invocation => "function failed",
            UnknownFunction => "unknown function",
            Crashed => "worker crashed",
        };
        f.write_str(name)
    }
}

/// The error marker recorded for a failed device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// One device's outcome: the function's return value, or an error marker.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(Failure),
}

// A single-entry map, not serde_yaml's `!success` tag notation.
impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Outcome::Success(value) => map.serialize_entry("success", value)?,
            Outcome::Failure(failure) => map.serialize_entry("failure", failure)?,
        }
        map.end()
    }
}

impl Outcome {
    /// Shorthand for building an [Outcome::Failure].
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure(Failure {
            kind,
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure kind, or [None] on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure.kind),
        }
    }
}

/// One device's outcome, tagged with the device's identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionResult {
    pub id: String,
    pub outcome: Outcome,
}

/// Maps each device identifier to its [Outcome].
///
/// Append-only: recording a second outcome for the same device is refused.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultSet(BTreeMap<String, Outcome>);

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `result`. Returns `false`, leaving the set untouched, if the device already has
    /// an outcome.
    pub fn record(&mut self, result: SessionResult) -> bool {
        match self.0.entry(result.id) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(result.outcome);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Outcome> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Device identifiers in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.0.iter().map(|(id, outcome)| (id.as_str(), outcome))
    }

    /// The number of devices whose session failed.
    pub fn failures(&self) -> usize {
        self.0.values().filter(|o| !o.is_success()).count()
    }

    pub fn into_inner(self) -> BTreeMap<String, Outcome> {
        self.0
    }
}
