//! Run identifiers.
//!
//! Runs are named by a ULID, so ids sort by the time the engine issued
//! them. The textual form is `run_<ulid>`; the bare ULID is accepted on
//! input. Node ids are user-authored strings and live in the workflow
//! crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ulid::Ulid;

const PREFIX: &str = "run_";

/// Error returned when a string is not a run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The rejected input.
    pub input: String,
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run id {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Identifier of a single execution (run) of a workflow graph.
///
/// Serialized in its prefixed textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RunId(Ulid);

impl RunId {
    /// Issues a fresh id stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// When the id was issued, to millisecond precision.
    #[must_use]
    pub fn issued_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0.timestamp_ms())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw).map(Self).map_err(|e| ParseIdError {
            input: s.to_string(),
            reason: e.to_string(),
        })
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RunId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn displays_with_prefix() {
        let id = RunId::new();
        assert!(id.to_string().starts_with("run_"));
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let id = RunId::new();
        let prefixed: RunId = id.to_string().parse().expect("prefixed");
        let bare: RunId = id.0.to_string().parse().expect("bare");
        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
    }

    #[test]
    fn rejects_garbage() {
        let err = "run_not-a-ulid".parse::<RunId>().unwrap_err();
        assert_eq!(err.input, "run_not-a-ulid");
        assert!(err.to_string().starts_with("invalid run id"));
    }

    #[test]
    fn serializes_as_prefixed_string() {
        let id = RunId::new();
        let json = serde_json::to_value(id).expect("serialize");
        assert_eq!(json, serde_json::Value::String(id.to_string()));
        let back: RunId = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn fresh_ids_are_distinct() {
        let ids: HashSet<RunId> = (0..16).map(|_| RunId::new()).collect();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn issue_time_is_recent() {
        let id = RunId::new();
        let age = SystemTime::now()
            .duration_since(id.issued_at())
            .unwrap_or_default();
        assert!(age < Duration::from_secs(60));
    }
}
