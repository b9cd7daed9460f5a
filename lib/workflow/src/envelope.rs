//! Versioned envelope for published events.
//!
//! Every event a run broadcasts to subscribers is wrapped with a format
//! version and a per-run sequence number, so consumers can detect schema
//! changes and gaps after lagging behind the broadcast channel.

use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned, sequenced wrapper around a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// Position of the payload in its stream, starting at 0.
    pub sequence: u64,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(sequence: u64, payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            sequence,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns a reference to the payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to a single JSON line, without the newline.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Deserializes an envelope from one JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionEvent;
    use chrono::Utc;
    use weft_core::RunId;

    #[test]
    fn envelope_wraps_events() {
        let run_id = RunId::new();
        let envelope = Envelope::new(
            7,
            ExecutionEvent::RunCompleted {
                run_id,
                timestamp: Utc::now(),
            },
        );

        assert!(envelope.is_current_version());
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.payload().run_id(), run_id);
    }

    #[test]
    fn json_line_shape() {
        let envelope = Envelope::new(
            0,
            ExecutionEvent::RunCancelled {
                run_id: RunId::new(),
                timestamp: Utc::now(),
            },
        );
        let line = envelope.to_json_line().expect("serialize");
        assert!(!line.contains('\n'));

        let json: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(json["version"], CURRENT_VERSION);
        assert_eq!(json["payload"]["type"], "run_cancelled");

        let parsed: Envelope<ExecutionEvent> = Envelope::from_json_line(&line).expect("parse");
        assert_eq!(parsed, envelope);
    }
}
