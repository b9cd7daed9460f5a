//! Port system for workflow nodes.
//!
//! Ports are named connection points on nodes. Input ports are
//! single-valued (at most one incoming edge); output ports broadcast to any
//! number of edges.

use serde::{Deserialize, Serialize};

/// The port most nodes read from.
pub const DEFAULT_INPUT: &str = "input";

/// The port most nodes write to.
pub const DEFAULT_OUTPUT: &str = "output";

/// An input port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPort {
    /// The port name (unique within the node's inputs).
    pub name: String,
    /// Whether a value must arrive on this port for the node to be useful.
    pub required: bool,
}

impl InputPort {
    /// Creates a required input port.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    /// Creates an optional input port.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// An output port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPort {
    /// The port name (unique within the node's outputs).
    pub name: String,
}

impl OutputPort {
    /// Creates an output port.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_port_required_flag() {
        assert!(InputPort::required("input").required);
        assert!(!InputPort::optional("loopBack").required);
    }

    #[test]
    fn output_port_serializes_name() {
        let json = serde_json::to_value(OutputPort::new("true")).expect("serialize");
        assert_eq!(json["name"], "true");
    }
}
