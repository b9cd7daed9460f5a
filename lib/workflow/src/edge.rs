//! Edge types for workflow graphs.
//!
//! Edges connect an output port of one node to an input port of another.
//! An edge into a loop node's `loopBack` port closes that loop's body and is
//! not a dependency in the scheduling sense.

use crate::node::NodeId;
use crate::port::{DEFAULT_INPUT, DEFAULT_OUTPUT};
use serde::{Deserialize, Serialize};

/// Input port on `loop` nodes that receives each iteration's result.
pub const LOOP_BACK_PORT: &str = "loopBack";

/// The port labels carried by an edge inside the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The name of the output port on the source node.
    pub source_port: String,
    /// The name of the input port on the target node.
    pub target_port: String,
    /// Whether this edge closes a loop body.
    #[serde(default)]
    pub loop_back: bool,
}

impl Edge {
    /// Creates a new edge between ports.
    #[must_use]
    pub fn new(source_port: impl Into<String>, target_port: impl Into<String>) -> Self {
        Self {
            source_port: source_port.into(),
            target_port: target_port.into(),
            loop_back: false,
        }
    }

    /// Marks the edge as a loop-back edge.
    #[must_use]
    pub fn into_loop_back(mut self) -> Self {
        self.loop_back = true;
        self
    }
}

fn default_output() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_input() -> String {
    DEFAULT_INPUT.to_string()
}

/// A complete edge reference as written in a graph document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRef {
    /// The source node ID.
    #[serde(rename = "source")]
    pub source_node: NodeId,
    /// The source port name.
    #[serde(default = "default_output")]
    pub source_port: String,
    /// The target node ID.
    #[serde(rename = "target")]
    pub target_node: NodeId,
    /// The target port name.
    #[serde(default = "default_input")]
    pub target_port: String,
}

impl EdgeRef {
    /// Creates a new edge reference.
    #[must_use]
    pub fn new(
        source_node: impl Into<NodeId>,
        source_port: impl Into<String>,
        target_node: impl Into<NodeId>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            source_port: source_port.into(),
            target_node: target_node.into(),
            target_port: target_port.into(),
        }
    }

    /// Creates an edge reference using default port names.
    #[must_use]
    pub fn with_default_ports(source_node: impl Into<NodeId>, target_node: impl Into<NodeId>) -> Self {
        Self::new(source_node, DEFAULT_OUTPUT, target_node, DEFAULT_INPUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_marked_edges_close_loops() {
        assert!(!Edge::new("output", "input").loop_back);
        assert!(Edge::new("output", LOOP_BACK_PORT).into_loop_back().loop_back);
    }

    #[test]
    fn edge_ref_document_form() {
        let edge: EdgeRef = serde_json::from_value(serde_json::json!({
            "source": "cond",
            "sourcePort": "true",
            "target": "out1",
        }))
        .expect("deserialize");

        assert_eq!(edge.source_node.as_str(), "cond");
        assert_eq!(edge.source_port, "true");
        assert_eq!(edge.target_node.as_str(), "out1");
        assert_eq!(edge.target_port, "input");
    }

    #[test]
    fn edge_ref_with_default_ports() {
        let edge = EdgeRef::with_default_ports("a", "b");
        assert_eq!(edge.source_port, "output");
        assert_eq!(edge.target_port, "input");
    }
}
