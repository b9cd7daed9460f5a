//! Workflow graph implementation using petgraph.
//!
//! Workflows are directed graphs where:
//! - Nodes are typed units of work with named ports
//! - Edges connect output ports to input ports
//!
//! The graph is immutable for the duration of a run. It serializes to and
//! from the graph document format (see `document`).

use crate::document::GraphDocument;
use crate::edge::{Edge, EdgeRef, LOOP_BACK_PORT};
use crate::error::ValidationError;
use crate::node::{Node, NodeConfig, NodeId, NodeType};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef as _};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct WorkflowGraph {
    /// Optional workflow name from the document.
    pub name: Option<String>,
    /// Optional workflow description from the document.
    pub description: Option<String>,
    /// The underlying directed graph.
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            description: None,
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if a node with the same id exists.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, ValidationError> {
        if self.node_index_map.contains_key(&node.id) {
            return Err(ValidationError::DuplicateNode { node_id: node.id });
        }
        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id.clone(), index);
        Ok(node_id)
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Adds an edge between two nodes.
    ///
    /// An edge into a loop node's `loopBack` port is stored as a loop-back
    /// edge.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Source or target node doesn't exist
    /// - Source port doesn't exist on source node
    /// - Target port doesn't exist on target node
    /// - Target port already has an incoming edge
    pub fn add_edge(&mut self, edge: EdgeRef) -> Result<(), ValidationError> {
        let source_index = *self
            .node_index_map
            .get(&edge.source_node)
            .ok_or_else(|| ValidationError::NodeNotFound {
                node_id: edge.source_node.clone(),
            })?;
        let target_index = *self
            .node_index_map
            .get(&edge.target_node)
            .ok_or_else(|| ValidationError::NodeNotFound {
                node_id: edge.target_node.clone(),
            })?;

        let source_node = &self.graph[source_index];
        let target_node = &self.graph[target_index];

        if source_node.output_port(&edge.source_port).is_none() {
            return Err(ValidationError::SourcePortNotFound {
                node_id: edge.source_node,
                port_name: edge.source_port,
            });
        }
        if target_node.input_port(&edge.target_port).is_none() {
            return Err(ValidationError::TargetPortNotFound {
                node_id: edge.target_node,
                port_name: edge.target_port,
            });
        }

        let already_connected = self
            .graph
            .edges_directed(target_index, Direction::Incoming)
            .any(|e| e.weight().target_port == edge.target_port);
        if already_connected {
            return Err(ValidationError::TargetPortAlreadyConnected {
                node_id: edge.target_node,
                port_name: edge.target_port,
            });
        }

        let loop_back =
            target_node.node_type() == NodeType::Loop && edge.target_port == LOOP_BACK_PORT;
        let mut weight = Edge::new(edge.source_port, edge.target_port);
        if loop_back {
            weight = weight.into_loop_back();
        }
        self.graph.add_edge(source_index, target_index, weight);
        Ok(())
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns all edges as document references.
    pub fn edges(&self) -> impl Iterator<Item = EdgeRef> + '_ {
        self.graph.edge_references().map(|e| {
            EdgeRef::new(
                self.graph[e.source()].id.clone(),
                e.weight().source_port.clone(),
                self.graph[e.target()].id.clone(),
                e.weight().target_port.clone(),
            )
        })
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns nodes without incoming edges, ignoring loop-back edges.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                !self
                    .graph
                    .edges_directed(idx, Direction::Incoming)
                    .any(|e| !e.weight().loop_back)
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Returns the single trigger entry of a validated graph.
    #[must_use]
    pub fn entry(&self) -> Option<&Node> {
        match self.entry_nodes().as_slice() {
            [entry] if entry.node_type() == NodeType::Trigger => Some(*entry),
            _ => None,
        }
    }

    /// Returns the successors (downstream nodes) of a given node.
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| (&self.graph[edge.target()], edge.weight()))
            .collect()
    }

    /// Returns the predecessors (upstream nodes) of a given node.
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (&self.graph[edge.source()], edge.weight()))
            .collect()
    }

    /// Returns node ids in dependency order, ignoring loop-back edges.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if the remaining edges form a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, ValidationError> {
        let forward = self
            .graph
            .filter_map(|_, _| Some(()), |_, e| (!e.loop_back).then_some(()));
        let order = petgraph::algo::toposort(&forward, None)
            .map_err(|_| ValidationError::CycleDetected)?;
        Ok(order
            .into_iter()
            .map(|idx| self.graph[idx].id.clone())
            .collect())
    }

    /// Validates the workflow graph.
    ///
    /// Checks:
    /// - All required input ports have incoming edges
    /// - Exactly one entry node, and it is a trigger
    /// - No cycles outside loop-back edges
    /// - Every node is reachable from the entry
    /// - Output keys are unique
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for node in self.nodes() {
            let incoming_ports: Vec<_> = self
                .predecessors(&node.id)
                .iter()
                .map(|(_, edge)| edge.target_port.as_str())
                .collect();

            let missing = node
                .inputs
                .iter()
                .find(|input| input.required && !incoming_ports.contains(&input.name.as_str()));
            if let Some(input) = missing
                && !incoming_ports.is_empty()
            {
                return Err(ValidationError::RequiredInputMissing {
                    node_id: node.id.clone(),
                    port_name: input.name.clone(),
                });
            }
        }

        let entry = match self.entry_nodes().as_slice() {
            [] => return Err(ValidationError::NoEntryNode),
            [entry] => *entry,
            entries => {
                return Err(ValidationError::MultipleEntryNodes {
                    node_ids: entries.iter().map(|n| n.id.clone()).collect(),
                });
            }
        };
        if entry.node_type() != NodeType::Trigger {
            return Err(ValidationError::EntryNotTrigger {
                node_id: entry.id.clone(),
            });
        }

        self.topological_order()?;

        let Some(&start) = self.node_index_map.get(&entry.id) else {
            return Err(ValidationError::NoEntryNode);
        };
        let mut reached = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            reached.insert(idx);
        }
        if let Some(unreached) = self.graph.node_indices().find(|idx| !reached.contains(idx)) {
            return Err(ValidationError::UnreachableNode {
                node_id: self.graph[unreached].id.clone(),
            });
        }

        let mut keys = HashSet::new();
        for node in self.nodes() {
            if let Some(key) = output_key(node)
                && !keys.insert(key.to_string())
            {
                return Err(ValidationError::DuplicateOutputKey {
                    key: key.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Result-set key of an output node.
#[must_use]
pub fn output_key(node: &Node) -> Option<&str> {
    match &node.config {
        NodeConfig::Output(config) => Some(config.key.as_deref().unwrap_or(node.id.as_str())),
        _ => None,
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent, condition, loop_over, output, trigger};

    fn linear() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger("start")).unwrap();
        graph.add_node(agent("a", "claude", "do it")).unwrap();
        graph.add_node(output("out")).unwrap();
        graph.add_edge(EdgeRef::with_default_ports("start", "a")).unwrap();
        graph.add_edge(EdgeRef::with_default_ports("a", "out")).unwrap();
        graph
    }

    #[test]
    fn valid_linear_graph() {
        let graph = linear();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.entry().map(|n| n.id.as_str()), Some("start"));
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![NodeId::from("start"), NodeId::from("a"), NodeId::from("out")]
        );
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger("start")).unwrap();
        let err = graph.add_node(trigger("start")).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateNode { .. }));
    }

    #[test]
    fn unknown_ports_rejected() {
        let mut graph = linear();
        graph.add_node(output("other")).unwrap();

        let err = graph
            .add_edge(EdgeRef::new("a", "nope", "other", "input"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SourcePortNotFound { .. }));

        let err = graph
            .add_edge(EdgeRef::new("a", "output", "other", "nope"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::TargetPortNotFound { .. }));
    }

    #[test]
    fn target_port_is_single_valued() {
        let mut graph = linear();
        let err = graph
            .add_edge(EdgeRef::with_default_ports("start", "out"))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::TargetPortAlreadyConnected { .. }
        ));
    }

    #[test]
    fn source_port_broadcasts() {
        let mut graph = linear();
        graph.add_node(output("copy")).unwrap();
        assert!(graph.add_edge(EdgeRef::with_default_ports("a", "copy")).is_ok());
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn multiple_entries_rejected() {
        let mut graph = linear();
        graph.add_node(trigger("second")).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ValidationError::MultipleEntryNodes { .. })
        ));
    }

    #[test]
    fn entry_must_be_trigger() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(agent("a", "claude", "x")).unwrap();
        graph.add_node(output("out")).unwrap();
        graph.add_edge(EdgeRef::with_default_ports("a", "out")).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ValidationError::EntryNotTrigger { .. })
        ));
    }

    #[test]
    fn cycle_rejected() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger("start")).unwrap();
        graph.add_node(condition("c1", "true")).unwrap();
        graph.add_node(crate::testing::merge("m")).unwrap();
        graph.add_edge(EdgeRef::new("start", "output", "m", "input1")).unwrap();
        graph.add_edge(EdgeRef::new("m", "output", "c1", "input")).unwrap();
        graph.add_edge(EdgeRef::new("c1", "true", "m", "input2")).unwrap();
        assert_eq!(graph.validate(), Err(ValidationError::CycleDetected));
    }

    #[test]
    fn loop_back_edge_is_not_a_cycle() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(trigger("start")).unwrap();
        graph.add_node(loop_over("l", serde_json::json!([1, 2]))).unwrap();
        graph.add_node(agent("a", "claude", "x")).unwrap();
        graph.add_node(output("out")).unwrap();
        graph.add_edge(EdgeRef::with_default_ports("start", "l")).unwrap();
        graph.add_edge(EdgeRef::new("l", "item", "a", "input")).unwrap();
        graph.add_edge(EdgeRef::new("a", "output", "l", LOOP_BACK_PORT)).unwrap();
        graph.add_edge(EdgeRef::new("l", "completed", "out", "input")).unwrap();

        assert!(graph.validate().is_ok());
        let loop_back = graph
            .successors(&NodeId::from("a"))
            .into_iter()
            .any(|(_, edge)| edge.loop_back);
        assert!(loop_back);
    }

    #[test]
    fn duplicate_output_keys_rejected() {
        let mut graph = linear();
        graph
            .add_node(crate::testing::output_with_key("out2", "out"))
            .unwrap();
        graph.add_edge(EdgeRef::with_default_ports("a", "out2")).unwrap();
        assert_eq!(
            graph.validate(),
            Err(ValidationError::DuplicateOutputKey {
                key: "out".to_string()
            })
        );
    }
}
