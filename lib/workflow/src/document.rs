//! Graph documents exchanged with the editor.
//!
//! `parse` is the only way a document becomes a `WorkflowGraph`: it checks
//! node types against the registry, validates configs and ports, adds edges,
//! validates the graph structure and the loop bodies. An invalid document is
//! rejected as a whole.

use crate::edge::EdgeRef;
use crate::error::ValidationError;
use crate::graph::WorkflowGraph;
use crate::node::{Node, NodeConfig, NodeId};
use crate::plan::ExecutionPlan;
use crate::port::{InputPort, OutputPort};
use crate::registry::{self, NodeContract, RegistryError};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A serialized workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub edges: Vec<EdgeRef>,
}

/// A serialized node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDocument {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "empty_config")]
    pub config: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ports: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ports: Option<Vec<String>>,
}

fn empty_config() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// Parses and validates a graph document from JSON text.
///
/// # Errors
///
/// Returns a `ValidationError` report describing the first problem found.
pub fn parse(document: &str) -> Result<WorkflowGraph, Report<ValidationError>> {
    let document: GraphDocument =
        serde_json::from_str(document).map_err(|e| ValidationError::InvalidDocument {
            message: e.to_string(),
        })?;
    Ok(WorkflowGraph::try_from(document)?)
}

/// Parses and validates a graph document from a JSON value.
///
/// # Errors
///
/// Returns a `ValidationError` report describing the first problem found.
pub fn parse_value(document: JsonValue) -> Result<WorkflowGraph, Report<ValidationError>> {
    let document: GraphDocument =
        serde_json::from_value(document).map_err(|e| ValidationError::InvalidDocument {
            message: e.to_string(),
        })?;
    Ok(WorkflowGraph::try_from(document)?)
}

impl NodeDocument {
    /// Resolves this document node into a typed node.
    fn into_node(self) -> Result<Node, ValidationError> {
        let contract = registry::lookup(&self.node_type).map_err(|e| match e {
            RegistryError::UnknownNodeType { node_type } => ValidationError::UnknownNodeType {
                node_id: self.id.clone(),
                node_type,
            },
        })?;

        let config = match self.config {
            JsonValue::Null => empty_config(),
            JsonValue::Object(map) => JsonValue::Object(map),
            _ => {
                return Err(ValidationError::InvalidConfig {
                    node_id: self.id,
                    message: "config must be an object".to_string(),
                });
            }
        };
        if let Some(field) = contract
            .required_config
            .iter()
            .find(|field| config.get(**field).is_none_or(JsonValue::is_null))
        {
            return Err(ValidationError::MissingConfigField {
                node_id: self.id,
                field: (*field).to_string(),
            });
        }
        let config = NodeConfig::from_raw(contract.node_type, config).map_err(|message| {
            ValidationError::InvalidConfig {
                node_id: self.id.clone(),
                message,
            }
        })?;

        let inputs = resolve_inputs(&self.id, &contract, self.input_ports)?;
        let outputs = resolve_outputs(&self.id, &contract, self.output_ports)?;

        Ok(Node {
            name: self.name.unwrap_or_else(|| self.id.to_string()),
            id: self.id,
            config,
            inputs,
            outputs,
        })
    }
}

fn check_port_list(node_id: &NodeId, ports: &[String]) -> Result<(), ValidationError> {
    if ports.is_empty() {
        return Err(ValidationError::InvalidPorts {
            node_id: node_id.clone(),
            message: "port list must not be empty".to_string(),
        });
    }
    for (i, port) in ports.iter().enumerate() {
        if ports[..i].contains(port) {
            return Err(ValidationError::InvalidPorts {
                node_id: node_id.clone(),
                message: format!("port '{port}' declared twice"),
            });
        }
    }
    Ok(())
}

fn resolve_inputs(
    node_id: &NodeId,
    contract: &NodeContract,
    declared: Option<Vec<String>>,
) -> Result<Vec<InputPort>, ValidationError> {
    let Some(declared) = declared else {
        return Ok(contract.default_inputs());
    };
    if contract.dynamic_inputs {
        check_port_list(node_id, &declared)?;
        return Ok(declared.into_iter().map(InputPort::optional).collect());
    }
    if declared.iter().map(String::as_str).eq(contract.input_ports.iter().copied()) {
        return Ok(contract.default_inputs());
    }
    Err(ValidationError::InvalidPorts {
        node_id: node_id.clone(),
        message: format!(
            "{} nodes have input ports [{}]",
            contract.node_type,
            contract.input_ports.join(", ")
        ),
    })
}

fn resolve_outputs(
    node_id: &NodeId,
    contract: &NodeContract,
    declared: Option<Vec<String>>,
) -> Result<Vec<OutputPort>, ValidationError> {
    let Some(declared) = declared else {
        return Ok(contract.default_outputs());
    };
    if contract.dynamic_outputs {
        check_port_list(node_id, &declared)?;
        return Ok(declared.into_iter().map(OutputPort::new).collect());
    }
    if declared.iter().map(String::as_str).eq(contract.output_ports.iter().copied()) {
        return Ok(contract.default_outputs());
    }
    Err(ValidationError::InvalidPorts {
        node_id: node_id.clone(),
        message: format!(
            "{} nodes have output ports [{}]",
            contract.node_type,
            contract.output_ports.join(", ")
        ),
    })
}

impl TryFrom<GraphDocument> for WorkflowGraph {
    type Error = ValidationError;

    fn try_from(document: GraphDocument) -> Result<Self, Self::Error> {
        let mut graph = WorkflowGraph::new();
        graph.name = document.name;
        graph.description = document.description;

        for node in document.nodes {
            graph.add_node(node.into_node()?)?;
        }
        for edge in document.edges {
            graph.add_edge(edge)?;
        }

        graph.validate()?;
        ExecutionPlan::build(&graph)?;
        Ok(graph)
    }
}

impl From<WorkflowGraph> for GraphDocument {
    fn from(graph: WorkflowGraph) -> Self {
        let nodes = graph
            .nodes()
            .map(|node| {
                let contract = registry::contract(node.node_type());
                let config = serde_json::to_value(&node.config)
                    .ok()
                    .and_then(|mut tagged| tagged.get_mut("config").map(JsonValue::take))
                    .unwrap_or_else(empty_config);
                NodeDocument {
                    id: node.id.clone(),
                    node_type: node.node_type().as_str().to_string(),
                    name: (node.name != node.id.as_str()).then(|| node.name.clone()),
                    config,
                    input_ports: contract
                        .dynamic_inputs
                        .then(|| node.inputs.iter().map(|p| p.name.clone()).collect()),
                    output_ports: contract
                        .dynamic_outputs
                        .then(|| node.outputs.iter().map(|p| p.name.clone()).collect()),
                }
            })
            .collect();
        let edges = graph.edges().collect();

        Self {
            name: graph.name,
            description: graph.description,
            nodes,
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branching() -> JsonValue {
        json!({
            "name": "branching",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "a", "type": "agent", "config": { "agentKind": "claude", "task": "score {{input}}" } },
                { "id": "c", "type": "condition", "config": { "expression": "{{input.score}} > 5" } },
                { "id": "o1", "type": "output" },
                { "id": "o2", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "a" },
                { "source": "a", "target": "c" },
                { "source": "c", "sourcePort": "true", "target": "o1" },
                { "source": "c", "sourcePort": "false", "target": "o2" }
            ]
        })
    }

    fn validation_error(document: JsonValue) -> ValidationError {
        let document: GraphDocument = serde_json::from_value(document).expect("document shape");
        WorkflowGraph::try_from(document).unwrap_err()
    }

    #[test]
    fn parses_valid_document() {
        let graph = parse_value(branching()).expect("valid graph");
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 4);
        assert_eq!(graph.name.as_deref(), Some("branching"));
    }

    #[test]
    fn parses_from_text() {
        let text = branching().to_string();
        assert!(parse(&text).is_ok());
        assert!(parse("{ not json").is_err());
    }

    #[test]
    fn unknown_node_type_rejected() {
        let mut document = branching();
        document["nodes"][1]["type"] = json!("teleporter");
        assert!(matches!(
            validation_error(document),
            ValidationError::UnknownNodeType { .. }
        ));
    }

    #[test]
    fn missing_required_config_rejected() {
        let mut document = branching();
        document["nodes"][2]["config"] = json!({});
        assert_eq!(
            validation_error(document),
            ValidationError::MissingConfigField {
                node_id: NodeId::from("c"),
                field: "expression".to_string()
            }
        );
    }

    #[test]
    fn fixed_ports_cannot_be_redeclared() {
        let mut document = branching();
        document["nodes"][2]["outputPorts"] = json!(["yes", "no"]);
        assert!(matches!(
            validation_error(document),
            ValidationError::InvalidPorts { .. }
        ));
    }

    #[test]
    fn parallel_declares_its_branches() {
        let document = json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "fan", "type": "parallel", "outputPorts": ["left", "middle", "right"] },
                { "id": "join", "type": "merge", "inputPorts": ["l", "m", "r"] },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "fan" },
                { "source": "fan", "sourcePort": "left", "target": "join", "targetPort": "l" },
                { "source": "fan", "sourcePort": "middle", "target": "join", "targetPort": "m" },
                { "source": "fan", "sourcePort": "right", "target": "join", "targetPort": "r" },
                { "source": "join", "target": "out" }
            ]
        });
        let graph = parse_value(document).expect("valid graph");
        let fan = graph.get_node(&NodeId::from("fan")).expect("fan node");
        assert_eq!(fan.outputs.len(), 3);
    }

    #[test]
    fn stray_node_is_an_extra_entry() {
        let mut document = branching();
        document["nodes"]
            .as_array_mut()
            .expect("nodes")
            .push(json!({ "id": "island", "type": "output" }));
        assert!(matches!(
            validation_error(document),
            ValidationError::MultipleEntryNodes { .. }
        ));
    }

    #[test]
    fn graph_round_trips_through_document() {
        let graph = parse_value(branching()).expect("valid graph");
        let json = serde_json::to_value(&graph).expect("serialize");
        let reparsed: WorkflowGraph = serde_json::from_value(json).expect("deserialize");
        assert_eq!(reparsed.node_count(), graph.node_count());
        assert_eq!(reparsed.edge_count(), graph.edge_count());
    }
}
