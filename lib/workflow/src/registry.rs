//! Node type registry.
//!
//! Maps a node type name to its execution contract: ports, required config
//! fields and the way the interpreter dispatches it.

use crate::edge::LOOP_BACK_PORT;
use crate::node::NodeType;
use crate::port::{DEFAULT_INPUT, DEFAULT_OUTPUT, InputPort, OutputPort};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// How the interpreter schedules a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
    /// Pure, synchronous evaluation.
    Inline,
    /// Awaits external work or a timer before the branch advances.
    Blocking,
    /// Produces several concurrent continuations.
    FanOut,
    /// Waits on several producers behind a join barrier.
    Join,
}

/// The execution contract of one node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContract {
    pub node_type: NodeType,
    pub input_ports: &'static [&'static str],
    pub output_ports: &'static [&'static str],
    pub required_config: &'static [&'static str],
    pub dispatch: DispatchMode,
    /// Documents may declare their own input port list.
    pub dynamic_inputs: bool,
    /// Documents may declare their own output port list.
    pub dynamic_outputs: bool,
}

impl NodeContract {
    /// Input ports a node gets when its document declares none.
    #[must_use]
    pub fn default_inputs(&self) -> Vec<InputPort> {
        self.input_ports
            .iter()
            .map(|&name| {
                if name == LOOP_BACK_PORT || self.dynamic_inputs {
                    InputPort::optional(name)
                } else {
                    InputPort::required(name)
                }
            })
            .collect()
    }

    /// Output ports a node gets when its document declares none.
    #[must_use]
    pub fn default_outputs(&self) -> Vec<OutputPort> {
        self.output_ports.iter().copied().map(OutputPort::new).collect()
    }
}

/// Errors from registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The type name is not part of the closed set.
    UnknownNodeType { node_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNodeType { node_type } => write!(f, "unknown node type: {node_type}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl FromStr for NodeType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|node_type| node_type.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownNodeType {
                node_type: s.to_string(),
            })
    }
}

const IN: &[&str] = &[DEFAULT_INPUT];
const OUT: &[&str] = &[DEFAULT_OUTPUT];
const NONE: &[&str] = &[];

const fn contract_of(
    node_type: NodeType,
    input_ports: &'static [&'static str],
    output_ports: &'static [&'static str],
    required_config: &'static [&'static str],
    dispatch: DispatchMode,
) -> NodeContract {
    NodeContract {
        node_type,
        input_ports,
        output_ports,
        required_config,
        dispatch,
        dynamic_inputs: false,
        dynamic_outputs: false,
    }
}

/// Returns the contract of a known node type.
#[must_use]
pub fn contract(node_type: NodeType) -> NodeContract {
    use DispatchMode::{Blocking, FanOut, Inline, Join};

    match node_type {
        NodeType::Trigger => contract_of(node_type, NONE, OUT, NONE, Inline),
        NodeType::Agent => contract_of(node_type, IN, OUT, &["agentKind", "task"], Blocking),
        NodeType::Condition => {
            contract_of(node_type, IN, &["true", "false"], &["expression"], Inline)
        }
        NodeType::Loop => contract_of(
            node_type,
            &[DEFAULT_INPUT, LOOP_BACK_PORT],
            &["item", "completed"],
            NONE,
            FanOut,
        ),
        NodeType::Parallel => NodeContract {
            dynamic_outputs: true,
            ..contract_of(node_type, IN, &["branch1", "branch2"], NONE, FanOut)
        },
        NodeType::Merge => NodeContract {
            dynamic_inputs: true,
            ..contract_of(node_type, &["input1", "input2"], OUT, NONE, Join)
        },
        NodeType::Transform => contract_of(node_type, IN, OUT, &["operation"], Inline),
        NodeType::Variable => contract_of(node_type, IN, OUT, &["operation", "name"], Inline),
        NodeType::Calculator => contract_of(node_type, IN, OUT, &["operation"], Inline),
        NodeType::Filter => contract_of(
            node_type,
            IN,
            &["filtered", "rejected"],
            &["expression"],
            Inline,
        ),
        NodeType::Database => {
            contract_of(node_type, IN, OUT, &["statement", "query"], Blocking)
        }
        NodeType::JsonParser => contract_of(
            node_type,
            IN,
            &[DEFAULT_OUTPUT, "error"],
            &["operation"],
            Inline,
        ),
        NodeType::Aggregator => NodeContract {
            dynamic_inputs: true,
            ..contract_of(node_type, IN, OUT, NONE, Join)
        },
        NodeType::Randomizer => contract_of(node_type, IN, OUT, &["randomType"], Inline),
        NodeType::Validator => contract_of(
            node_type,
            IN,
            &["valid", "invalid", "errors"],
            &["validationType"],
            Inline,
        ),
        NodeType::Delay => contract_of(node_type, IN, OUT, NONE, Blocking),
        NodeType::ErrorHandler => contract_of(
            node_type,
            IN,
            &["try", "error", "fallback"],
            NONE,
            Inline,
        ),
        NodeType::Output => contract_of(node_type, IN, NONE, NONE, Inline),
    }
}

/// Looks up the contract for a node type name.
///
/// # Errors
///
/// Returns `RegistryError::UnknownNodeType` for names outside the closed set.
pub fn lookup(node_type: &str) -> Result<NodeContract, RegistryError> {
    let node_type: NodeType = node_type.parse()?;
    Ok(contract(node_type))
}
