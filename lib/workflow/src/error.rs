//! Error types for the workflow crate.
//!
//! - `ValidationError`: graph documents rejected before any execution
//! - `ErrorKind` / `NodeError`: failures of a single node instance during a run
//! - `EngineError`: misuse of the run control surface
//!
//! Callers at crate boundaries wrap these in `rootcause::Report`.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use weft_core::RunId;

/// Reasons a graph document is rejected by `parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The document is not a well-formed graph document.
    InvalidDocument { message: String },
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// A node declares a type the registry does not know.
    UnknownNodeType { node_id: NodeId, node_type: String },
    /// A required config field is absent.
    MissingConfigField { node_id: NodeId, field: String },
    /// The config does not match the type's schema.
    InvalidConfig { node_id: NodeId, message: String },
    /// Declared ports differ from what the node type allows.
    InvalidPorts { node_id: NodeId, message: String },
    /// An edge references a node that does not exist.
    NodeNotFound { node_id: NodeId },
    /// Source port not found on node.
    SourcePortNotFound { node_id: NodeId, port_name: String },
    /// Target port not found on node.
    TargetPortNotFound { node_id: NodeId, port_name: String },
    /// A target port already receives from another edge.
    TargetPortAlreadyConnected { node_id: NodeId, port_name: String },
    /// A required input port has no incoming edge.
    RequiredInputMissing { node_id: NodeId, port_name: String },
    /// No node without incoming edges.
    NoEntryNode,
    /// More than one node without incoming edges.
    MultipleEntryNodes { node_ids: Vec<NodeId> },
    /// The only entry node is not a trigger.
    EntryNotTrigger { node_id: NodeId },
    /// A structural cycle outside loop-back edges.
    CycleDetected,
    /// A node cannot be reached from the entry.
    UnreachableNode { node_id: NodeId },
    /// A loop body overlaps its own continuation.
    LoopBodyConflict { loop_id: NodeId, message: String },
    /// Two output nodes record under the same key.
    DuplicateOutputKey { key: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDocument { message } => write!(f, "invalid graph document: {message}"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "unknown node type '{node_type}' on node {node_id}")
            }
            Self::MissingConfigField { node_id, field } => {
                write!(f, "node {node_id} is missing required config field '{field}'")
            }
            Self::InvalidConfig { node_id, message } => {
                write!(f, "invalid config on node {node_id}: {message}")
            }
            Self::InvalidPorts { node_id, message } => {
                write!(f, "invalid ports on node {node_id}: {message}")
            }
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::SourcePortNotFound { node_id, port_name } => {
                write!(f, "source port '{port_name}' not found on node {node_id}")
            }
            Self::TargetPortNotFound { node_id, port_name } => {
                write!(f, "target port '{port_name}' not found on node {node_id}")
            }
            Self::TargetPortAlreadyConnected { node_id, port_name } => {
                write!(
                    f,
                    "target port '{port_name}' on node {node_id} already has an incoming edge"
                )
            }
            Self::RequiredInputMissing { node_id, port_name } => {
                write!(
                    f,
                    "required input port '{port_name}' on node {node_id} has no incoming edge"
                )
            }
            Self::NoEntryNode => write!(f, "graph has no entry node"),
            Self::MultipleEntryNodes { node_ids } => {
                let ids: Vec<&str> = node_ids.iter().map(NodeId::as_str).collect();
                write!(f, "graph has multiple entry nodes: {}", ids.join(", "))
            }
            Self::EntryNotTrigger { node_id } => {
                write!(f, "entry node {node_id} is not a trigger")
            }
            Self::CycleDetected => write!(f, "graph contains cycles outside loop-back edges"),
            Self::UnreachableNode { node_id } => {
                write!(f, "node {node_id} is unreachable from the entry")
            }
            Self::LoopBodyConflict { loop_id, message } => {
                write!(f, "loop {loop_id} has a malformed body: {message}")
            }
            Self::DuplicateOutputKey { key } => write!(f, "duplicate output key: {key}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Machine-readable kind of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    UnresolvedReference,
    EvalError,
    ExecutorError,
    LoopBoundExceeded,
    UnknownNodeType,
    JoinTimeout,
    Cancelled,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::UnresolvedReference => "UnresolvedReference",
            Self::EvalError => "EvalError",
            Self::ExecutorError => "ExecutorError",
            Self::LoopBoundExceeded => "LoopBoundExceeded",
            Self::UnknownNodeType => "UnknownNodeType",
            Self::JoinTimeout => "JoinTimeout",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure of one node instance.
///
/// Carries the originating node, the innermost loop iteration and the
/// branch path so surfaces can show where the failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    pub node_id: NodeId,
    pub iteration: Option<u32>,
    pub branch: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    /// Builds the JSON payload emitted on an error handler's ports.
    #[must_use]
    pub fn to_payload(&self, attempts: u32) -> serde_json::Value {
        serde_json::json!({
            "nodeId": self.node_id.as_str(),
            "iteration": self.iteration,
            "branch": self.branch,
            "kind": self.kind.as_str(),
            "message": self.message,
            "attempts": attempts,
        })
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iteration {
            Some(iteration) => write!(
                f,
                "{} in node {} (iteration {iteration}, branch {}): {}",
                self.kind, self.node_id, self.branch, self.message
            ),
            None => write!(
                f,
                "{} in node {} (branch {}): {}",
                self.kind, self.node_id, self.branch, self.message
            ),
        }
    }
}

impl std::error::Error for NodeError {}

/// Errors from the run control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No run with this id was started by this engine.
    RunNotFound { run_id: RunId },
    /// The run already reached a terminal state.
    RunAlreadyTerminal { run_id: RunId },
    /// The run task ended without publishing a report.
    RunAborted { run_id: RunId },
    /// The graph was not validated before being handed to the engine.
    InvalidGraph { error: ValidationError },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::RunAlreadyTerminal { run_id } => {
                write!(f, "run already in terminal state: {run_id}")
            }
            Self::RunAborted { run_id } => write!(f, "run aborted before reporting: {run_id}"),
            Self::InvalidGraph { error } => write!(f, "invalid graph: {error}"),
        }
    }
}

impl std::error::Error for EngineError {}
