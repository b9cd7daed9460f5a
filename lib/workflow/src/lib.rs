//! Workflow graph engine for weft.
//!
//! This crate validates workflow graph documents and interprets them:
//!
//! - **Graph Model**: Directed graphs using petgraph with typed nodes and ports
//! - **Node Types**: A closed set of eighteen node kinds with typed configs
//! - **Expressions**: `{{ }}` templates and boolean conditions over the scope
//! - **Interpreter**: Region-based scheduling with loops, joins and error handlers
//! - **Executor Gateway**: Pluggable handlers for `agent` and `database` calls
//! - **Execution**: Event-sourced run state with a streaming event feed

pub mod config;
pub mod dispatch;
pub mod document;
pub mod edge;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod expression;
pub mod frontier;
pub mod gateway;
pub mod graph;
mod interpreter;
pub mod node;
pub mod plan;
pub mod port;
pub mod registry;
pub mod run_state;
pub mod scope;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use document::{parse, parse_value};
pub use edge::Edge;
pub use engine::{Engine, RunReport, RunStatus};
pub use envelope::Envelope;
pub use error::{EngineError, ErrorKind, NodeError, ValidationError};
pub use execution::{ExecutionEvent, ExecutionState, NodeInstance, NodeResult, NodeStatus};
pub use gateway::{EchoHandler, ExecutorError, ExecutorGateway, ExecutorHandler, ExecutorRequest, GatewayError};
pub use graph::WorkflowGraph;
pub use node::{Node, NodeConfig, NodeId, NodeType};
pub use port::{InputPort, OutputPort};
pub use run_state::{RunState, RunStateBuilder, RunStateError};
pub use scope::Scope;
