//! Run and node execution states, node results and execution events.
//!
//! Events are the source of truth for a run: the interpreter emits one per
//! node-state transition and `RunState` is rebuilt by applying them in
//! order.

use crate::error::NodeError;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use weft_core::RunId;

/// The overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created, not yet started.
    Queued,
    /// Nodes are executing.
    Running,
    /// At least one output succeeded, or nothing failed unhandled.
    Completed,
    /// No output succeeded and a failure reached the outputs.
    Failed,
    /// Stopped by the cancellation signal.
    Cancelled,
}

impl ExecutionState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The state of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Failed attempt that an error handler will retry.
    Retrying,
    /// Failure caught by an error handler after its retries ran out.
    Handled,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Handled | Self::Skipped | Self::Cancelled
        )
    }
}

/// Identifies one execution instance of a node.
///
/// The same node runs once per loop iteration and per branch it is reached
/// on, so the node id alone is not unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInstance {
    pub node_id: NodeId,
    /// Innermost loop iteration, if inside a loop body.
    pub iteration: Option<u32>,
    /// Frame path such as `main` or `loop1#2/fan:branch1`.
    pub branch: String,
}

/// One entry of the node result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: NodeId,
    pub iteration: Option<u32>,
    pub branch: String,
    /// 1-based attempt number; 0 for instances that never ran.
    pub attempt: u32,
    pub status: NodeStatus,
    pub output: Option<JsonValue>,
    pub error: Option<NodeError>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl NodeResult {
    pub(crate) fn new(instance: &NodeInstance, attempt: u32, status: NodeStatus) -> Self {
        Self {
            node_id: instance.node_id.clone(),
            iteration: instance.iteration,
            branch: instance.branch.clone(),
            attempt,
            status,
            output: None,
            error: None,
            started_at: None,
            duration_ms: None,
        }
    }
}

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        input: JsonValue,
        timestamp: DateTime<Utc>,
    },
    NodeReady {
        run_id: RunId,
        node: NodeInstance,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeSucceeded {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        output: JsonValue,
        /// Result-set key when the node is an `output` node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        error: NodeError,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A failed attempt that will be retried after `delay_ms`.
    NodeRetrying {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        error: NodeError,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The final attempt failed and `handler` took over.
    NodeHandled {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        handler: NodeId,
        error: NodeError,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        run_id: RunId,
        node: NodeInstance,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    NodeCancelled {
        run_id: RunId,
        node: NodeInstance,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Returns the run ID associated with this event.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeReady { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeSucceeded { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeHandled { run_id, .. }
            | Self::NodeSkipped { run_id, .. }
            | Self::NodeCancelled { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::NodeReady { timestamp, .. }
            | Self::NodeStarted { timestamp, .. }
            | Self::NodeSucceeded { timestamp, .. }
            | Self::NodeFailed { timestamp, .. }
            | Self::NodeRetrying { timestamp, .. }
            | Self::NodeHandled { timestamp, .. }
            | Self::NodeSkipped { timestamp, .. }
            | Self::NodeCancelled { timestamp, .. }
            | Self::RunCompleted { timestamp, .. }
            | Self::RunFailed { timestamp, .. }
            | Self::RunCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the node instance of node-level events.
    #[must_use]
    pub fn node(&self) -> Option<&NodeInstance> {
        match self {
            Self::NodeReady { node, .. }
            | Self::NodeStarted { node, .. }
            | Self::NodeSucceeded { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeRetrying { node, .. }
            | Self::NodeHandled { node, .. }
            | Self::NodeSkipped { node, .. }
            | Self::NodeCancelled { node, .. } => Some(node),
            _ => None,
        }
    }
}
