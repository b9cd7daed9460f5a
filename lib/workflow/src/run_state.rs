//! Run state reconstruction from events.
//!
//! The event stream is the source of truth for a run. The interpreter
//! applies each event to a live `RunState` as it emits it, and
//! `RunStateBuilder` rebuilds the same state by replaying a recorded stream.

use crate::execution::{ExecutionEvent, ExecutionState, NodeInstance, NodeResult, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use weft_core::RunId;

type ResultKey = (NodeInstance, u32);

/// Complete observable state of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub state: ExecutionState,
    pub input: JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Values recorded by `output` nodes, by key.
    pub outputs: BTreeMap<String, JsonValue>,
    /// Failure summary of a failed run.
    pub error: Option<String>,
    node_results: Vec<NodeResult>,
    index: HashMap<ResultKey, usize>,
    output_iterations: HashMap<String, Option<u32>>,
}

impl RunState {
    /// Creates a queued run.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: ExecutionState::Queued,
            input: JsonValue::Null,
            started_at: None,
            finished_at: None,
            outputs: BTreeMap::new(),
            error: None,
            node_results: Vec::new(),
            index: HashMap::new(),
            output_iterations: HashMap::new(),
        }
    }

    /// Node results in the order their instances first appeared.
    #[must_use]
    pub fn node_results(&self) -> &[NodeResult] {
        &self.node_results
    }

    /// Node results sorted by `(branch, iteration, node_id, attempt)`.
    ///
    /// Independent of task scheduling, so two runs of the same graph can be
    /// compared entry by entry.
    #[must_use]
    pub fn canonical(&self) -> Vec<NodeResult> {
        let mut results = self.node_results.clone();
        results.sort_by(|a, b| {
            (&a.branch, a.iteration, &a.node_id, a.attempt).cmp(&(
                &b.branch,
                b.iteration,
                &b.node_id,
                b.attempt,
            ))
        });
        results
    }

    /// All results of one node, across iterations, branches and attempts.
    pub fn results_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeResult> + 'a {
        self.node_results
            .iter()
            .filter(move |result| result.node_id.as_str() == node_id)
    }

    fn entry(&mut self, node: &NodeInstance, attempt: u32) -> &mut NodeResult {
        let key = (node.clone(), attempt);
        let position = match self.index.get(&key) {
            Some(&position) => position,
            None => {
                self.node_results
                    .push(NodeResult::new(node, attempt, NodeStatus::Pending));
                let position = self.node_results.len() - 1;
                self.index.insert(key, position);
                position
            }
        };
        &mut self.node_results[position]
    }

    fn record_output(&mut self, key: String, iteration: Option<u32>, value: JsonValue) {
        let newer = self
            .output_iterations
            .get(&key)
            .is_none_or(|previous| iteration >= *previous);
        if newer {
            self.output_iterations.insert(key.clone(), iteration);
            self.outputs.insert(key, value);
        }
    }

    fn finish(&mut self, state: ExecutionState, timestamp: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(timestamp);
    }

    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Rejects events for another run, a second `RunStarted`, and every
    /// event after the run reached a terminal state.
    pub fn apply(&mut self, event: &ExecutionEvent) -> Result<(), RunStateError> {
        if event.run_id() != self.run_id {
            return Err(RunStateError::RunMismatch {
                expected: self.run_id,
                found: event.run_id(),
            });
        }
        if self.state.is_terminal() {
            return Err(RunStateError::AlreadyTerminal {
                run_id: self.run_id,
            });
        }

        match event {
            ExecutionEvent::RunStarted {
                input, timestamp, ..
            } => {
                if self.state != ExecutionState::Queued {
                    return Err(RunStateError::DuplicateRunStarted);
                }
                self.state = ExecutionState::Running;
                self.input = input.clone();
                self.started_at = Some(*timestamp);
            }
            ExecutionEvent::NodeReady { node, .. } => {
                let result = self.entry(node, 1);
                if result.status == NodeStatus::Pending {
                    result.status = NodeStatus::Ready;
                }
            }
            ExecutionEvent::NodeStarted {
                node,
                attempt,
                timestamp,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Running;
                result.started_at = Some(*timestamp);
            }
            ExecutionEvent::NodeSucceeded {
                node,
                attempt,
                output,
                output_key,
                duration_ms,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Succeeded;
                result.output = Some(output.clone());
                result.duration_ms = Some(*duration_ms);
                if let Some(key) = output_key {
                    self.record_output(key.clone(), node.iteration, output.clone());
                }
            }
            ExecutionEvent::NodeFailed {
                node,
                attempt,
                error,
                duration_ms,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Failed;
                result.error = Some(error.clone());
                result.duration_ms = Some(*duration_ms);
            }
            ExecutionEvent::NodeRetrying {
                node,
                attempt,
                error,
                timestamp,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Retrying;
                result.error = Some(error.clone());
                result.duration_ms = elapsed_ms(result.started_at, *timestamp);
            }
            ExecutionEvent::NodeHandled {
                node,
                attempt,
                error,
                timestamp,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Handled;
                result.error = Some(error.clone());
                result.duration_ms = elapsed_ms(result.started_at, *timestamp);
            }
            ExecutionEvent::NodeSkipped { node, .. } => {
                self.entry(node, 0).status = NodeStatus::Skipped;
            }
            ExecutionEvent::NodeCancelled {
                node,
                attempt,
                timestamp,
                ..
            } => {
                let result = self.entry(node, *attempt);
                result.status = NodeStatus::Cancelled;
                result.duration_ms = elapsed_ms(result.started_at, *timestamp);
            }
            ExecutionEvent::RunCompleted { timestamp, .. } => {
                self.finish(ExecutionState::Completed, *timestamp);
            }
            ExecutionEvent::RunFailed {
                error, timestamp, ..
            } => {
                self.error = Some(error.clone());
                self.finish(ExecutionState::Failed, *timestamp);
            }
            ExecutionEvent::RunCancelled { timestamp, .. } => {
                self.finish(ExecutionState::Cancelled, *timestamp);
            }
        }
        Ok(())
    }
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let started_at = started_at?;
    u64::try_from((now - started_at).num_milliseconds()).ok()
}

/// Rebuilds run state by replaying events.
#[derive(Debug, Clone, Default)]
pub struct RunStateBuilder {
    expected: Option<RunId>,
}

impl RunStateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accepts a stream that belongs to `run_id`.
    #[must_use]
    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.expected = Some(run_id);
        self
    }

    /// Reconstructs run state from a sequence of events.
    ///
    /// Events must be provided in order (earliest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is empty, does not begin with
    /// `RunStarted`, mixes runs, or continues after a terminal event.
    pub fn build_from_events(
        &self,
        events: impl IntoIterator<Item = ExecutionEvent>,
    ) -> Result<RunState, RunStateError> {
        let mut events = events.into_iter();
        let first = events.next().ok_or(RunStateError::NoEvents)?;
        if !matches!(first, ExecutionEvent::RunStarted { .. }) {
            return Err(RunStateError::MissingRunStarted);
        }
        if let Some(expected) = self.expected
            && expected != first.run_id()
        {
            return Err(RunStateError::RunMismatch {
                expected,
                found: first.run_id(),
            });
        }

        let mut state = RunState::new(first.run_id());
        state.apply(&first)?;
        for event in events {
            state.apply(&event)?;
        }
        Ok(state)
    }
}

/// Errors that can occur while applying or replaying events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStateError {
    /// No events provided.
    NoEvents,
    /// First event was not RunStarted.
    MissingRunStarted,
    /// A second RunStarted event.
    DuplicateRunStarted,
    /// Event belongs to another run.
    RunMismatch { expected: RunId, found: RunId },
    /// Event arrived after the run finished.
    AlreadyTerminal { run_id: RunId },
}

impl std::fmt::Display for RunStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEvents => write!(f, "no events provided"),
            Self::MissingRunStarted => write!(f, "first event must be RunStarted"),
            Self::DuplicateRunStarted => write!(f, "duplicate RunStarted event"),
            Self::RunMismatch { expected, found } => {
                write!(f, "event for run {found} applied to run {expected}")
            }
            Self::AlreadyTerminal { run_id } => {
                write!(f, "run {run_id} is terminal and cannot change")
            }
        }
    }
}

impl std::error::Error for RunStateError {}
