//! Run control surface.
//!
//! The [`Engine`] starts runs on the tokio runtime and keeps a handle per
//! run so hosts can cancel it, poll its status, stream its events and wait
//! for its report.

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::execution::{ExecutionEvent, ExecutionState, NodeResult};
use crate::gateway::ExecutorGateway;
use crate::graph::WorkflowGraph;
use crate::interpreter::{self, RunContext};
use crate::plan::ExecutionPlan;
use crate::run_state::RunState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use weft_core::RunId;

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub state: ExecutionState,
    /// Values recorded by `output` nodes, by key.
    pub outputs: BTreeMap<String, JsonValue>,
    /// Node results in canonical order.
    pub node_results: Vec<NodeResult>,
    pub error: Option<String>,
}

impl RunReport {
    fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id,
            state: state.state,
            outputs: state.outputs.clone(),
            node_results: state.canonical(),
            error: state.error.clone(),
        }
    }

    /// Results of one node across iterations, branches and attempts.
    #[must_use]
    pub fn results_for(&self, node_id: &str) -> Vec<&NodeResult> {
        self.node_results
            .iter()
            .filter(|result| result.node_id.as_str() == node_id)
            .collect()
    }
}

/// Snapshot returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub state: ExecutionState,
    pub node_results: Vec<NodeResult>,
}

struct RunHandle {
    cancel: CancellationToken,
    events: broadcast::Sender<Envelope<ExecutionEvent>>,
    state: Arc<Mutex<RunState>>,
    report: watch::Receiver<Option<RunReport>>,
}

/// Executes workflow graphs.
pub struct Engine {
    config: EngineConfig,
    gateway: Arc<ExecutorGateway>,
    runs: DashMap<RunId, RunHandle>,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, gateway: ExecutorGateway) -> Self {
        Self {
            config,
            gateway: Arc::new(gateway),
            runs: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn prepare(&self, graph: &WorkflowGraph) -> weft_core::Result<Arc<RunContext>, EngineError> {
        let plan = ExecutionPlan::build(graph).map_err(|error| EngineError::InvalidGraph { error })?;
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));
        Ok(Arc::new(RunContext::new(
            RunId::new(),
            plan,
            Arc::clone(&self.gateway),
            self.config.clone(),
            events,
            CancellationToken::new(),
        )))
    }

    fn spawn(&self, ctx: Arc<RunContext>, input: JsonValue) -> RunId {
        let run_id = ctx.run_id;
        let (report_tx, report_rx) = watch::channel(None);
        self.runs.insert(
            run_id,
            RunHandle {
                cancel: ctx.cancel.clone(),
                events: ctx.events.clone(),
                state: Arc::clone(&ctx.state),
                report: report_rx,
            },
        );
        tokio::spawn(async move {
            interpreter::execute(Arc::clone(&ctx), input).await;
            let report = {
                let state = ctx.state.lock().unwrap_or_else(PoisonError::into_inner);
                RunReport::from_state(&state)
            };
            // Nobody waiting is fine.
            let _ = report_tx.send(Some(report));
        });
        debug!(%run_id, "run spawned");
        run_id
    }

    /// Starts a run in the background.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` if the graph cannot be planned.
    pub fn start(&self, graph: &WorkflowGraph, input: JsonValue) -> weft_core::Result<RunId, EngineError> {
        let ctx = self.prepare(graph)?;
        Ok(self.spawn(ctx, input))
    }

    /// Starts a run and subscribes to its events before the first one is
    /// emitted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` if the graph cannot be planned.
    pub fn start_with_events(
        &self,
        graph: &WorkflowGraph,
        input: JsonValue,
    ) -> weft_core::Result<(RunId, broadcast::Receiver<Envelope<ExecutionEvent>>), EngineError> {
        let ctx = self.prepare(graph)?;
        let receiver = ctx.events.subscribe();
        Ok((self.spawn(ctx, input), receiver))
    }

    /// Runs a graph to completion.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` if the graph cannot be planned, or
    /// `RunAborted` if the run task died.
    pub async fn run(&self, graph: &WorkflowGraph, input: JsonValue) -> weft_core::Result<RunReport, EngineError> {
        let run_id = self.start(graph, input)?;
        self.wait(run_id).await
    }

    /// Signals a run to stop.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs and `RunAlreadyTerminal` for
    /// finished ones.
    pub fn cancel(&self, run_id: RunId) -> weft_core::Result<(), EngineError> {
        let handle = self
            .runs
            .get(&run_id)
            .ok_or(EngineError::RunNotFound { run_id })?;
        let terminal = handle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .is_terminal();
        if terminal {
            return Err(EngineError::RunAlreadyTerminal { run_id }.into());
        }
        info!(%run_id, "cancelling run");
        handle.cancel.cancel();
        Ok(())
    }

    /// Current state and node results of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs.
    pub fn status(&self, run_id: RunId) -> weft_core::Result<RunStatus, EngineError> {
        let handle = self
            .runs
            .get(&run_id)
            .ok_or(EngineError::RunNotFound { run_id })?;
        let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(RunStatus {
            state: state.state,
            node_results: state.canonical(),
        })
    }

    /// Subscribes to a run's events from now on.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs.
    pub fn subscribe(
        &self,
        run_id: RunId,
    ) -> weft_core::Result<broadcast::Receiver<Envelope<ExecutionEvent>>, EngineError> {
        let handle = self
            .runs
            .get(&run_id)
            .ok_or(EngineError::RunNotFound { run_id })?;
        Ok(handle.events.subscribe())
    }

    /// Waits for a run to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs and `RunAborted` if the run
    /// task ended without a report.
    pub async fn wait(&self, run_id: RunId) -> weft_core::Result<RunReport, EngineError> {
        let mut report = self
            .runs
            .get(&run_id)
            .map(|handle| handle.report.clone())
            .ok_or(EngineError::RunNotFound { run_id })?;
        let ready = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::RunAborted { run_id })?;
        (*ready)
            .clone()
            .ok_or_else(|| EngineError::RunAborted { run_id }.into())
    }
}
