//! Graph interpreter.
//!
//! A run executes its root region: every node outside loop bodies. Each
//! region owns a [`Frontier`] and a `JoinSet` of node tasks; a node is
//! spawned once every edge it waits on is resolved. Loop nodes run their
//! body as a fresh region per iteration, sequentially or concurrently.
//!
//! Failures flow along edges. A failure caught by an `errorHandler` is
//! retried, then routed to the handler's `error` and `fallback` ports once
//! every node it protects has finished. Uncaught failures block their
//! downstream nodes and mark the run as failed when they reach an output.

use crate::config::EngineConfig;
use crate::dispatch::{self, Emission, Failure};
use crate::envelope::Envelope;
use crate::error::{ErrorKind, NodeError};
use crate::execution::{ExecutionEvent, ExecutionState, NodeInstance, NodeStatus};
use crate::expression::{self, Expression};
use crate::frontier::{EdgeState, Frontier, PortValues, Readiness, Token};
use crate::gateway::{ExecutorGateway, ExecutorRequest};
use crate::graph;
use crate::node::{
    AgentConfig, DatabaseConfig, DelayConfig, DelayMode, ErrorHandlerConfig, LoopConfig,
    LoopMode, Node, NodeConfig, NodeId,
};
use crate::plan::{EdgeIndex, ExecutionPlan};
use crate::run_state::RunState;
use crate::scope::{EvalContext, FrameKind, Scope};
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, instrument, warn};
use weft_core::RunId;

/// Everything a run's tasks share.
pub(crate) struct RunContext {
    pub(crate) run_id: RunId,
    pub(crate) plan: ExecutionPlan,
    pub(crate) gateway: Arc<ExecutorGateway>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Arc<Mutex<RunState>>,
    pub(crate) events: broadcast::Sender<Envelope<ExecutionEvent>>,
    pub(crate) cancel: CancellationToken,
    sequence: AtomicU64,
    first_failure: Mutex<Option<NodeError>>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: RunId,
        plan: ExecutionPlan,
        gateway: Arc<ExecutorGateway>,
        config: EngineConfig,
        events: broadcast::Sender<Envelope<ExecutionEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            plan,
            gateway,
            config,
            state: Arc::new(Mutex::new(RunState::new(run_id))),
            events,
            cancel,
            sequence: AtomicU64::new(0),
            first_failure: Mutex::new(None),
        }
    }

    /// Applies an event to the run state and broadcasts it.
    ///
    /// Sequence numbers are assigned under the state lock, so subscribers
    /// see events in the order they were applied.
    fn emit(&self, event: ExecutionEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = state.apply(&event) {
            warn!(run_id = %self.run_id, error = %err, "event rejected by run state");
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.events.send(Envelope::new(sequence, event));
    }

    fn note_failure(&self, error: &NodeError) {
        let mut first = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(error.clone());
        }
    }

    /// The handler protecting `node_id`, if it catches `kind`.
    fn catching_handler(&self, node_id: &NodeId, kind: ErrorKind) -> Option<(&NodeId, &ErrorHandlerConfig)> {
        let handler = self.plan.protector(node_id)?;
        match &self.plan.node(handler)?.config {
            NodeConfig::ErrorHandler(config) if config.catches(kind) => Some((handler, config)),
            _ => None,
        }
    }

    /// The attempt an instance most recently started, or 1.
    fn latest_attempt(&self, instance: &NodeInstance) -> u32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .node_results()
            .iter()
            .filter(|result| {
                result.node_id == instance.node_id
                    && result.iteration == instance.iteration
                    && result.branch == instance.branch
            })
            .map(|result| result.attempt)
            .max()
            .unwrap_or(1)
    }

    fn node_error(&self, instance: &NodeInstance, failure: Failure) -> NodeError {
        NodeError {
            node_id: instance.node_id.clone(),
            iteration: instance.iteration,
            branch: instance.branch.clone(),
            kind: failure.kind,
            message: failure.message,
        }
    }

    /// Decides the terminal state once the root region is done.
    fn conclude(&self, cancelled: bool) -> ExecutionState {
        let outputs: BTreeSet<NodeId> = self.plan.output_nodes().into_values().collect();
        let (any_succeeded, output_failure) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let results = state
                .node_results()
                .iter()
                .filter(|result| outputs.contains(&result.node_id));
            let mut succeeded = false;
            let mut failure = None;
            for result in results {
                match result.status {
                    NodeStatus::Succeeded => succeeded = true,
                    NodeStatus::Failed if failure.is_none() => failure = result.error.clone(),
                    _ => {}
                }
            }
            (succeeded, failure)
        };
        let first_failure = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let run_id = self.run_id;
        let timestamp = Utc::now();
        let failure = if cancelled || any_succeeded {
            None
        } else if output_failure.is_some() {
            output_failure
        } else if outputs.is_empty() {
            first_failure
        } else {
            None
        };

        if cancelled {
            info!(%run_id, "run cancelled");
            self.emit(ExecutionEvent::RunCancelled { run_id, timestamp });
            ExecutionState::Cancelled
        } else if let Some(error) = failure {
            warn!(%run_id, error = %error, "run failed");
            self.emit(ExecutionEvent::RunFailed {
                run_id,
                error: error.to_string(),
                timestamp,
            });
            ExecutionState::Failed
        } else {
            info!(%run_id, "run completed");
            self.emit(ExecutionEvent::RunCompleted { run_id, timestamp });
            ExecutionState::Completed
        }
    }
}

/// Executes a run to its terminal state.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub(crate) async fn execute(ctx: Arc<RunContext>, input: JsonValue) -> ExecutionState {
    ctx.emit(ExecutionEvent::RunStarted {
        run_id: ctx.run_id,
        input: input.clone(),
        timestamp: Utc::now(),
    });
    info!(entry = %ctx.plan.entry(), "run started");

    let base = Token::new(input.clone(), Scope::root(&input));
    let outcome = run_region(Arc::clone(&ctx), None, Vec::new(), base).await;
    if !outcome.handled.is_empty() {
        warn!(count = outcome.handled.len(), "handled failures escaped every region");
    }
    ctx.conclude(outcome.cancelled || ctx.cancel.is_cancelled())
}

fn instance_of(node_id: &NodeId, scope: &Scope) -> NodeInstance {
    NodeInstance {
        node_id: node_id.clone(),
        iteration: scope.iteration(),
        branch: scope.branch_id(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A failure an error handler took over.
#[derive(Debug, Clone)]
struct HandledFailure {
    handler: NodeId,
    error: NodeError,
    attempts: u32,
}

/// What a node task hands back to its region.
#[derive(Debug)]
struct Settled {
    node: NodeId,
    edges: Vec<(EdgeIndex, EdgeState)>,
    handled: Vec<HandledFailure>,
    /// Scope after the node succeeded.
    scope: Option<Scope>,
    /// Set for error handlers, whose `error` and `fallback` ports wait for
    /// the protected nodes.
    deferred: Option<Scope>,
}

impl Settled {
    fn new(node: &NodeId) -> Self {
        Self {
            node: node.clone(),
            edges: Vec::new(),
            handled: Vec::new(),
            scope: None,
            deferred: None,
        }
    }

    fn with_exits(mut self, plan: &ExecutionPlan, state: &EdgeState) -> Self {
        self.edges = plan
            .exit_edges_of(&self.node)
            .into_iter()
            .map(|edge| (edge, state.clone()))
            .collect();
        self
    }
}

/// What a region leaves behind.
struct RegionOutcome {
    frontier: Frontier,
    /// Handled failures whose handler lives outside the region.
    handled: Vec<HandledFailure>,
    /// Scope of the topologically last node that succeeded.
    last_scope: Option<Scope>,
    cancelled: bool,
}

enum NodeInput {
    Token(Token),
    Joined { ports: PortValues, scope: Scope },
}

impl NodeInput {
    fn scope(&self) -> &Scope {
        match self {
            Self::Token(token) => &token.scope,
            Self::Joined { scope, .. } => scope,
        }
    }
}

fn run_region(
    ctx: Arc<RunContext>,
    region: Option<NodeId>,
    seeds: Vec<(EdgeIndex, EdgeState)>,
    base: Token,
) -> BoxFuture<'static, RegionOutcome> {
    let span = debug_span!(
        "region",
        region = region.as_ref().map_or("root", NodeId::as_str),
        iteration = ?base.scope.iteration(),
    );
    async move {
        let mut frontier = Frontier::new(&ctx.plan, region.as_ref());
        for (edge, state) in seeds {
            frontier.set(edge, state);
        }
        let runner = Region {
            ctx,
            base,
            frontier,
            tasks: JoinSet::new(),
            deadlines: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            local: BTreeMap::new(),
            escalated: Vec::new(),
            last_scope: None,
            cancelled: false,
        };
        runner.drive().await
    }
    .instrument(span)
    .boxed()
}

struct Region {
    ctx: Arc<RunContext>,
    base: Token,
    frontier: Frontier,
    tasks: JoinSet<Settled>,
    /// Join barrier deadlines, started at the first arrival.
    deadlines: BTreeMap<NodeId, Instant>,
    /// Error handlers that ran and wait for their protected nodes.
    awaiting: BTreeMap<NodeId, Scope>,
    local: BTreeMap<NodeId, Vec<HandledFailure>>,
    escalated: Vec<HandledFailure>,
    last_scope: Option<(usize, Scope)>,
    cancelled: bool,
}

impl Region {
    async fn drive(mut self) -> RegionOutcome {
        let cancel = self.ctx.cancel.clone();
        loop {
            if !self.cancelled {
                self.schedule();
            }
            if self.tasks.is_empty() {
                if self.cancelled {
                    break;
                }
                if self.deadlines.is_empty() {
                    if self.resolve_handlers(true) {
                        continue;
                    }
                    break;
                }
            }

            let next_deadline = self.deadlines.values().min().copied();
            let running = !self.tasks.is_empty();
            tokio::select! {
                Some(joined) = self.tasks.join_next(), if running => match joined {
                    Ok(settled) => self.apply(settled),
                    Err(err) => warn!(error = %err, "node task aborted"),
                },
                () = sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() && !self.cancelled => self.expire_joins(),
                () = cancel.cancelled(), if !self.cancelled => {
                    debug!("cancellation observed, draining region");
                    self.cancelled = true;
                }
            }
        }

        if !self.cancelled {
            let stalled = self.frontier.unfinished();
            if !stalled.is_empty() {
                debug!(?stalled, "region finished with unresolved nodes");
            }
        }
        RegionOutcome {
            frontier: self.frontier,
            handled: self.escalated,
            last_scope: self.last_scope.map(|(_, scope)| scope),
            cancelled: self.cancelled,
        }
    }

    /// Dispatches every node whose inputs are resolved, repeating while
    /// synchronous skips and blocks unlock more nodes.
    fn schedule(&mut self) {
        loop {
            let mut progressed = false;
            for node_id in self.frontier.candidates(&self.ctx.plan) {
                match self.frontier.readiness(&self.ctx.plan, &node_id) {
                    Readiness::Waiting { arrived } => {
                        if arrived && !self.deadlines.contains_key(&node_id) {
                            self.start_join_timer(&node_id);
                        }
                    }
                    Readiness::Run(ports) => {
                        self.launch(node_id, ports);
                        progressed = true;
                    }
                    Readiness::Skip(scope) => {
                        self.skip(&node_id, scope);
                        progressed = true;
                    }
                    Readiness::Blocked(error, scope) => {
                        self.block(&node_id, error, scope);
                        progressed = true;
                    }
                    Readiness::Unfillable { port, scope } => {
                        let message = format!("input port '{port}' will never receive a value");
                        let settled = join_failure(&self.ctx, &node_id, message, &scope);
                        self.apply(settled);
                        progressed = true;
                    }
                }
            }
            progressed |= self.resolve_handlers(false);
            if !progressed {
                break;
            }
        }
    }

    fn start_join_timer(&mut self, node_id: &NodeId) {
        let timeout_ms = match self.ctx.plan.node(node_id).map(|node| &node.config) {
            Some(NodeConfig::Merge(config)) => config.timeout_ms,
            Some(NodeConfig::Aggregator(config)) => config.timeout_ms,
            _ => None,
        }
        .unwrap_or(self.ctx.config.join_timeout_ms);
        debug!(node_id = %node_id, timeout_ms, "join barrier armed");
        self.deadlines
            .insert(node_id.clone(), Instant::now() + Duration::from_millis(timeout_ms));
    }

    fn launch(&mut self, node_id: NodeId, ports: PortValues) {
        self.deadlines.remove(&node_id);
        self.frontier.dispatch(&node_id);
        let Some(node) = self.ctx.plan.node(&node_id) else {
            return;
        };

        let input = if node.node_type().is_join() {
            let scope = ports
                .iter()
                .find_map(|(_, tokens)| tokens.first())
                .map_or_else(|| self.base.scope.pop_branch(), |token| token.scope.pop_branch());
            NodeInput::Joined { ports, scope }
        } else {
            let token = ports
                .into_iter()
                .find_map(|(_, tokens)| tokens.into_iter().next())
                .unwrap_or_else(|| self.base.clone());
            NodeInput::Token(token)
        };

        self.ctx.emit(ExecutionEvent::NodeReady {
            run_id: self.ctx.run_id,
            node: instance_of(&node_id, input.scope()),
            timestamp: Utc::now(),
        });

        let ctx = Arc::clone(&self.ctx);
        let instance = instance_of(&node_id, input.scope());
        let scope = input.scope().clone();
        match (self.ctx.plan.body(&node_id), input) {
            (Some(body), NodeInput::Token(token)) => {
                let externals = body
                    .external_inputs
                    .iter()
                    .map(|&edge| (edge, self.frontier.state(edge).clone()))
                    .collect();
                let task = run_loop(Arc::clone(&ctx), node_id, token, externals);
                self.tasks.spawn(contain_panic(ctx, instance, scope, task));
            }
            (_, input) => {
                let task = run_node(Arc::clone(&ctx), node_id, input);
                self.tasks.spawn(contain_panic(ctx, instance, scope, task));
            }
        }
    }

    fn skip(&mut self, node_id: &NodeId, scope: Scope) {
        debug!(node_id = %node_id, "skipping node, no input reached it");
        self.ctx.emit(ExecutionEvent::NodeSkipped {
            run_id: self.ctx.run_id,
            node: instance_of(node_id, &scope),
            reason: "no input reached this node".to_string(),
            timestamp: Utc::now(),
        });
        let settled = Settled::new(node_id).with_exits(&self.ctx.plan, &EdgeState::Skipped(scope));
        self.apply(settled);
    }

    fn block(&mut self, node_id: &NodeId, error: NodeError, scope: Scope) {
        let is_output = self
            .ctx
            .plan
            .node(node_id)
            .is_some_and(|node| graph::output_key(node).is_some());
        if is_output {
            self.ctx.emit(ExecutionEvent::NodeFailed {
                run_id: self.ctx.run_id,
                node: instance_of(node_id, &scope),
                attempt: 0,
                error: error.clone(),
                duration_ms: 0,
                timestamp: Utc::now(),
            });
        }
        let settled =
            Settled::new(node_id).with_exits(&self.ctx.plan, &EdgeState::Failed(error, scope));
        self.apply(settled);
    }

    fn expire_joins(&mut self) {
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        for node_id in expired {
            self.deadlines.remove(&node_id);
            let partial = match self.ctx.plan.node(&node_id).map(|node| &node.config) {
                Some(NodeConfig::Merge(config)) => config.partial_results,
                Some(NodeConfig::Aggregator(config)) => config.partial_results,
                _ => false,
            };
            let arrived = self.frontier.arrived(&self.ctx.plan, &node_id);
            if partial {
                warn!(node_id = %node_id, ports = arrived.len(), "join timed out, continuing with partial results");
                self.launch(node_id, arrived);
            } else {
                warn!(node_id = %node_id, "join timed out");
                let scope = arrived
                    .iter()
                    .find_map(|(_, tokens)| tokens.first())
                    .map_or_else(|| self.base.scope.clone(), |token| token.scope.pop_branch());
                let settled = join_failure(
                    &self.ctx,
                    &node_id,
                    "timed out waiting for inputs".to_string(),
                    &scope,
                );
                self.apply(settled);
            }
        }
    }

    fn apply(&mut self, settled: Settled) {
        self.frontier.finish(&settled.node);
        for (edge, state) in settled.edges {
            self.frontier.set(edge, state);
        }
        for handled in settled.handled {
            if self.frontier.is_member(&handled.handler) {
                self.local.entry(handled.handler.clone()).or_default().push(handled);
            } else {
                self.escalated.push(handled);
            }
        }
        if let Some(scope) = settled.scope {
            let position = self.ctx.plan.topo_position(&settled.node);
            if self.last_scope.as_ref().is_none_or(|(last, _)| position >= *last) {
                self.last_scope = Some((position, scope));
            }
        }
        if let Some(scope) = settled.deferred {
            self.awaiting.insert(settled.node, scope);
        }
    }

    fn protected_done(&self, handler: &NodeId) -> bool {
        self.ctx.plan.protected_by(handler).is_none_or(|protected| {
            protected
                .iter()
                .all(|node_id| !self.frontier.is_member(node_id) || self.frontier.is_finished(node_id))
        })
    }

    /// Releases error handlers whose protected nodes have all finished.
    ///
    /// With `force`, a stalled region releases its earliest handler even if
    /// some protected node never ran, since nothing else can progress.
    fn resolve_handlers(&mut self, force: bool) -> bool {
        let mut ready: Vec<NodeId> = self
            .awaiting
            .keys()
            .filter(|handler| self.protected_done(handler))
            .cloned()
            .collect();
        if ready.is_empty() && force {
            ready.extend(
                self.awaiting
                    .keys()
                    .min_by_key(|handler| self.ctx.plan.topo_position(handler))
                    .cloned(),
            );
        }
        let progressed = !ready.is_empty();
        for handler in ready {
            if let Some(scope) = self.awaiting.remove(&handler) {
                self.release_handler(&handler, &scope);
            }
        }
        progressed
    }

    fn release_handler(&mut self, handler: &NodeId, scope: &Scope) {
        let failures = self.local.remove(handler).unwrap_or_default();
        let plan = &self.ctx.plan;
        let fallback = match plan.node(handler).map(|node| &node.config) {
            Some(NodeConfig::ErrorHandler(config)) => config.fallback_value.clone(),
            _ => None,
        };
        let first = failures.into_iter().min_by_key(|failure| {
            (
                plan.topo_position(&failure.error.node_id),
                failure.error.iteration,
                failure.error.branch.clone(),
            )
        });

        let (error_state, fallback_state) = match first {
            Some(failure) => {
                let payload = failure.error.to_payload(failure.attempts);
                debug!(
                    handler = %handler,
                    failed = %failure.error.node_id,
                    "routing handled failure"
                );
                let fallback_value = match fallback {
                    Some(template) => {
                        let eval = EvalContext::new(scope, Some(&payload));
                        expression::evaluate_value(&template, &eval).unwrap_or(template)
                    }
                    None => payload.clone(),
                };
                (
                    EdgeState::Arrived(vec![Token::new(payload, scope.clone())]),
                    EdgeState::Arrived(vec![Token::new(fallback_value, scope.clone())]),
                )
            }
            None => (
                EdgeState::Skipped(scope.clone()),
                EdgeState::Skipped(scope.clone()),
            ),
        };

        let edges: Vec<(EdgeIndex, EdgeState)> = plan
            .outbound(handler)
            .iter()
            .filter_map(|&edge| match plan.edge(edge).source_port.as_str() {
                "error" => Some((edge, error_state.clone())),
                "fallback" => Some((edge, fallback_state.clone())),
                _ => None,
            })
            .collect();
        for (edge, state) in edges {
            self.frontier.set(edge, state);
        }
    }
}

/// Settles a failure: handed to the protecting handler if it catches the
/// kind, recorded as an unhandled failure otherwise.
fn settle_failure(
    ctx: &RunContext,
    instance: &NodeInstance,
    scope: &Scope,
    error: NodeError,
    attempt: u32,
    duration_ms: u64,
) -> Settled {
    let node_id = &instance.node_id;
    let settled = Settled::new(node_id);
    if let Some((handler, _)) = ctx.catching_handler(node_id, error.kind) {
        warn!(node_id = %node_id, handler = %handler, error = %error, "node failure handled");
        ctx.emit(ExecutionEvent::NodeHandled {
            run_id: ctx.run_id,
            node: instance.clone(),
            attempt,
            handler: handler.clone(),
            error: error.clone(),
            timestamp: Utc::now(),
        });
        let mut settled = settled.with_exits(&ctx.plan, &EdgeState::Skipped(scope.clone()));
        settled.handled.push(HandledFailure {
            handler: handler.clone(),
            error,
            attempts: attempt,
        });
        return settled;
    }

    warn!(node_id = %node_id, error = %error, "node failed");
    ctx.note_failure(&error);
    ctx.emit(ExecutionEvent::NodeFailed {
        run_id: ctx.run_id,
        node: instance.clone(),
        attempt,
        error: error.clone(),
        duration_ms,
        timestamp: Utc::now(),
    });
    settled.with_exits(&ctx.plan, &EdgeState::Failed(error, scope.clone()))
}

fn join_failure(ctx: &RunContext, node_id: &NodeId, message: String, scope: &Scope) -> Settled {
    let instance = instance_of(node_id, scope);
    let error = ctx.node_error(&instance, Failure::new(ErrorKind::JoinTimeout, message));
    settle_failure(ctx, &instance, scope, error, 1, 0)
}

fn cancelled(ctx: &RunContext, instance: &NodeInstance, attempt: u32) -> Settled {
    debug!(node_id = %instance.node_id, attempt, "node cancelled");
    ctx.emit(ExecutionEvent::NodeCancelled {
        run_id: ctx.run_id,
        node: instance.clone(),
        attempt,
        timestamp: Utc::now(),
    });
    Settled::new(&instance.node_id)
}

/// Turns a panic inside a node task into a failure of that node, so the
/// region still settles its outgoing edges.
async fn contain_panic(
    ctx: Arc<RunContext>,
    instance: NodeInstance,
    scope: Scope,
    task: impl Future<Output = Settled>,
) -> Settled {
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(settled) => settled,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|text| (*text).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            warn!(node_id = %instance.node_id, %message, "node task panicked");
            let failure = Failure::new(ErrorKind::ExecutorError, format!("node task panicked: {message}"));
            let error = ctx.node_error(&instance, failure);
            let attempt = ctx.latest_attempt(&instance);
            settle_failure(&ctx, &instance, &scope, error, attempt, 0)
        }
    }
}

/// Runs one node instance, retrying while its error handler allows.
async fn run_node(ctx: Arc<RunContext>, node_id: NodeId, input: NodeInput) -> Settled {
    let Some(node) = ctx.plan.node(&node_id) else {
        return Settled::new(&node_id);
    };
    let instance = instance_of(&node_id, input.scope());
    let mut attempt = 1;

    loop {
        ctx.emit(ExecutionEvent::NodeStarted {
            run_id: ctx.run_id,
            node: instance.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        let started = Instant::now();
        let result = perform(&ctx, node, &input).await;
        let duration_ms = elapsed_ms(started);

        let failure = match result {
            Ok(emission) => {
                return succeed(&ctx, node, &instance, input.scope(), emission, attempt, duration_ms);
            }
            Err(failure) if failure.kind == ErrorKind::Cancelled => {
                return cancelled(&ctx, &instance, attempt);
            }
            Err(failure) => failure,
        };

        let error = ctx.node_error(&instance, failure);
        if let Some((_, config)) = ctx.catching_handler(&node_id, error.kind)
            && attempt <= config.retry_count
        {
            let delay_ms = config.retry_delay(attempt);
            warn!(node_id = %node_id, attempt, delay_ms, error = %error, "retrying node");
            ctx.emit(ExecutionEvent::NodeRetrying {
                run_id: ctx.run_id,
                node: instance.clone(),
                attempt,
                error,
                delay_ms,
                timestamp: Utc::now(),
            });
            tokio::select! {
                () = sleep(Duration::from_millis(delay_ms)) => {}
                () = ctx.cancel.cancelled() => return cancelled(&ctx, &instance, attempt),
            }
            attempt += 1;
            continue;
        }
        return settle_failure(&ctx, &instance, input.scope(), error, attempt, duration_ms);
    }
}

fn succeed(
    ctx: &RunContext,
    node: &Node,
    instance: &NodeInstance,
    input_scope: &Scope,
    emission: Emission,
    attempt: u32,
    duration_ms: u64,
) -> Settled {
    let Emission { value, ports, scope } = emission;
    let scope = scope
        .unwrap_or_else(|| input_scope.clone())
        .bind_output(&node.id, value.clone());
    debug!(node_id = %node.id, attempt, duration_ms, "node succeeded");
    ctx.emit(ExecutionEvent::NodeSucceeded {
        run_id: ctx.run_id,
        node: instance.clone(),
        attempt,
        output: value,
        output_key: graph::output_key(node).map(str::to_string),
        duration_ms,
        timestamp: Utc::now(),
    });

    let is_handler = matches!(node.config, NodeConfig::ErrorHandler(_));
    let forks = matches!(node.config, NodeConfig::Parallel(_));
    let mut settled = Settled::new(&node.id);
    for &edge in ctx.plan.outbound(&node.id) {
        let port = &ctx.plan.edge(edge).source_port;
        match ports.iter().find(|(name, _)| name == port) {
            Some((_, value)) => {
                let port_scope = if forks {
                    scope.push(FrameKind::Branch {
                        node: node.id.clone(),
                        port: port.clone(),
                    })
                } else {
                    scope.clone()
                };
                settled
                    .edges
                    .push((edge, EdgeState::Arrived(vec![Token::new(value.clone(), port_scope)])));
            }
            None if is_handler && (port == "error" || port == "fallback") => {}
            None => settled.edges.push((edge, EdgeState::Skipped(scope.clone()))),
        }
    }
    if is_handler {
        settled.deferred = Some(scope.clone());
    }
    settled.scope = Some(scope);
    settled
}

/// One attempt of a non-loop node.
async fn perform(ctx: &RunContext, node: &Node, input: &NodeInput) -> Result<Emission, Failure> {
    match (&node.config, input) {
        (NodeConfig::Merge(config), NodeInput::Joined { ports, .. }) => Ok(Emission::on(
            "output",
            dispatch::combine_merge(config, &port_values(ports)),
        )),
        (NodeConfig::Aggregator(config), NodeInput::Joined { ports, .. }) => Ok(Emission::on(
            "output",
            dispatch::combine_aggregate(config, &port_values(ports))?,
        )),
        (NodeConfig::Agent(config), NodeInput::Token(token)) => {
            call_agent(ctx, node, config, token).await
        }
        (NodeConfig::Database(config), NodeInput::Token(token)) => {
            call_database(ctx, node, config, token).await
        }
        (NodeConfig::Delay(config), NodeInput::Token(token)) => wait(ctx, config, token).await,
        (_, NodeInput::Token(token)) => {
            let wired = |port: &str| ctx.plan.is_wired(&node.id, port);
            dispatch::run_inline(node, &token.value, &token.scope, &wired)
        }
        (_, NodeInput::Joined { .. }) => Err(Failure::new(
            ErrorKind::UnknownNodeType,
            format!("node type '{}' cannot join inputs", node.node_type().as_str()),
        )),
    }
}

fn port_values(ports: &PortValues) -> Vec<(String, Vec<JsonValue>)> {
    ports
        .iter()
        .map(|(port, tokens)| {
            (
                port.clone(),
                tokens.iter().map(|token| token.value.clone()).collect(),
            )
        })
        .collect()
}

fn request_timeout(ctx: &RunContext, timeout_ms: Option<u64>) -> Duration {
    timeout_ms.map_or_else(|| ctx.config.default_timeout(), Duration::from_millis)
}

async fn call_agent(
    ctx: &RunContext,
    node: &Node,
    config: &AgentConfig,
    token: &Token,
) -> Result<Emission, Failure> {
    let task = {
        let eval = EvalContext::new(&token.scope, Some(&token.value));
        expression::evaluate(&config.task, &eval)?
    };
    let request = ExecutorRequest {
        node_id: node.id.clone(),
        node_type: node.node_type(),
        kind: config.agent_kind.clone(),
        payload: json!({ "task": task, "input": token.value }),
        scope: token.scope.snapshot(),
        timeout: request_timeout(ctx, config.timeout_ms),
    };
    let value = ctx
        .gateway
        .execute(request, &ctx.cancel)
        .await
        .map_err(|err| Failure::new(err.kind(), err.to_string()))?;
    Ok(Emission::on("output", value))
}

async fn call_database(
    ctx: &RunContext,
    node: &Node,
    config: &DatabaseConfig,
    token: &Token,
) -> Result<Emission, Failure> {
    let (query, parameters) = {
        let eval = EvalContext::new(&token.scope, Some(&token.value));
        let query = expression::render(&expression::evaluate(&config.query, &eval)?);
        let parameters = config
            .parameters
            .iter()
            .map(|parameter| expression::evaluate_value(parameter, &eval))
            .collect::<Result<Vec<_>, _>>()?;
        (query, parameters)
    };
    let request = ExecutorRequest {
        node_id: node.id.clone(),
        node_type: node.node_type(),
        kind: config.connection.clone(),
        payload: json!({
            "statement": config.statement,
            "query": query,
            "parameters": parameters,
            "input": token.value,
        }),
        scope: token.scope.snapshot(),
        timeout: request_timeout(ctx, config.timeout_ms),
    };
    let value = ctx
        .gateway
        .execute(request, &ctx.cancel)
        .await
        .map_err(|err| Failure::new(err.kind(), err.to_string()))?;
    Ok(Emission::on("output", value))
}

async fn pause(ctx: &RunContext, duration: Duration) -> Result<(), Failure> {
    tokio::select! {
        () = sleep(duration) => Ok(()),
        () = ctx.cancel.cancelled() => Err(Failure::new(ErrorKind::Cancelled, "run cancelled")),
    }
}

/// Waits, then passes the input through unchanged.
async fn wait(ctx: &RunContext, config: &DelayConfig, token: &Token) -> Result<Emission, Failure> {
    if config.mode == DelayMode::Until {
        let condition = Expression::parse(config.condition.as_deref().unwrap_or("true"))?;
        let poll = Duration::from_millis(
            config
                .poll_interval_ms
                .unwrap_or(ctx.config.delay_poll_interval_ms)
                .max(1),
        );
        let timeout = request_timeout(ctx, config.timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            let holds = {
                let eval = EvalContext::new(&token.scope, Some(&token.value))
                    .with_local("now", JsonValue::from(Utc::now().timestamp_millis()));
                condition.test(&eval)?
            };
            if holds {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Failure::new(
                    ErrorKind::ExecutorError,
                    format!("condition not met within {}ms", timeout.as_millis()),
                ));
            }
            pause(ctx, poll).await?;
        }
    } else {
        let delay_ms = dispatch::delay_ms(config, token.scope.iteration(), ctx.config.max_delay_ms);
        pause(ctx, Duration::from_millis(delay_ms)).await?;
    }
    Ok(Emission::on("output", token.value.clone()))
}

enum IterationSource {
    Items(Vec<JsonValue>),
    While(Expression),
}

fn iteration_source(config: &LoopConfig, token: &Token, limit: u32) -> Result<IterationSource, Failure> {
    let eval = EvalContext::new(&token.scope, Some(&token.value));
    let too_many = |count: u64| {
        Failure::new(
            ErrorKind::LoopBoundExceeded,
            format!("{count} iterations exceed the limit of {limit}"),
        )
    };
    match config.mode {
        LoopMode::ForEach => {
            let items = match &config.items {
                Some(JsonValue::String(source)) => expression::evaluate_expression(source, &eval)?,
                Some(items) => expression::evaluate_value(items, &eval)?,
                None => token.value.clone(),
            };
            let items = match items {
                JsonValue::Array(items) => items,
                other => {
                    return Err(Failure::new(
                        ErrorKind::EvalError,
                        format!("loop items must be an array, got {other}"),
                    ));
                }
            };
            if items.len() > limit as usize {
                return Err(too_many(items.len() as u64));
            }
            Ok(IterationSource::Items(items))
        }
        LoopMode::Count => {
            let count = match &config.count {
                Some(JsonValue::String(source)) => expression::evaluate_expression(source, &eval)?,
                Some(count) => count.clone(),
                None => JsonValue::from(0),
            };
            let count = count.as_u64().ok_or_else(|| {
                Failure::new(
                    ErrorKind::EvalError,
                    format!("loop count must be a non-negative integer, got {count}"),
                )
            })?;
            if count > u64::from(limit) {
                return Err(too_many(count));
            }
            Ok(IterationSource::Items((0..count).map(JsonValue::from).collect()))
        }
        LoopMode::While => Ok(IterationSource::While(Expression::parse(
            config.condition.as_deref().unwrap_or("false"),
        )?)),
    }
}

/// The result of one loop iteration.
struct Iteration {
    value: JsonValue,
    failure: Option<NodeError>,
    /// Iteration scope truncated back to the loop's depth.
    exit_scope: Scope,
    exits: Vec<(EdgeIndex, EdgeState)>,
    handled: Vec<HandledFailure>,
}

async fn run_iteration(
    ctx: Arc<RunContext>,
    loop_id: NodeId,
    index: u32,
    item: JsonValue,
    outer: Scope,
    externals: Vec<(EdgeIndex, EdgeState)>,
) -> Iteration {
    let depth = outer.depth();
    let scope = outer
        .push(FrameKind::Loop {
            node: loop_id.clone(),
            iteration: index,
        })
        .define("item", item.clone())
        .define("index", JsonValue::from(index));

    let Some(body) = ctx.plan.body(&loop_id) else {
        return Iteration {
            value: item,
            failure: None,
            exit_scope: outer,
            exits: Vec::new(),
            handled: Vec::new(),
        };
    };
    let mut seeds: Vec<(EdgeIndex, EdgeState)> = body
        .item_edges
        .iter()
        .map(|&edge| (edge, EdgeState::Arrived(vec![Token::new(item.clone(), scope.clone())])))
        .collect();
    seeds.extend(externals.into_iter().map(|(edge, state)| (edge, rescope(state, &scope))));

    let outcome = run_region(
        Arc::clone(&ctx),
        Some(loop_id.clone()),
        seeds,
        Token::new(item.clone(), scope.clone()),
    )
    .await;

    let fallback_scope = outcome.last_scope.clone().unwrap_or_else(|| scope.clone());
    let loop_back = body.loop_back.map(|edge| outcome.frontier.state(edge));
    let (value, failure, exit_scope) = match loop_back {
        Some(EdgeState::Arrived(tokens)) => match tokens.last() {
            Some(token) => (token.value.clone(), None, token.scope.clone()),
            None => (item, None, fallback_scope),
        },
        Some(EdgeState::Failed(error, _)) => (JsonValue::Null, Some(error.clone()), fallback_scope),
        _ => (item, None, fallback_scope),
    };
    let exits = body
        .exit_edges
        .iter()
        .map(|&edge| (edge, outcome.frontier.state(edge).clone()))
        .collect();

    Iteration {
        value,
        failure,
        exit_scope: exit_scope.truncate(depth),
        exits,
        handled: outcome.handled,
    }
}

fn rescope(state: EdgeState, scope: &Scope) -> EdgeState {
    match state {
        EdgeState::Arrived(tokens) => {
            EdgeState::Arrived(tokens.iter().map(|token| token.rescoped(scope)).collect())
        }
        EdgeState::Skipped(_) => EdgeState::Skipped(scope.clone()),
        EdgeState::Failed(error, _) => EdgeState::Failed(error, scope.clone()),
        EdgeState::Pending => EdgeState::Pending,
    }
}

/// Folds one body exit edge over all iterations, in iteration order.
fn collect_exit(edge: EdgeIndex, iterations: &[Iteration], snapshot: Option<&Scope>, scope: &Scope) -> EdgeState {
    let mut tokens = Vec::new();
    let mut silent = 0;
    for iteration in iterations {
        let state = iteration
            .exits
            .iter()
            .find(|(exit, _)| *exit == edge)
            .map(|(_, state)| state);
        match state {
            Some(EdgeState::Failed(error, failed_scope)) => {
                return EdgeState::Failed(error.clone(), failed_scope.truncate(scope.depth()));
            }
            Some(EdgeState::Arrived(arrived)) => {
                let target = snapshot.unwrap_or(&iteration.exit_scope);
                tokens.extend(arrived.iter().map(|token| token.rescoped(target)));
            }
            _ => silent += 1,
        }
    }
    if !iterations.is_empty() && silent == iterations.len() {
        EdgeState::Skipped(scope.clone())
    } else {
        EdgeState::Arrived(tokens)
    }
}

/// Runs a loop node and its iterations.
async fn run_loop(
    ctx: Arc<RunContext>,
    node_id: NodeId,
    token: Token,
    externals: Vec<(EdgeIndex, EdgeState)>,
) -> Settled {
    let instance = instance_of(&node_id, &token.scope);
    let Some(NodeConfig::Loop(config)) = ctx.plan.node(&node_id).map(|node| &node.config) else {
        return Settled::new(&node_id);
    };
    ctx.emit(ExecutionEvent::NodeStarted {
        run_id: ctx.run_id,
        node: instance.clone(),
        attempt: 1,
        timestamp: Utc::now(),
    });
    let started = Instant::now();
    let limit = config.max_iterations.unwrap_or(ctx.config.max_loop_iterations);

    let source = match iteration_source(config, &token, limit) {
        Ok(source) => source,
        Err(failure) => {
            let error = ctx.node_error(&instance, failure);
            return settle_failure(&ctx, &instance, &token.scope, error, 1, elapsed_ms(started));
        }
    };

    let mut iterations: Vec<Iteration> = Vec::new();
    let mut bound_failure: Option<Failure> = None;
    let parallel = config.parallel_execution && matches!(source, IterationSource::Items(_));
    match source {
        IterationSource::Items(items) if parallel => {
            debug!(node_id = %node_id, count = items.len(), "running iterations concurrently");
            let runs = (0u32..).zip(items).map(|(index, item)| {
                run_iteration(
                    Arc::clone(&ctx),
                    node_id.clone(),
                    index,
                    item,
                    token.scope.clone(),
                    externals.clone(),
                )
            });
            iterations = join_all(runs).await;
        }
        IterationSource::Items(items) => {
            let mut scope = token.scope.clone();
            for (index, item) in (0u32..).zip(items) {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let iteration = run_iteration(
                    Arc::clone(&ctx),
                    node_id.clone(),
                    index,
                    item,
                    scope.clone(),
                    externals.clone(),
                )
                .await;
                scope = iteration.exit_scope.clone();
                iterations.push(iteration);
            }
        }
        IterationSource::While(condition) => {
            let mut scope = token.scope.clone();
            let mut index = 0u32;
            while !ctx.cancel.is_cancelled() {
                let holds = {
                    let eval = EvalContext::new(&scope, Some(&token.value))
                        .with_local("index", JsonValue::from(index));
                    condition.test(&eval)
                };
                match holds {
                    Ok(false) => break,
                    Ok(true) if index >= limit => {
                        bound_failure = Some(Failure::new(
                            ErrorKind::LoopBoundExceeded,
                            format!("condition still holds after {limit} iterations"),
                        ));
                        break;
                    }
                    Ok(true) => {}
                    Err(err) => {
                        bound_failure = Some(err.into());
                        break;
                    }
                }
                let iteration = run_iteration(
                    Arc::clone(&ctx),
                    node_id.clone(),
                    index,
                    token.value.clone(),
                    scope.clone(),
                    externals.clone(),
                )
                .await;
                scope = iteration.exit_scope.clone();
                iterations.push(iteration);
                index += 1;
            }
        }
    }

    let handled: Vec<HandledFailure> = iterations
        .iter()
        .flat_map(|iteration| iteration.handled.iter().cloned())
        .collect();

    if ctx.cancel.is_cancelled() {
        let mut settled = cancelled(&ctx, &instance, 1);
        settled.handled = handled;
        return settled;
    }
    if let Some(failure) = bound_failure {
        let error = ctx.node_error(&instance, failure);
        let mut settled =
            settle_failure(&ctx, &instance, &token.scope, error, 1, elapsed_ms(started));
        settled.handled.extend(handled);
        return settled;
    }

    let results: Vec<JsonValue> = iterations.iter().map(|iteration| iteration.value.clone()).collect();
    let value = JsonValue::Array(results);
    let continuation = if parallel {
        token.scope.clone()
    } else {
        iterations
            .last()
            .map_or_else(|| token.scope.clone(), |iteration| iteration.exit_scope.clone())
    };
    let scope = continuation.bind_output(&node_id, value.clone());
    let duration_ms = elapsed_ms(started);
    debug!(node_id = %node_id, iterations = iterations.len(), duration_ms, "loop finished");
    ctx.emit(ExecutionEvent::NodeSucceeded {
        run_id: ctx.run_id,
        node: instance,
        attempt: 1,
        output: value.clone(),
        output_key: None,
        duration_ms,
        timestamp: Utc::now(),
    });

    let snapshot = parallel.then_some(&token.scope);
    let loop_failure = iterations.iter().find_map(|iteration| iteration.failure.clone());
    let mut settled = Settled::new(&node_id);
    for &edge in ctx.plan.outbound(&node_id) {
        if ctx.plan.edge(edge).source_port != "completed" {
            continue;
        }
        let state = match &loop_failure {
            Some(error) => EdgeState::Failed(error.clone(), scope.clone()),
            None => EdgeState::Arrived(vec![Token::new(value.clone(), scope.clone())]),
        };
        settled.edges.push((edge, state));
    }
    if let Some(body) = ctx.plan.body(&node_id) {
        for &edge in &body.exit_edges {
            settled
                .edges
                .push((edge, collect_exit(edge, &iterations, snapshot, &scope)));
        }
    }
    settled.handled = handled;
    settled.scope = Some(scope);
    settled
}
