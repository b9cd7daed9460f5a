//! Executor gateway.
//!
//! The interpreter never talks to agents or databases directly. Blocking
//! node types build a payload and hand it to the gateway, which routes it
//! to the handler registered for the node's kind, bounds it with a timeout,
//! races it against the run's cancellation token, and keeps a per-kind
//! circuit breaker.

use crate::error::ErrorKind;
use crate::node::{NodeId, NodeType};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A unit of external work.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorRequest {
    pub node_id: NodeId,
    pub node_type: NodeType,
    /// Handler routing key, e.g. `claude` or `postgres`.
    pub kind: String,
    pub payload: JsonValue,
    /// Flattened scope of the calling node.
    pub scope: JsonValue,
    pub timeout: Duration,
}

/// Failures reported by executor handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorError {
    /// The work ran and failed.
    Failed { message: String },
    /// The handler could not use the payload.
    InvalidPayload { message: String },
    /// The backing service is not reachable.
    Unavailable { message: String },
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "execution failed: {message}"),
            Self::InvalidPayload { message } => write!(f, "invalid payload: {message}"),
            Self::Unavailable { message } => write!(f, "executor unavailable: {message}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// A collaborator that performs the work of one or more kinds.
#[async_trait]
pub trait ExecutorHandler: Send + Sync {
    /// Executes a request and returns its result value.
    async fn execute(&self, request: ExecutorRequest) -> Result<JsonValue, ExecutorError>;
}

/// Errors from a gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No handler is registered for the kind and there is no fallback.
    NoHandler { kind: String },
    /// The handler did not answer within the timeout.
    Timeout { kind: String, timeout_ms: u64 },
    /// The run was cancelled while the call was in flight.
    Cancelled,
    /// Too many consecutive failures; the kind is failing fast.
    CircuitOpen { kind: String },
    /// The handler reported a failure.
    Executor { kind: String, error: ExecutorError },
}

impl GatewayError {
    /// The node error kind this failure maps to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::ExecutorError,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHandler { kind } => write!(f, "no executor registered for kind '{kind}'"),
            Self::Timeout { kind, timeout_ms } => {
                write!(f, "executor '{kind}' timed out after {timeout_ms}ms")
            }
            Self::Cancelled => write!(f, "executor call cancelled"),
            Self::CircuitOpen { kind } => write!(f, "circuit open for executor '{kind}'"),
            Self::Executor { kind, error } => write!(f, "executor '{kind}': {error}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed { failures: u32 },
    Open { until: Instant },
    /// One trial call is in flight.
    HalfOpen,
}

/// Routes executor requests to registered handlers.
pub struct ExecutorGateway {
    handlers: DashMap<String, Arc<dyn ExecutorHandler>>,
    fallback: Option<Arc<dyn ExecutorHandler>>,
    breakers: DashMap<String, Breaker>,
    failure_threshold: u32,
    recovery: Duration,
}

impl Default for ExecutorGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorGateway {
    /// Creates a gateway with no handlers and the circuit breaker disabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: None,
            breakers: DashMap::new(),
            failure_threshold: 0,
            recovery: Duration::ZERO,
        }
    }

    /// Opens a kind's circuit after `failure_threshold` consecutive failures
    /// for `recovery`. A threshold of 0 disables the breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, recovery: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.recovery = recovery;
        self
    }

    /// Handler used for kinds without a registered handler.
    #[must_use]
    pub fn with_fallback(mut self, handler: impl ExecutorHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Registers the handler for a kind, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, handler: impl ExecutorHandler + 'static) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Returns true if calls for `kind` have somewhere to go.
    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.fallback.is_some() || self.handlers.contains_key(kind)
    }

    /// Executes a request.
    ///
    /// # Errors
    ///
    /// Returns `NoHandler`, `CircuitOpen`, `Timeout`, `Cancelled`, or the
    /// handler's own failure as `Executor`.
    pub async fn execute(
        &self,
        request: ExecutorRequest,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, GatewayError> {
        let kind = request.kind.clone();
        let handler = self
            .handlers
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| GatewayError::NoHandler { kind: kind.clone() })?;
        self.admit(&kind)?;

        let timeout = request.timeout;
        debug!(kind = %kind, node_id = %request.node_id, timeout_ms = timeout.as_millis() as u64, "dispatching executor call");
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.release(&kind);
                return Err(GatewayError::Cancelled);
            }
            result = tokio::time::timeout(timeout, handler.execute(request)) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(GatewayError::Executor { kind: kind.clone(), error }),
                Err(_) => Err(GatewayError::Timeout {
                    kind: kind.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        };

        if let Err(err) = &outcome {
            warn!(kind = %kind, error = %err, "executor call failed");
        }
        self.record(&kind, outcome.is_ok());
        outcome
    }

    fn admit(&self, kind: &str) -> Result<(), GatewayError> {
        if self.failure_threshold == 0 {
            return Ok(());
        }
        let mut breaker = self
            .breakers
            .entry(kind.to_string())
            .or_insert(Breaker::Closed { failures: 0 });
        match *breaker {
            Breaker::Closed { .. } => Ok(()),
            Breaker::Open { until } if Instant::now() >= until => {
                debug!(kind, "circuit half-open, allowing trial call");
                *breaker = Breaker::HalfOpen;
                Ok(())
            }
            Breaker::Open { .. } | Breaker::HalfOpen => Err(GatewayError::CircuitOpen {
                kind: kind.to_string(),
            }),
        }
    }

    fn record(&self, kind: &str, success: bool) {
        if self.failure_threshold == 0 {
            return;
        }
        let Some(mut breaker) = self.breakers.get_mut(kind) else {
            return;
        };
        *breaker = match (*breaker, success) {
            (_, true) => Breaker::Closed { failures: 0 },
            (Breaker::Closed { failures }, false) if failures + 1 < self.failure_threshold => {
                Breaker::Closed {
                    failures: failures + 1,
                }
            }
            (_, false) => {
                warn!(kind, recovery_ms = self.recovery.as_millis() as u64, "circuit opened");
                Breaker::Open {
                    until: Instant::now() + self.recovery,
                }
            }
        };
    }

    /// Gives up a half-open trial that never finished.
    fn release(&self, kind: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(kind)
            && matches!(*breaker, Breaker::HalfOpen)
        {
            *breaker = Breaker::Open {
                until: Instant::now(),
            };
        }
    }
}

/// Handler that answers every request with `{kind, payload}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl ExecutorHandler for EchoHandler {
    async fn execute(&self, request: ExecutorRequest) -> Result<JsonValue, ExecutorError> {
        Ok(json!({ "kind": request.kind, "payload": request.payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedHandler;

    fn request(kind: &str, timeout_ms: u64) -> ExecutorRequest {
        ExecutorRequest {
            node_id: NodeId::from("agent1"),
            node_type: NodeType::Agent,
            kind: kind.to_string(),
            payload: json!({ "task": "hello" }),
            scope: json!({}),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    struct Sleeper;

    #[async_trait]
    impl ExecutorHandler for Sleeper {
        async fn execute(&self, _request: ExecutorRequest) -> Result<JsonValue, ExecutorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(JsonValue::Null)
        }
    }

    #[tokio::test]
    async fn routes_by_kind_and_falls_back() {
        let gateway = ExecutorGateway::new();
        gateway.register("claude", EchoHandler);
        let cancel = CancellationToken::new();

        let value = gateway.execute(request("claude", 1000), &cancel).await.unwrap();
        assert_eq!(value["kind"], "claude");
        assert_eq!(value["payload"]["task"], "hello");

        let err = gateway.execute(request("codex", 1000), &cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::NoHandler { kind: "codex".to_string() });

        let gateway = ExecutorGateway::new().with_fallback(EchoHandler);
        assert!(gateway.handles("codex"));
        let value = gateway.execute(request("codex", 1000), &cancel).await.unwrap();
        assert_eq!(value["kind"], "codex");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let gateway = ExecutorGateway::new();
        gateway.register("slow", Sleeper);

        let err = gateway
            .execute(request("slow", 50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Timeout {
                kind: "slow".to_string(),
                timeout_ms: 50
            }
        );
        assert_eq!(err.kind(), ErrorKind::ExecutorError);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_calls() {
        let gateway = ExecutorGateway::new();
        gateway.register("slow", Sleeper);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = gateway.execute(request("slow", 60_000), &cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_and_recovers() {
        let gateway = ExecutorGateway::new().with_circuit_breaker(2, Duration::from_millis(500));
        let handler = ScriptedHandler::failing(2);
        gateway.register("flaky", handler.clone());
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = gateway.execute(request("flaky", 1000), &cancel).await.unwrap_err();
            assert!(matches!(err, GatewayError::Executor { .. }));
        }
        let err = gateway.execute(request("flaky", 1000), &cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::CircuitOpen { kind: "flaky".to_string() });
        assert_eq!(handler.calls(), 2);

        tokio::time::advance(Duration::from_millis(600)).await;
        let value = gateway.execute(request("flaky", 1000), &cancel).await;
        assert!(value.is_ok());
        assert_eq!(handler.calls(), 3);
    }
}
