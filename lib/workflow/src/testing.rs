//! Builders and scripted executors shared by the unit tests.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::gateway::{EchoHandler, ExecutorError, ExecutorGateway, ExecutorHandler, ExecutorRequest};
use crate::node::{Node, NodeConfig, NodeType};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Builds a node from its type name and raw config.
pub fn node_with(id: &str, node_type: &str, config: JsonValue) -> Node {
    let node_type: NodeType = node_type.parse().expect("known node type");
    let config = NodeConfig::from_raw(node_type, config).expect("valid config");
    Node::new(id, config)
}

pub fn trigger(id: &str) -> Node {
    node_with(id, "trigger", json!({}))
}

pub fn agent(id: &str, kind: &str, task: &str) -> Node {
    node_with(id, "agent", json!({ "agentKind": kind, "task": task }))
}

pub fn condition(id: &str, expression: &str) -> Node {
    node_with(id, "condition", json!({ "expression": expression }))
}

pub fn loop_over(id: &str, items: JsonValue) -> Node {
    node_with(id, "loop", json!({ "mode": "forEach", "items": items }))
}

pub fn merge(id: &str) -> Node {
    node_with(id, "merge", json!({}))
}

pub fn output(id: &str) -> Node {
    node_with(id, "output", json!({}))
}

pub fn output_with_key(id: &str, key: &str) -> Node {
    node_with(id, "output", json!({ "key": key }))
}

/// An engine whose gateway echoes every call.
pub fn engine() -> Engine {
    engine_with(EngineConfig::default(), |_| {})
}

/// An engine with echo fallback plus whatever `setup` registers.
pub fn engine_with(config: EngineConfig, setup: impl FnOnce(&ExecutorGateway)) -> Engine {
    let gateway = ExecutorGateway::new().with_fallback(EchoHandler);
    setup(&gateway);
    Engine::new(config, gateway)
}

/// Fails its first `failures` calls, then echoes the payload.
#[derive(Clone)]
pub struct ScriptedHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedHandler {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorHandler for ScriptedHandler {
    async fn execute(&self, request: ExecutorRequest) -> Result<JsonValue, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ExecutorError::Failed {
                message: format!("scripted failure {call}"),
            });
        }
        Ok(json!({ "call": call, "payload": request.payload }))
    }
}

/// Sleeps before echoing, to hold a node in flight.
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ExecutorHandler for SlowHandler {
    async fn execute(&self, request: ExecutorRequest) -> Result<JsonValue, ExecutorError> {
        tokio::time::sleep(self.delay).await;
        Ok(request.payload)
    }
}

/// Panics on every call.
pub struct PanickingHandler;

#[async_trait]
impl ExecutorHandler for PanickingHandler {
    async fn execute(&self, _request: ExecutorRequest) -> Result<JsonValue, ExecutorError> {
        panic!("handler exploded");
    }
}
