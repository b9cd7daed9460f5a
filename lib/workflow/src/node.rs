//! Workflow node types and configurations.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - A unique, user-authored ID within the graph
//! - A type from a closed set, carried as a `NodeConfig` variant
//! - Configuration specific to its type
//! - Input and output ports

use crate::error::ErrorKind;
use crate::port::{InputPort, OutputPort};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Borrow;
use std::fmt;

/// A unique identifier for a node within a graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Trigger,
    Agent,
    Condition,
    Loop,
    Parallel,
    Merge,
    Transform,
    Variable,
    Calculator,
    Filter,
    Database,
    JsonParser,
    Aggregator,
    Randomizer,
    Validator,
    Delay,
    ErrorHandler,
    Output,
}

impl NodeType {
    /// Every node type, in declaration order.
    pub const ALL: [NodeType; 18] = [
        Self::Trigger,
        Self::Agent,
        Self::Condition,
        Self::Loop,
        Self::Parallel,
        Self::Merge,
        Self::Transform,
        Self::Variable,
        Self::Calculator,
        Self::Filter,
        Self::Database,
        Self::JsonParser,
        Self::Aggregator,
        Self::Randomizer,
        Self::Validator,
        Self::Delay,
        Self::ErrorHandler,
        Self::Output,
    ];

    /// Returns the document name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Agent => "agent",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Merge => "merge",
            Self::Transform => "transform",
            Self::Variable => "variable",
            Self::Calculator => "calculator",
            Self::Filter => "filter",
            Self::Database => "database",
            Self::JsonParser => "jsonParser",
            Self::Aggregator => "aggregator",
            Self::Randomizer => "randomizer",
            Self::Validator => "validator",
            Self::Delay => "delay",
            Self::ErrorHandler => "errorHandler",
            Self::Output => "output",
        }
    }

    /// Returns true for nodes that join several producers.
    #[must_use]
    pub fn is_join(&self) -> bool {
        matches!(self, Self::Merge | Self::Aggregator)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for `trigger` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {}

/// Configuration for `agent` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Executor kind the gateway routes to (e.g. "claude").
    pub agent_kind: String,
    /// Task template sent to the agent.
    pub task: String,
    /// Per-call timeout; the engine default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Configuration for `condition` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Boolean expression deciding the `true`/`false` port.
    pub expression: String,
}

/// Iteration sub-modes of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopMode {
    #[default]
    ForEach,
    Count,
    While,
}

/// Configuration for `loop` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default)]
    pub mode: LoopMode,
    /// Iterable: a literal array or an expression evaluating to one.
    #[serde(default)]
    pub items: Option<JsonValue>,
    /// Iteration count: a literal number or an expression.
    #[serde(default)]
    pub count: Option<JsonValue>,
    /// Continuation expression for `while` mode.
    #[serde(default)]
    pub condition: Option<String>,
    /// Hard cap on iterations; the engine default applies when absent.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub parallel_execution: bool,
}

/// Configuration for `parallel` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {}

/// How `merge` combines its inbound branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeMode {
    #[default]
    Array,
    Object,
    Concat,
    First,
}

/// Configuration for `merge` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    #[serde(default)]
    pub mode: MergeMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Proceed with the values that arrived when the timeout elapses.
    #[serde(default)]
    pub partial_results: bool,
}

/// Collection operations of `transform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformOperation {
    Map,
    Filter,
    Reduce,
    Sort,
    Group,
    Flatten,
    Merge,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Configuration for `transform` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub operation: TransformOperation,
    /// Per-element expression with `item`, `index` (and `acc` for reduce).
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub initial_value: Option<JsonValue>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// Scope operations of `variable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableOperation {
    Set,
    Get,
    Increment,
    Append,
    Delete,
}

/// Configuration for `variable` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableConfig {
    pub operation: VariableOperation,
    pub name: String,
    /// Value to write; defaults to the node input.
    #[serde(default)]
    pub value: Option<JsonValue>,
    /// Step for `increment`; defaults to 1.
    #[serde(default)]
    pub amount: Option<JsonValue>,
}

/// Arithmetic and aggregate operations of `calculator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CalculatorOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Sum,
    Average,
    Min,
    Max,
    Count,
    Round,
    Abs,
}

/// Configuration for `calculator` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorConfig {
    pub operation: CalculatorOperation,
    /// Literal or template operands; the node input is used when absent.
    #[serde(default)]
    pub operands: Option<Vec<JsonValue>>,
    /// Decimal places for `round`.
    #[serde(default)]
    pub precision: Option<u32>,
}

/// Configuration for `filter` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Per-element predicate with `item` and `index` bound.
    pub expression: String,
}

/// Statement kinds of `database`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatementKind {
    Query,
    Insert,
    Update,
    Delete,
    Transaction,
}

fn default_connection() -> String {
    "postgres".to_string()
}

/// Configuration for `database` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub statement: StatementKind,
    /// Query template.
    pub query: String,
    /// Bound parameters; strings are templates.
    #[serde(default)]
    pub parameters: Vec<JsonValue>,
    /// Gateway kind that serves this connection.
    #[serde(default = "default_connection")]
    pub connection: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Operations of `jsonParser`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JsonOperation {
    Parse,
    Stringify,
    Validate,
}

/// Configuration for `jsonParser` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonParserConfig {
    pub operation: JsonOperation,
    /// Dotted path extracted after parsing.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pretty: bool,
}

/// How `aggregator` combines collected values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationType {
    #[default]
    Array,
    Object,
    Sum,
    Average,
    Min,
    Max,
    Count,
    Concat,
    First,
    Last,
}

fn default_true() -> bool {
    true
}

/// Configuration for `aggregator` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    #[serde(default)]
    pub aggregation_type: AggregationType,
    #[serde(default = "default_true")]
    pub wait_for_all: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub partial_results: bool,
    /// Dotted path plucked from each value before combining.
    #[serde(default)]
    pub field: Option<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            aggregation_type: AggregationType::default(),
            wait_for_all: true,
            timeout_ms: None,
            partial_results: false,
            field: None,
        }
    }
}

/// Value kinds produced by `randomizer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RandomType {
    Number,
    Integer,
    Boolean,
    Choice,
    Shuffle,
    String,
}

/// Configuration for `randomizer` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomizerConfig {
    pub random_type: RandomType,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub choices: Vec<JsonValue>,
    #[serde(default)]
    pub length: Option<usize>,
    /// Fixed seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Check families of `validator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationType {
    Schema,
    Regex,
    Custom,
}

/// One custom validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Expression that must be truthy for the input to pass.
    pub expression: String,
    /// Message reported when the rule fails.
    pub message: String,
}

/// Configuration for `validator` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
    pub validation_type: ValidationType,
    #[serde(default)]
    pub schema: Option<JsonValue>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

/// Waiting strategies of `delay`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayMode {
    #[default]
    Fixed,
    Random,
    Exponential,
    Until,
}

/// Configuration for `delay` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    #[serde(default)]
    pub mode: DelayMode,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub min_ms: Option<u64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    #[serde(default)]
    pub base_ms: Option<u64>,
    #[serde(default)]
    pub factor: Option<f64>,
    /// Polled expression for `until` mode.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Delay growth between retries of `errorHandler`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
}

/// Configuration for `errorHandler` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlerConfig {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Kinds this handler catches; empty catches every kind.
    #[serde(default)]
    pub error_types: Vec<ErrorKind>,
    /// Restricts protection to these nodes.
    #[serde(default)]
    pub scope: Vec<NodeId>,
    #[serde(default)]
    pub fallback_value: Option<JsonValue>,
}

impl ErrorHandlerConfig {
    /// Returns true if this handler catches failures of the given kind.
    #[must_use]
    pub fn catches(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::Cancelled && (self.error_types.is_empty() || self.error_types.contains(&kind))
    }

    /// Delay before retry number `attempt` (1-based), in milliseconds.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> u64 {
        let base = self.retry_delay_ms;
        let delay = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            }
            Backoff::Fibonacci => base.saturating_mul(fibonacci(attempt)),
        };
        self.max_delay_ms.map_or(delay, |cap| delay.min(cap))
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}

/// Configuration for `output` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Result-set key; defaults to the node id.
    #[serde(default)]
    pub key: Option<String>,
    /// Value template; defaults to the node input.
    #[serde(default)]
    pub value: Option<JsonValue>,
}

/// Type-specific node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "camelCase")]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Agent(AgentConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    Parallel(ParallelConfig),
    Merge(MergeConfig),
    Transform(TransformConfig),
    Variable(VariableConfig),
    Calculator(CalculatorConfig),
    Filter(FilterConfig),
    Database(DatabaseConfig),
    JsonParser(JsonParserConfig),
    Aggregator(AggregatorConfig),
    Randomizer(RandomizerConfig),
    Validator(ValidatorConfig),
    Delay(DelayConfig),
    ErrorHandler(ErrorHandlerConfig),
    Output(OutputConfig),
}

impl NodeConfig {
    /// Deserializes a raw config object into the typed config of `node_type`.
    ///
    /// # Errors
    ///
    /// Returns a message when the object does not fit the type's schema or
    /// breaks a mode-specific requirement.
    pub fn from_raw(node_type: NodeType, raw: JsonValue) -> Result<Self, String> {
        fn typed<T: for<'de> Deserialize<'de>>(raw: JsonValue) -> Result<T, String> {
            serde_json::from_value(raw).map_err(|e| e.to_string())
        }

        let config = match node_type {
            NodeType::Trigger => Self::Trigger(typed(raw)?),
            NodeType::Agent => Self::Agent(typed(raw)?),
            NodeType::Condition => Self::Condition(typed(raw)?),
            NodeType::Loop => Self::Loop(typed(raw)?),
            NodeType::Parallel => Self::Parallel(typed(raw)?),
            NodeType::Merge => Self::Merge(typed(raw)?),
            NodeType::Transform => Self::Transform(typed(raw)?),
            NodeType::Variable => Self::Variable(typed(raw)?),
            NodeType::Calculator => Self::Calculator(typed(raw)?),
            NodeType::Filter => Self::Filter(typed(raw)?),
            NodeType::Database => Self::Database(typed(raw)?),
            NodeType::JsonParser => Self::JsonParser(typed(raw)?),
            NodeType::Aggregator => Self::Aggregator(typed(raw)?),
            NodeType::Randomizer => Self::Randomizer(typed(raw)?),
            NodeType::Validator => Self::Validator(typed(raw)?),
            NodeType::Delay => Self::Delay(typed(raw)?),
            NodeType::ErrorHandler => Self::ErrorHandler(typed(raw)?),
            NodeType::Output => Self::Output(typed(raw)?),
        };
        config.check()?;
        Ok(config)
    }

    /// Returns the node type of this configuration.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Trigger(_) => NodeType::Trigger,
            Self::Agent(_) => NodeType::Agent,
            Self::Condition(_) => NodeType::Condition,
            Self::Loop(_) => NodeType::Loop,
            Self::Parallel(_) => NodeType::Parallel,
            Self::Merge(_) => NodeType::Merge,
            Self::Transform(_) => NodeType::Transform,
            Self::Variable(_) => NodeType::Variable,
            Self::Calculator(_) => NodeType::Calculator,
            Self::Filter(_) => NodeType::Filter,
            Self::Database(_) => NodeType::Database,
            Self::JsonParser(_) => NodeType::JsonParser,
            Self::Aggregator(_) => NodeType::Aggregator,
            Self::Randomizer(_) => NodeType::Randomizer,
            Self::Validator(_) => NodeType::Validator,
            Self::Delay(_) => NodeType::Delay,
            Self::ErrorHandler(_) => NodeType::ErrorHandler,
            Self::Output(_) => NodeType::Output,
        }
    }

    /// Mode-specific requirements serde cannot express.
    fn check(&self) -> Result<(), String> {
        match self {
            Self::Loop(config) => match config.mode {
                LoopMode::ForEach if config.items.is_none() => {
                    Err("forEach loops require 'items'".to_string())
                }
                LoopMode::Count if config.count.is_none() => {
                    Err("count loops require 'count'".to_string())
                }
                LoopMode::While if config.condition.is_none() => {
                    Err("while loops require 'condition'".to_string())
                }
                _ => Ok(()),
            },
            Self::Transform(config) => {
                let needs_expression = matches!(
                    config.operation,
                    TransformOperation::Map
                        | TransformOperation::Filter
                        | TransformOperation::Reduce
                        | TransformOperation::Group
                );
                if needs_expression && config.expression.is_none() {
                    return Err(format!(
                        "transform operation {:?} requires 'expression'",
                        config.operation
                    ));
                }
                Ok(())
            }
            Self::Randomizer(config) => {
                if config.random_type == RandomType::Choice && config.choices.is_empty() {
                    return Err("choice randomizer requires non-empty 'choices'".to_string());
                }
                if let (Some(min), Some(max)) = (config.min, config.max)
                    && min > max
                {
                    return Err(format!("min {min} is greater than max {max}"));
                }
                Ok(())
            }
            Self::Validator(config) => match config.validation_type {
                ValidationType::Schema if config.schema.is_none() => {
                    Err("schema validation requires 'schema'".to_string())
                }
                ValidationType::Regex => {
                    let pattern = config
                        .pattern
                        .as_deref()
                        .ok_or_else(|| "regex validation requires 'pattern'".to_string())?;
                    regex::Regex::new(pattern).map_err(|e| e.to_string())?;
                    Ok(())
                }
                ValidationType::Custom if config.rules.is_empty() => {
                    Err("custom validation requires at least one rule".to_string())
                }
                _ => Ok(()),
            },
            Self::Delay(config) => {
                if config.mode == DelayMode::Until && config.condition.is_none() {
                    return Err("until delays require 'condition'".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: NodeId,
    /// Human-readable name.
    pub name: String,
    /// Node-specific configuration.
    pub config: NodeConfig,
    /// Input ports, in declaration order.
    pub inputs: Vec<InputPort>,
    /// Output ports, in declaration order.
    pub outputs: Vec<OutputPort>,
}

impl Node {
    /// Creates a node with the type's default ports.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Self {
        let id = id.into();
        let contract = crate::registry::contract(config.node_type());
        Self {
            name: id.to_string(),
            id,
            inputs: contract.default_inputs(),
            outputs: contract.default_outputs(),
            config,
        }
    }

    /// Sets a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the input ports (dynamic-port types only).
    #[must_use]
    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(InputPort::optional).collect();
        self
    }

    /// Replaces the output ports (dynamic-port types only).
    #[must_use]
    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(OutputPort::new).collect();
        self
    }

    /// Returns the node type.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }

    /// Gets an input port by name.
    #[must_use]
    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Gets an output port by name.
    #[must_use]
    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Position of an input port, used to order inputs deterministically.
    #[must_use]
    pub fn input_position(&self, name: &str) -> usize {
        self.inputs
            .iter()
            .position(|p| p.name == name)
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_config_from_raw() {
        let config = NodeConfig::from_raw(
            NodeType::Agent,
            json!({ "agentKind": "claude", "task": "summarize {{input}}" }),
        )
        .expect("valid config");

        let NodeConfig::Agent(agent) = config else {
            panic!("expected agent config");
        };
        assert_eq!(agent.agent_kind, "claude");
        assert_eq!(agent.timeout_ms, None);
    }

    #[test]
    fn loop_mode_requirements() {
        let err = NodeConfig::from_raw(NodeType::Loop, json!({ "mode": "count" })).unwrap_err();
        assert!(err.contains("count"));

        let config = NodeConfig::from_raw(
            NodeType::Loop,
            json!({ "items": [1, 2, 3], "parallelExecution": true }),
        )
        .expect("valid loop");
        let NodeConfig::Loop(loop_config) = config else {
            panic!("expected loop config");
        };
        assert_eq!(loop_config.mode, LoopMode::ForEach);
        assert!(loop_config.parallel_execution);
    }

    #[test]
    fn regex_validator_rejects_bad_pattern() {
        let err = NodeConfig::from_raw(
            NodeType::Validator,
            json!({ "validationType": "regex", "pattern": "(" }),
        )
        .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn aggregator_waits_for_all_by_default() {
        let config = NodeConfig::from_raw(NodeType::Aggregator, json!({})).expect("valid");
        let NodeConfig::Aggregator(aggregator) = config else {
            panic!("expected aggregator config");
        };
        assert!(aggregator.wait_for_all);
        assert_eq!(aggregator.aggregation_type, AggregationType::Array);
    }

    #[test]
    fn error_handler_catches_matching_kinds() {
        let config = ErrorHandlerConfig {
            error_types: vec![ErrorKind::ExecutorError],
            ..Default::default()
        };
        assert!(config.catches(ErrorKind::ExecutorError));
        assert!(!config.catches(ErrorKind::EvalError));
        assert!(!ErrorHandlerConfig::default().catches(ErrorKind::Cancelled));
    }

    #[test]
    fn retry_delay_backoff() {
        let mut config = ErrorHandlerConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(3), 100);

        config.backoff = Backoff::Linear;
        assert_eq!(config.retry_delay(3), 300);

        config.backoff = Backoff::Exponential;
        assert_eq!(config.retry_delay(1), 100);
        assert_eq!(config.retry_delay(3), 400);

        config.backoff = Backoff::Fibonacci;
        assert_eq!(config.retry_delay(5), 500);

        config.max_delay_ms = Some(250);
        assert_eq!(config.retry_delay(5), 250);
    }

    #[test]
    fn node_gets_contract_ports() {
        let node = Node::new(
            "cond",
            NodeConfig::Condition(ConditionConfig {
                expression: "input > 1".to_string(),
            }),
        );
        assert!(node.output_port("true").is_some());
        assert!(node.output_port("false").is_some());
        assert!(node.input_port("input").is_some());
        assert_eq!(node.node_type(), NodeType::Condition);
    }

    #[test]
    fn node_config_serializes_adjacently_tagged() {
        let config = NodeConfig::JsonParser(JsonParserConfig {
            operation: JsonOperation::Parse,
            path: None,
            pretty: false,
        });
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["type"], "jsonParser");
        assert_eq!(json["config"]["operation"], "parse");
    }
}
