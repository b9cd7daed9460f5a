//! Per-type behavior of inline nodes.
//!
//! Everything here is synchronous and side-effect free apart from the
//! returned scope. Gateway calls, timers, loops and join barriers live in
//! the interpreter.

use crate::error::ErrorKind;
use crate::expression::{
    self, EvalError, Expression, compare, evaluate_value, is_truthy, lookup_path, number_value,
    render,
};
use crate::node::{
    AggregationType, AggregatorConfig, CalculatorConfig, CalculatorOperation, DelayConfig,
    DelayMode, FilterConfig, JsonOperation, JsonParserConfig, MergeConfig, MergeMode, Node,
    NodeConfig, RandomType, RandomizerConfig, SortOrder, TransformConfig, TransformOperation,
    ValidationType, ValidatorConfig, VariableConfig, VariableOperation,
};
use crate::scope::{EvalContext, Scope};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value as JsonValue, json};
use std::cmp::Ordering;
use std::fmt;

/// A node-local failure before it is attributed to a node instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EvalError, message)
    }
}

impl From<EvalError> for Failure {
    fn from(err: EvalError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a node produced.
#[derive(Debug, Clone)]
pub struct Emission {
    /// The node's recorded output.
    pub value: JsonValue,
    /// Values emitted per output port; ports not listed are skipped.
    pub ports: Vec<(String, JsonValue)>,
    /// Replacement scope after variable writes.
    pub scope: Option<Scope>,
}

impl Emission {
    /// Emits `value` on a single port.
    #[must_use]
    pub fn on(port: &str, value: JsonValue) -> Self {
        Self {
            ports: vec![(port.to_string(), value.clone())],
            value,
            scope: None,
        }
    }
}

/// Runs an inline node.
///
/// `wired` reports whether an output port has outgoing edges.
///
/// # Errors
///
/// Returns a `Failure` for evaluation errors and for node types that are
/// not inline.
pub fn run_inline(
    node: &Node,
    input: &JsonValue,
    scope: &Scope,
    wired: &dyn Fn(&str) -> bool,
) -> Result<Emission, Failure> {
    let ctx = EvalContext::new(scope, Some(input));
    match &node.config {
        NodeConfig::Trigger(_) => Ok(Emission::on("output", input.clone())),
        NodeConfig::Condition(config) => {
            let port = if Expression::parse(&config.expression)?.test(&ctx)? {
                "true"
            } else {
                "false"
            };
            Ok(Emission::on(port, input.clone()))
        }
        NodeConfig::Parallel(_) => Ok(Emission {
            value: input.clone(),
            ports: node
                .outputs
                .iter()
                .map(|port| (port.name.clone(), input.clone()))
                .collect(),
            scope: None,
        }),
        NodeConfig::Transform(config) => transform(config, input, scope).map(|value| Emission::on("output", value)),
        NodeConfig::Variable(config) => variable(config, input, scope),
        NodeConfig::Calculator(config) => {
            calculate(config, input, &ctx).map(|value| Emission::on("output", value))
        }
        NodeConfig::Filter(config) => filter(config, input, scope),
        NodeConfig::JsonParser(config) => json_parser(config, input, wired),
        NodeConfig::Randomizer(config) => {
            randomize(config, input, scope.iteration()).map(|value| Emission::on("output", value))
        }
        NodeConfig::Validator(config) => validate(config, input, &ctx),
        NodeConfig::ErrorHandler(_) => Ok(Emission::on("try", input.clone())),
        NodeConfig::Output(config) => {
            let value = match &config.value {
                Some(template) => evaluate_value(template, &ctx)?,
                None => input.clone(),
            };
            Ok(Emission {
                value,
                ports: Vec::new(),
                scope: None,
            })
        }
        other => Err(Failure::new(
            ErrorKind::UnknownNodeType,
            format!("{} nodes are not dispatched inline", other.node_type()),
        )),
    }
}

fn as_array<'v>(value: &'v JsonValue, what: &str) -> Result<&'v Vec<JsonValue>, Failure> {
    value
        .as_array()
        .ok_or_else(|| Failure::mismatch(format!("{what} expects an array input, got {value}")))
}

fn transform(config: &TransformConfig, input: &JsonValue, scope: &Scope) -> Result<JsonValue, Failure> {
    let expression = config
        .expression
        .as_deref()
        .map(Expression::parse)
        .transpose()?;
    let mut ctx = EvalContext::new(scope, Some(input));
    let mut per_item = |item: &JsonValue, index: usize| -> Result<JsonValue, Failure> {
        let Some(expression) = &expression else {
            return Ok(item.clone());
        };
        ctx.set_local("item", item.clone());
        ctx.set_local("index", JsonValue::from(index));
        Ok(expression.evaluate(&ctx)?)
    };

    match config.operation {
        TransformOperation::Map => {
            let items = as_array(input, "map")?;
            items
                .iter()
                .enumerate()
                .map(|(i, item)| per_item(item, i))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array)
        }
        TransformOperation::Filter => {
            let mut kept = Vec::new();
            for (i, item) in as_array(input, "filter")?.iter().enumerate() {
                if is_truthy(&per_item(item, i)?) {
                    kept.push(item.clone());
                }
            }
            Ok(JsonValue::Array(kept))
        }
        TransformOperation::Reduce => {
            let items = as_array(input, "reduce")?;
            let Some(expression) = &expression else {
                return Err(Failure::mismatch("reduce requires an expression"));
            };
            let mut ctx = EvalContext::new(scope, Some(input));
            let mut acc = config.initial_value.clone().unwrap_or(JsonValue::Null);
            for (i, item) in items.iter().enumerate() {
                ctx.set_local("acc", acc);
                ctx.set_local("item", item.clone());
                ctx.set_local("index", JsonValue::from(i));
                acc = expression.evaluate(&ctx)?;
            }
            Ok(acc)
        }
        TransformOperation::Sort => {
            let items = as_array(input, "sort")?;
            let keys = items
                .iter()
                .enumerate()
                .map(|(i, item)| per_item(item, i))
                .collect::<Result<Vec<_>, _>>()?;
            let mut indices: Vec<usize> = (0..items.len()).collect();
            let mut failure = None;
            indices.sort_by(|&a, &b| match compare(&keys[a], &keys[b]) {
                Ok(ordering) if config.order == SortOrder::Desc => ordering.reverse(),
                Ok(ordering) => ordering,
                Err(err) => {
                    failure.get_or_insert(err);
                    Ordering::Equal
                }
            });
            if let Some(err) = failure {
                return Err(err.into());
            }
            Ok(JsonValue::Array(
                indices.into_iter().map(|i| items[i].clone()).collect(),
            ))
        }
        TransformOperation::Group => {
            let mut groups: Map<String, JsonValue> = Map::new();
            for (i, item) in as_array(input, "group")?.iter().enumerate() {
                let key = render(&per_item(item, i)?);
                match groups
                    .entry(key)
                    .or_insert_with(|| JsonValue::Array(Vec::new()))
                {
                    JsonValue::Array(members) => members.push(item.clone()),
                    _ => unreachable!("group entries are arrays"),
                }
            }
            Ok(JsonValue::Object(groups))
        }
        TransformOperation::Flatten => {
            let depth = config.depth.unwrap_or(1);
            Ok(JsonValue::Array(flatten(as_array(input, "flatten")?, depth)))
        }
        TransformOperation::Merge => match input {
            JsonValue::Object(_) => Ok(input.clone()),
            JsonValue::Array(items) => {
                let mut merged = Map::new();
                for item in items {
                    let JsonValue::Object(fields) = item else {
                        return Err(Failure::mismatch(format!(
                            "merge expects objects, got {item}"
                        )));
                    };
                    merged.extend(fields.clone());
                }
                Ok(JsonValue::Object(merged))
            }
            other => Err(Failure::mismatch(format!(
                "merge expects an array of objects, got {other}"
            ))),
        },
    }
}

fn flatten(items: &[JsonValue], depth: u32) -> Vec<JsonValue> {
    let mut flat = Vec::new();
    for item in items {
        match item {
            JsonValue::Array(inner) if depth > 0 => flat.extend(flatten(inner, depth - 1)),
            other => flat.push(other.clone()),
        }
    }
    flat
}

fn variable(config: &VariableConfig, input: &JsonValue, scope: &Scope) -> Result<Emission, Failure> {
    let ctx = EvalContext::new(scope, Some(input));
    let configured = |ctx: &EvalContext<'_>| -> Result<JsonValue, Failure> {
        match &config.value {
            Some(template) => Ok(evaluate_value(template, ctx)?),
            None => Ok(input.clone()),
        }
    };
    let name = config.name.as_str();

    let (value, scope) = match config.operation {
        VariableOperation::Get => {
            let value = scope.get(name).cloned().ok_or_else(|| EvalError::UndefinedReference {
                path: name.to_string(),
            })?;
            (value, None)
        }
        VariableOperation::Set => {
            let value = configured(&ctx)?;
            (value.clone(), Some(scope.set(name, value)))
        }
        VariableOperation::Increment => {
            let current = scope.get(name).cloned().unwrap_or(JsonValue::from(0));
            let amount = match &config.amount {
                Some(amount) => evaluate_value(amount, &ctx)?,
                None => JsonValue::from(1),
            };
            let (Some(a), Some(b)) = (current.as_f64(), amount.as_f64()) else {
                return Err(Failure::mismatch(format!(
                    "cannot increment {current} by {amount}"
                )));
            };
            let value = number_value(a + b)?;
            (value.clone(), Some(scope.set(name, value)))
        }
        VariableOperation::Append => {
            let mut items = match scope.get(name) {
                None => Vec::new(),
                Some(JsonValue::Array(items)) => items.clone(),
                Some(other) => {
                    return Err(Failure::mismatch(format!(
                        "cannot append to non-array variable {name} = {other}"
                    )));
                }
            };
            items.push(configured(&ctx)?);
            let value = JsonValue::Array(items);
            (value.clone(), Some(scope.set(name, value)))
        }
        VariableOperation::Delete => (input.clone(), Some(scope.remove(name))),
    };

    Ok(Emission {
        ports: vec![("output".to_string(), value.clone())],
        value,
        scope,
    })
}

fn as_number(value: &JsonValue) -> Result<f64, Failure> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Failure::mismatch(format!("{value} is not a number")))
}

fn calculate(
    config: &CalculatorConfig,
    input: &JsonValue,
    ctx: &EvalContext<'_>,
) -> Result<JsonValue, Failure> {
    let operands: Vec<JsonValue> = match &config.operands {
        Some(operands) => {
            let evaluated = operands
                .iter()
                .map(|operand| evaluate_value(operand, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            match evaluated.as_slice() {
                [JsonValue::Array(items)] => items.clone(),
                _ => evaluated,
            }
        }
        None => match input {
            JsonValue::Array(items) => items.clone(),
            other => vec![other.clone()],
        },
    };

    if config.operation == CalculatorOperation::Count {
        return Ok(JsonValue::from(operands.len()));
    }
    let numbers = operands
        .iter()
        .map(as_number)
        .collect::<Result<Vec<f64>, _>>()?;
    let Some((&first, rest)) = numbers.split_first() else {
        return Err(Failure::mismatch(format!(
            "{:?} requires at least one operand",
            config.operation
        )));
    };

    let result = match config.operation {
        CalculatorOperation::Add | CalculatorOperation::Sum => numbers.iter().sum(),
        CalculatorOperation::Subtract => rest.iter().fold(first, |acc, n| acc - n),
        CalculatorOperation::Multiply => numbers.iter().product(),
        CalculatorOperation::Divide | CalculatorOperation::Modulo => {
            let mut acc = first;
            for &n in rest {
                if n == 0.0 {
                    return Err(EvalError::DivisionByZero.into());
                }
                acc = if config.operation == CalculatorOperation::Divide {
                    acc / n
                } else {
                    acc % n
                };
            }
            acc
        }
        CalculatorOperation::Power => rest.iter().fold(first, |acc, &n| acc.powf(n)),
        CalculatorOperation::Average => numbers.iter().sum::<f64>() / numbers.len() as f64,
        CalculatorOperation::Min => numbers.iter().copied().fold(first, f64::min),
        CalculatorOperation::Max => numbers.iter().copied().fold(first, f64::max),
        CalculatorOperation::Round => {
            let scale = 10f64.powi(i32::try_from(config.precision.unwrap_or(0)).unwrap_or(0));
            (first * scale).round() / scale
        }
        CalculatorOperation::Abs => first.abs(),
        CalculatorOperation::Count => numbers.len() as f64,
    };
    Ok(number_value(result)?)
}

fn filter(config: &FilterConfig, input: &JsonValue, scope: &Scope) -> Result<Emission, Failure> {
    let predicate = Expression::parse(&config.expression)?;
    let mut ctx = EvalContext::new(scope, Some(input));
    let (mut kept, mut rejected) = (Vec::new(), Vec::new());
    for (i, item) in as_array(input, "filter")?.iter().enumerate() {
        ctx.set_local("item", item.clone());
        ctx.set_local("index", JsonValue::from(i));
        if predicate.test(&ctx)? {
            kept.push(item.clone());
        } else {
            rejected.push(item.clone());
        }
    }
    let (kept, rejected) = (JsonValue::Array(kept), JsonValue::Array(rejected));
    Ok(Emission {
        value: json!({ "filtered": kept, "rejected": rejected }),
        ports: vec![
            ("filtered".to_string(), kept),
            ("rejected".to_string(), rejected),
        ],
        scope: None,
    })
}

fn json_parser(
    config: &JsonParserConfig,
    input: &JsonValue,
    wired: &dyn Fn(&str) -> bool,
) -> Result<Emission, Failure> {
    let malformed = |message: String| -> Result<Emission, Failure> {
        if wired("error") {
            Ok(Emission::on(
                "error",
                json!({ "message": message, "input": input }),
            ))
        } else {
            Err(Failure::new(ErrorKind::EvalError, message))
        }
    };

    match config.operation {
        JsonOperation::Parse => {
            let parsed = match input {
                JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text) {
                    Ok(parsed) => parsed,
                    Err(err) => return malformed(format!("malformed JSON: {err}")),
                },
                other => other.clone(),
            };
            match config.path.as_deref() {
                Some(path) => match lookup_path(&parsed, path) {
                    Some(found) => Ok(Emission::on("output", found.clone())),
                    None => malformed(format!("path '{path}' not found")),
                },
                None => Ok(Emission::on("output", parsed)),
            }
        }
        JsonOperation::Stringify => {
            let text = if config.pretty {
                serde_json::to_string_pretty(input)
            } else {
                serde_json::to_string(input)
            }
            .map_err(|e| Failure::mismatch(e.to_string()))?;
            Ok(Emission::on("output", JsonValue::String(text)))
        }
        JsonOperation::Validate => match input {
            JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text) {
                Ok(_) => Ok(Emission::on("output", input.clone())),
                Err(err) => malformed(format!("malformed JSON: {err}")),
            },
            other => Ok(Emission::on("output", other.clone())),
        },
    }
}

/// Seeds a generator: fixed seeds are offset by the loop iteration so each
/// iteration draws a different but reproducible value.
pub fn rng_for(seed: Option<u64>, iteration: Option<u32>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(iteration.unwrap_or(0)))),
        None => StdRng::from_entropy(),
    }
}

fn randomize(
    config: &RandomizerConfig,
    input: &JsonValue,
    iteration: Option<u32>,
) -> Result<JsonValue, Failure> {
    let mut rng = rng_for(config.seed, iteration);
    match config.random_type {
        RandomType::Number => {
            let (min, max) = (config.min.unwrap_or(0.0), config.max.unwrap_or(1.0));
            if !(max - min).is_finite() {
                return Err(Failure::mismatch(format!(
                    "range from {min} to {max} is too wide to sample"
                )));
            }
            let value = if min < max { rng.gen_range(min..max) } else { min };
            Ok(number_value(value)?)
        }
        RandomType::Integer => {
            let min = config.min.unwrap_or(0.0).ceil() as i64;
            let max = config.max.unwrap_or(100.0).floor() as i64;
            if min > max {
                return Err(Failure::mismatch(format!("no integer between {min} and {max}")));
            }
            Ok(JsonValue::from(rng.gen_range(min..=max)))
        }
        RandomType::Boolean => Ok(JsonValue::Bool(rng.gen_bool(0.5))),
        RandomType::Choice => config
            .choices
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| Failure::mismatch("choice requires non-empty choices")),
        RandomType::Shuffle => {
            let mut items = match input {
                JsonValue::Array(items) => items.clone(),
                _ => config.choices.clone(),
            };
            items.shuffle(&mut rng);
            Ok(JsonValue::Array(items))
        }
        RandomType::String => {
            let length = config.length.unwrap_or(8);
            let text: String = (&mut rng)
                .sample_iter(rand::distributions::Alphanumeric)
                .take(length)
                .map(char::from)
                .collect();
            Ok(JsonValue::String(text))
        }
    }
}

fn validate(
    config: &ValidatorConfig,
    input: &JsonValue,
    ctx: &EvalContext<'_>,
) -> Result<Emission, Failure> {
    let mut errors = Vec::new();
    match config.validation_type {
        ValidationType::Schema => {
            if let Some(schema) = &config.schema {
                check_schema(schema, input, "$", &mut errors);
            }
        }
        ValidationType::Regex => {
            let pattern = config.pattern.as_deref().unwrap_or_default();
            let regex = regex::Regex::new(pattern).map_err(|e| Failure::mismatch(e.to_string()))?;
            match input.as_str() {
                Some(text) if regex.is_match(text) => {}
                Some(_) => errors.push(format!("input does not match /{pattern}/")),
                None => errors.push("input is not a string".to_string()),
            }
        }
        ValidationType::Custom => {
            for rule in &config.rules {
                if !Expression::parse(&rule.expression)?.test(ctx)? {
                    errors.push(rule.message.clone());
                }
            }
        }
    }

    if errors.is_empty() {
        return Ok(Emission {
            value: json!({ "valid": true, "errors": [] }),
            ports: vec![("valid".to_string(), input.clone())],
            scope: None,
        });
    }
    let errors = JsonValue::from(errors);
    Ok(Emission {
        value: json!({ "valid": false, "errors": errors }),
        ports: vec![
            ("invalid".to_string(), input.clone()),
            ("errors".to_string(), errors),
        ],
        scope: None,
    })
}

fn type_matches(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Checks a value against a JSON Schema subset: `type`, `required`,
/// `properties`, `items`, `enum`, `minimum`, `maximum`, `minLength`,
/// `maxLength`, `pattern`, `minItems`, `maxItems`.
fn check_schema(schema: &JsonValue, value: &JsonValue, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            JsonValue::String(name) => vec![name.as_str()],
            JsonValue::Array(names) => names.iter().filter_map(JsonValue::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|name| type_matches(name, value)) {
            errors.push(format!("{path}: expected {}", allowed.join(" or ")));
            return;
        }
    }
    if let Some(options) = schema.get("enum").and_then(JsonValue::as_array)
        && !options.iter().any(|option| expression::loose_eq(option, value))
    {
        errors.push(format!("{path}: value is not one of the allowed values"));
    }
    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(JsonValue::as_f64)
            && n < min
        {
            errors.push(format!("{path}: {n} is less than {min}"));
        }
        if let Some(max) = schema.get("maximum").and_then(JsonValue::as_f64)
            && n > max
        {
            errors.push(format!("{path}: {n} is greater than {max}"));
        }
    }
    if let Some(text) = value.as_str() {
        let length = text.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(JsonValue::as_u64)
            && length < min
        {
            errors.push(format!("{path}: shorter than {min} characters"));
        }
        if let Some(max) = schema.get("maxLength").and_then(JsonValue::as_u64)
            && length > max
        {
            errors.push(format!("{path}: longer than {max} characters"));
        }
        if let Some(pattern) = schema.get("pattern").and_then(JsonValue::as_str) {
            match regex::Regex::new(pattern) {
                Ok(regex) if !regex.is_match(text) => {
                    errors.push(format!("{path}: does not match /{pattern}/"));
                }
                Ok(_) => {}
                Err(err) => errors.push(format!("{path}: invalid pattern: {err}")),
            }
        }
    }
    if let Some(items) = value.as_array() {
        let count = items.len() as u64;
        if let Some(min) = schema.get("minItems").and_then(JsonValue::as_u64)
            && count < min
        {
            errors.push(format!("{path}: fewer than {min} items"));
        }
        if let Some(max) = schema.get("maxItems").and_then(JsonValue::as_u64)
            && count > max
        {
            errors.push(format!("{path}: more than {max} items"));
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                check_schema(item_schema, item, &format!("{path}[{i}]"), errors);
            }
        }
    }
    if let Some(fields) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
            for name in required.iter().filter_map(JsonValue::as_str) {
                if !fields.contains_key(name) {
                    errors.push(format!("{path}.{name}: is required"));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) {
            for (name, property) in properties {
                if let Some(field) = fields.get(name) {
                    check_schema(property, field, &format!("{path}.{name}"), errors);
                }
            }
        }
    }
}

/// A port's arrivals as one value: the value itself for a single arrival,
/// else an array.
fn port_value(values: &[JsonValue]) -> JsonValue {
    match values {
        [single] => single.clone(),
        many => JsonValue::Array(many.to_vec()),
    }
}

/// Combines the values that reached a `merge` node, in port order.
#[must_use]
pub fn combine_merge(config: &MergeConfig, ports: &[(String, Vec<JsonValue>)]) -> JsonValue {
    match config.mode {
        MergeMode::Array => JsonValue::Array(ports.iter().map(|(_, v)| port_value(v)).collect()),
        MergeMode::Object => JsonValue::Object(
            ports
                .iter()
                .map(|(port, v)| (port.clone(), port_value(v)))
                .collect(),
        ),
        MergeMode::Concat => {
            let mut all = Vec::new();
            for value in ports.iter().flat_map(|(_, v)| v) {
                match value {
                    JsonValue::Array(items) => all.extend(items.iter().cloned()),
                    other => all.push(other.clone()),
                }
            }
            JsonValue::Array(all)
        }
        MergeMode::First => ports
            .first()
            .map_or(JsonValue::Null, |(_, v)| port_value(v)),
    }
}

/// Combines the values that reached an `aggregator` node.
///
/// # Errors
///
/// Returns an `EvalError` failure when a numeric aggregation meets a
/// non-number.
pub fn combine_aggregate(
    config: &AggregatorConfig,
    ports: &[(String, Vec<JsonValue>)],
) -> Result<JsonValue, Failure> {
    let pluck = |value: &JsonValue| -> Option<JsonValue> {
        match config.field.as_deref() {
            Some(field) => lookup_path(value, field).cloned(),
            None => Some(value.clone()),
        }
    };
    let values: Vec<JsonValue> = ports
        .iter()
        .flat_map(|(_, v)| v.iter())
        .filter_map(pluck)
        .collect();
    let numbers = || values.iter().map(as_number).collect::<Result<Vec<f64>, _>>();

    let combined = match config.aggregation_type {
        AggregationType::Array => JsonValue::Array(values),
        AggregationType::Object => JsonValue::Object(
            ports
                .iter()
                .map(|(port, v)| {
                    let plucked: Vec<JsonValue> = v.iter().filter_map(pluck).collect();
                    (port.clone(), port_value(&plucked))
                })
                .collect(),
        ),
        AggregationType::Sum => number_value(numbers()?.iter().sum())?,
        AggregationType::Average => {
            let numbers = numbers()?;
            if numbers.is_empty() {
                JsonValue::Null
            } else {
                number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)?
            }
        }
        AggregationType::Min => match numbers()?.into_iter().reduce(f64::min) {
            Some(min) => number_value(min)?,
            None => JsonValue::Null,
        },
        AggregationType::Max => match numbers()?.into_iter().reduce(f64::max) {
            Some(max) => number_value(max)?,
            None => JsonValue::Null,
        },
        AggregationType::Count => JsonValue::from(values.len()),
        AggregationType::Concat => {
            if values.iter().all(JsonValue::is_string) {
                JsonValue::String(values.iter().map(render).collect())
            } else {
                JsonValue::Array(flatten(&values, 1))
            }
        }
        AggregationType::First => values.first().cloned().unwrap_or(JsonValue::Null),
        AggregationType::Last => values.last().cloned().unwrap_or(JsonValue::Null),
    };
    Ok(combined)
}

/// Wait time of a non-polling `delay` node in milliseconds, capped at
/// `cap_ms`.
#[must_use]
pub fn delay_ms(config: &DelayConfig, iteration: Option<u32>, cap_ms: u64) -> u64 {
    let wait = match config.mode {
        DelayMode::Fixed => config.duration_ms.unwrap_or(0),
        DelayMode::Random => {
            let min = config.min_ms.unwrap_or(0);
            let max = config.max_ms.unwrap_or(min).max(min);
            rng_for(config.seed, iteration).gen_range(min..=max)
        }
        DelayMode::Exponential => {
            let base = config.base_ms.unwrap_or(100) as f64;
            let factor = config.factor.unwrap_or(2.0);
            let exponent = i32::try_from(iteration.unwrap_or(0)).unwrap_or(i32::MAX);
            let wait = base * factor.powi(exponent);
            if wait.is_finite() && wait < cap_ms as f64 {
                wait.max(0.0) as u64
            } else {
                cap_ms
            }
        }
        DelayMode::Until => 0,
    };
    wait.min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ConditionConfig, ValidationRule};
    use crate::testing::node_with;

    fn scope() -> Scope {
        Scope::root(&json!({ "threshold": 2 }))
    }

    fn never_wired(_: &str) -> bool {
        false
    }

    fn run(config: JsonValue, node_type: &str, input: JsonValue) -> Result<Emission, Failure> {
        let node = node_with("n", node_type, config);
        run_inline(&node, &input, &scope(), &never_wired)
    }

    fn ports(emission: &Emission) -> Vec<&str> {
        emission.ports.iter().map(|(p, _)| p.as_str()).collect()
    }

    #[test]
    fn condition_picks_exactly_one_port() {
        let node = Node::new(
            "c",
            NodeConfig::Condition(ConditionConfig {
                expression: "{{input.score}} > threshold".to_string(),
            }),
        );
        let high = run_inline(&node, &json!({ "score": 5 }), &scope(), &never_wired).unwrap();
        assert_eq!(ports(&high), vec!["true"]);
        let low = run_inline(&node, &json!({ "score": 1 }), &scope(), &never_wired).unwrap();
        assert_eq!(ports(&low), vec!["false"]);
        assert_eq!(low.ports[0].1, json!({ "score": 1 }));
    }

    #[test]
    fn condition_with_undefined_reference_fails() {
        let err = run(json!({ "expression": "input.nope > 1" }), "condition", json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedReference);
    }

    #[test]
    fn transform_operations() {
        let input = json!([3, 1, 2]);
        let map = run(json!({ "operation": "map", "expression": "item * 10" }), "transform", input.clone()).unwrap();
        assert_eq!(map.value, json!([30, 10, 20]));

        let filter = run(json!({ "operation": "filter", "expression": "item > 1" }), "transform", input.clone()).unwrap();
        assert_eq!(filter.value, json!([3, 2]));

        let reduce = run(
            json!({ "operation": "reduce", "expression": "acc + item", "initialValue": 0 }),
            "transform",
            input.clone(),
        )
        .unwrap();
        assert_eq!(reduce.value, json!(6));

        let sort = run(json!({ "operation": "sort", "order": "desc" }), "transform", input).unwrap();
        assert_eq!(sort.value, json!([3, 2, 1]));

        let flatten = run(json!({ "operation": "flatten" }), "transform", json!([[1, [2]], 3])).unwrap();
        assert_eq!(flatten.value, json!([1, [2], 3]));

        let group = run(
            json!({ "operation": "group", "expression": "item.kind" }),
            "transform",
            json!([{ "kind": "a", "n": 1 }, { "kind": "b", "n": 2 }, { "kind": "a", "n": 3 }]),
        )
        .unwrap();
        assert_eq!(group.value["a"].as_array().map(Vec::len), Some(2));

        let merge = run(json!({ "operation": "merge" }), "transform", json!([{ "a": 1 }, { "b": 2 }])).unwrap();
        assert_eq!(merge.value, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn transform_rejects_non_array_input() {
        let err = run(json!({ "operation": "map", "expression": "item" }), "transform", json!(5)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvalError);
    }

    #[test]
    fn variable_writes_nearest_frame() {
        let node = node_with("v", "variable", json!({ "operation": "increment", "name": "threshold", "amount": 3 }));
        let inner = scope().push(crate::scope::FrameKind::Loop {
            node: crate::node::NodeId::from("loop1"),
            iteration: 0,
        });
        let emission = run_inline(&node, &json!(null), &inner, &never_wired).unwrap();
        assert_eq!(emission.value, json!(5));
        let updated = emission.scope.expect("scope write");
        assert_eq!(updated.pop().and_then(|s| s.get("threshold").cloned()), Some(json!(5)));
    }

    #[test]
    fn variable_get_undefined_is_unresolved() {
        let err = run(json!({ "operation": "get", "name": "ghost" }), "variable", json!(null)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedReference);
    }

    #[test]
    fn variable_append_builds_array() {
        let node = node_with("v", "variable", json!({ "operation": "append", "name": "seen" }));
        let first = run_inline(&node, &json!("a"), &scope(), &never_wired).unwrap();
        let scope = first.scope.expect("scope");
        let second = run_inline(&node, &json!("b"), &scope, &never_wired).unwrap();
        assert_eq!(second.value, json!(["a", "b"]));
    }

    #[test]
    fn calculator_operations() {
        let calc = |op: &str, operands: JsonValue| {
            run(json!({ "operation": op, "operands": operands }), "calculator", json!(null))
        };
        assert_eq!(calc("add", json!([1, 2, 3])).unwrap().value, json!(6));
        assert_eq!(calc("subtract", json!([10, 4])).unwrap().value, json!(6));
        assert_eq!(calc("divide", json!([7, 2])).unwrap().value, json!(3.5));
        assert_eq!(calc("power", json!([2, 10])).unwrap().value, json!(1024));
        assert_eq!(calc("average", json!([[2, 4]])).unwrap().value, json!(3));
        assert_eq!(calc("count", json!([[1, 2, 3]])).unwrap().value, json!(3));
        assert_eq!(calc("max", json!(["{{threshold}}", 1])).unwrap().value, json!(2));

        let rounded = run(
            json!({ "operation": "round", "operands": [3.14159], "precision": 2 }),
            "calculator",
            json!(null),
        )
        .unwrap();
        assert_eq!(rounded.value, json!(3.14));
    }

    #[test]
    fn calculator_errors_are_eval_errors() {
        let err = run(json!({ "operation": "divide", "operands": [1, 0] }), "calculator", json!(null)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvalError);
        assert!(err.message.contains("division by zero"));

        let err = run(json!({ "operation": "add" }), "calculator", json!([1, "x"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvalError);
    }

    #[test]
    fn filter_partitions_input() {
        let emission = run(json!({ "expression": "item % 2 == 0" }), "filter", json!([1, 2, 3, 4])).unwrap();
        assert_eq!(emission.ports[0], ("filtered".to_string(), json!([2, 4])));
        assert_eq!(emission.ports[1], ("rejected".to_string(), json!([1, 3])));
    }

    #[test]
    fn json_parser_routes_malformed_input() {
        let node = node_with("j", "jsonParser", json!({ "operation": "parse", "path": "a.b" }));
        let ok = run_inline(&node, &json!("{\"a\":{\"b\":7}}"), &scope(), &never_wired).unwrap();
        assert_eq!(ok.ports, vec![("output".to_string(), json!(7))]);

        let wired = |port: &str| port == "error";
        let routed = run_inline(&node, &json!("{oops"), &scope(), &wired).unwrap();
        assert_eq!(ports(&routed), vec!["error"]);

        let err = run_inline(&node, &json!("{oops"), &scope(), &never_wired).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvalError);
    }

    #[test]
    fn json_parser_stringify() {
        let emission = run(json!({ "operation": "stringify" }), "jsonParser", json!({ "a": 1 })).unwrap();
        assert_eq!(emission.value, json!("{\"a\":1}"));
    }

    #[test]
    fn seeded_randomizer_is_reproducible() {
        let config = json!({ "randomType": "integer", "min": 1, "max": 1000, "seed": 42 });
        let a = run(config.clone(), "randomizer", json!(null)).unwrap();
        let b = run(config, "randomizer", json!(null)).unwrap();
        assert_eq!(a.value, b.value);

        let shuffled = run(json!({ "randomType": "shuffle", "seed": 7 }), "randomizer", json!([1, 2, 3, 4, 5])).unwrap();
        let mut sorted: Vec<i64> = shuffled
            .value
            .as_array()
            .unwrap()
            .iter()
            .filter_map(JsonValue::as_i64)
            .collect();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);

        let text = run(json!({ "randomType": "string", "length": 12, "seed": 1 }), "randomizer", json!(null)).unwrap();
        assert_eq!(text.value.as_str().map(str::len), Some(12));
    }

    #[test]
    fn number_range_wider_than_f64_is_rejected() {
        let config = json!({ "randomType": "number", "min": -1e308, "max": 1e308, "seed": 1 });
        let err = run(config, "randomizer", json!(null)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvalError);
        assert!(err.message.contains("too wide"));

        let config = json!({ "randomType": "number", "min": -5, "max": 5, "seed": 1 });
        let value = run(config, "randomizer", json!(null)).unwrap().value;
        assert!(value.as_f64().is_some_and(|n| (-5.0..5.0).contains(&n)));
    }

    #[test]
    fn schema_validator_reports_errors() {
        let schema = json!({
            "type": "object",
            "required": ["name", "age"],
            "properties": {
                "name": { "type": "string", "minLength": 2 },
                "age": { "type": "integer", "minimum": 0 }
            }
        });
        let config = json!({ "validationType": "schema", "schema": schema });

        let valid = run(config.clone(), "validator", json!({ "name": "ada", "age": 36 })).unwrap();
        assert_eq!(ports(&valid), vec!["valid"]);

        let invalid = run(config, "validator", json!({ "name": "a" })).unwrap();
        assert_eq!(ports(&invalid), vec!["invalid", "errors"]);
        let errors = invalid.ports[1].1.as_array().unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn regex_and_custom_validators() {
        let regex = run(json!({ "validationType": "regex", "pattern": "^[a-z]+$" }), "validator", json!("abc")).unwrap();
        assert_eq!(ports(&regex), vec!["valid"]);

        let node = Node::new(
            "v",
            NodeConfig::Validator(ValidatorConfig {
                validation_type: ValidationType::Custom,
                schema: None,
                pattern: None,
                rules: vec![ValidationRule {
                    expression: "input.total >= threshold".to_string(),
                    message: "total too small".to_string(),
                }],
            }),
        );
        let result = run_inline(&node, &json!({ "total": 1 }), &scope(), &never_wired).unwrap();
        assert_eq!(result.ports[1].1, json!(["total too small"]));
    }

    #[test]
    fn output_value_template() {
        let emission = run(json!({ "value": "{{input.text}}!" }), "output", json!({ "text": "done" })).unwrap();
        assert_eq!(emission.value, json!("done!"));
        assert!(emission.ports.is_empty());
    }

    #[test]
    fn blocking_types_are_not_inline() {
        let err = run(json!({ "agentKind": "echo", "task": "x" }), "agent", json!(null)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownNodeType);
    }

    #[test]
    fn merge_modes() {
        let ports = vec![
            ("input1".to_string(), vec![json!([1])]),
            ("input2".to_string(), vec![json!(2)]),
        ];
        let mut config = MergeConfig::default();
        assert_eq!(combine_merge(&config, &ports), json!([[1], 2]));
        config.mode = MergeMode::Object;
        assert_eq!(combine_merge(&config, &ports), json!({ "input1": [1], "input2": 2 }));
        config.mode = MergeMode::Concat;
        assert_eq!(combine_merge(&config, &ports), json!([1, 2]));
        config.mode = MergeMode::First;
        assert_eq!(combine_merge(&config, &ports), json!([1]));
    }

    #[test]
    fn aggregations() {
        let ports = vec![(
            "input".to_string(),
            vec![json!({ "n": 1 }), json!({ "n": 5 }), json!({ "n": 3 })],
        )];
        let mut config = AggregatorConfig {
            field: Some("n".to_string()),
            ..AggregatorConfig::default()
        };
        assert_eq!(combine_aggregate(&config, &ports).unwrap(), json!([1, 5, 3]));
        config.aggregation_type = AggregationType::Sum;
        assert_eq!(combine_aggregate(&config, &ports).unwrap(), json!(9));
        config.aggregation_type = AggregationType::Max;
        assert_eq!(combine_aggregate(&config, &ports).unwrap(), json!(5));
        config.aggregation_type = AggregationType::Last;
        assert_eq!(combine_aggregate(&config, &ports).unwrap(), json!(3));
        config.aggregation_type = AggregationType::Count;
        assert_eq!(combine_aggregate(&config, &ports).unwrap(), json!(3));
    }

    #[test]
    fn delay_durations_are_capped() {
        let fixed = DelayConfig {
            duration_ms: Some(500),
            ..DelayConfig::default()
        };
        assert_eq!(delay_ms(&fixed, None, 300), 300);

        let exponential = DelayConfig {
            mode: DelayMode::Exponential,
            base_ms: Some(10),
            factor: Some(2.0),
            ..DelayConfig::default()
        };
        assert_eq!(delay_ms(&exponential, Some(3), 10_000), 80);

        let random = DelayConfig {
            mode: DelayMode::Random,
            min_ms: Some(5),
            max_ms: Some(10),
            seed: Some(3),
            ..DelayConfig::default()
        };
        let wait = delay_ms(&random, None, 10_000);
        assert!((5..=10).contains(&wait));
        assert_eq!(wait, delay_ms(&random, None, 10_000));
    }
}
