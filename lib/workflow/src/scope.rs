//! Scoped variable store.
//!
//! A `Scope` is a handle to the top of a chain of immutable frames shared
//! through `Arc`. Pushing a frame or writing a variable returns a new handle
//! and never touches frames other handles can see, so concurrent branches
//! each own a private view layered on the frames that existed at fork time.
//!
//! Writes follow the nearest-enclosing rule: `set` updates the nearest frame
//! that already defines the name, or the current frame when no frame does.
//! The frames between the top and the written frame are path-copied.

use crate::expression::Bindings;
use crate::node::NodeId;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What opened a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// The outermost frame of a run.
    Workflow,
    /// One iteration of a loop body.
    Loop { node: NodeId, iteration: u32 },
    /// One output branch of a `parallel` node.
    Branch { node: NodeId, port: String },
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => f.write_str("main"),
            Self::Loop { node, iteration } => write!(f, "{node}#{iteration}"),
            Self::Branch { node, port } => write!(f, "{node}:{port}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    vars: BTreeMap<String, Arc<JsonValue>>,
    outputs: BTreeMap<NodeId, Arc<JsonValue>>,
    parent: Option<Arc<Frame>>,
    depth: usize,
}

impl Frame {
    fn parent(&self) -> Option<&Frame> {
        self.parent.as_deref()
    }
}

/// A persistent chain of variable frames.
#[derive(Debug, Clone)]
pub struct Scope {
    top: Arc<Frame>,
}

impl Scope {
    /// Creates the workflow frame for a run.
    ///
    /// Binds `trigger` to the whole input and, for object inputs, each
    /// top-level key.
    #[must_use]
    pub fn root(input: &JsonValue) -> Self {
        let mut vars = BTreeMap::new();
        if let JsonValue::Object(map) = input {
            for (key, value) in map {
                vars.insert(key.clone(), Arc::new(value.clone()));
            }
        }
        vars.insert("trigger".to_string(), Arc::new(input.clone()));
        Self {
            top: Arc::new(Frame {
                kind: FrameKind::Workflow,
                vars,
                outputs: BTreeMap::new(),
                parent: None,
                depth: 1,
            }),
        }
    }

    /// Pushes an empty frame.
    #[must_use]
    pub fn push(&self, kind: FrameKind) -> Self {
        Self {
            top: Arc::new(Frame {
                kind,
                vars: BTreeMap::new(),
                outputs: BTreeMap::new(),
                parent: Some(Arc::clone(&self.top)),
                depth: self.top.depth + 1,
            }),
        }
    }

    /// Drops the top frame; `None` at the workflow frame.
    #[must_use]
    pub fn pop(&self) -> Option<Self> {
        self.top.parent.as_ref().map(|parent| Self {
            top: Arc::clone(parent),
        })
    }

    /// Drops the top frame if it is a `parallel` branch frame.
    #[must_use]
    pub fn pop_branch(&self) -> Self {
        match self.top.kind {
            FrameKind::Branch { .. } => self.pop().unwrap_or_else(|| self.clone()),
            _ => self.clone(),
        }
    }

    /// Drops frames until at most `depth` remain.
    #[must_use]
    pub fn truncate(&self, depth: usize) -> Self {
        let mut top = Arc::clone(&self.top);
        while top.depth > depth.max(1) {
            let Some(parent) = top.parent.clone() else {
                break;
            };
            top = parent;
        }
        Self { top }
    }

    /// Number of frames in the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.top.depth
    }

    /// Kind of the top frame.
    #[must_use]
    pub fn kind(&self) -> &FrameKind {
        &self.top.kind
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(&*self.top), |frame| frame.parent())
    }

    /// Reads a variable; the nearest frame wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.frames()
            .find_map(|frame| frame.vars.get(name))
            .map(|value| &**value)
    }

    /// Returns true if any visible frame defines `name`.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Defines a variable in the top frame.
    #[must_use]
    pub fn define(&self, name: impl Into<String>, value: JsonValue) -> Self {
        let name = name.into();
        self.update_frame(self.top.depth, move |frame| {
            frame.vars.insert(name, Arc::new(value));
        })
    }

    /// Writes a variable into the nearest frame that defines it, else the
    /// top frame.
    #[must_use]
    pub fn set(&self, name: impl Into<String>, value: JsonValue) -> Self {
        let name = name.into();
        let depth = self.defining_depth(&name).unwrap_or(self.top.depth);
        self.update_frame(depth, move |frame| {
            frame.vars.insert(name, Arc::new(value));
        })
    }

    /// Removes a variable from the nearest frame that defines it.
    #[must_use]
    pub fn remove(&self, name: &str) -> Self {
        match self.defining_depth(name) {
            Some(depth) => self.update_frame(depth, |frame| {
                frame.vars.remove(name);
            }),
            None => self.clone(),
        }
    }

    /// Records a node output in the top frame for `nodes.<id>` lookups.
    #[must_use]
    pub fn bind_output(&self, node_id: &NodeId, value: JsonValue) -> Self {
        let node_id = node_id.clone();
        self.update_frame(self.top.depth, move |frame| {
            frame.outputs.insert(node_id, Arc::new(value));
        })
    }

    /// Reads the output recorded for a node; the nearest frame wins.
    #[must_use]
    pub fn output(&self, node_id: &str) -> Option<&JsonValue> {
        self.frames()
            .find_map(|frame| frame.outputs.get(node_id))
            .map(|value| &**value)
    }

    /// Flattens every visible variable into one object, outer frames first.
    #[must_use]
    pub fn snapshot(&self) -> JsonValue {
        let frames: Vec<&Frame> = self.frames().collect();
        let mut flat = Map::new();
        for frame in frames.into_iter().rev() {
            for (name, value) in &frame.vars {
                flat.insert(name.clone(), (**value).clone());
            }
        }
        JsonValue::Object(flat)
    }

    /// Iteration index of the innermost loop frame.
    #[must_use]
    pub fn iteration(&self) -> Option<u32> {
        self.frames().find_map(|frame| match frame.kind {
            FrameKind::Loop { iteration, .. } => Some(iteration),
            _ => None,
        })
    }

    /// Frame path identifying the branch this scope belongs to, such as
    /// `main` or `loop1#2/fan:branch1`.
    #[must_use]
    pub fn branch_id(&self) -> String {
        let mut parts: Vec<String> = self
            .frames()
            .filter(|frame| frame.kind != FrameKind::Workflow)
            .map(|frame| frame.kind.to_string())
            .collect();
        if parts.is_empty() {
            return FrameKind::Workflow.to_string();
        }
        parts.reverse();
        parts.join("/")
    }

    fn defining_depth(&self, name: &str) -> Option<usize> {
        self.frames()
            .find(|frame| frame.vars.contains_key(name))
            .map(|frame| frame.depth)
    }

    fn update_frame(&self, depth: usize, update: impl FnOnce(&mut Frame)) -> Self {
        Self {
            top: copy_path(&self.top, depth, update),
        }
    }
}

fn copy_path(frame: &Arc<Frame>, depth: usize, update: impl FnOnce(&mut Frame)) -> Arc<Frame> {
    let mut copy = (**frame).clone();
    if frame.depth == depth {
        update(&mut copy);
    } else if let Some(parent) = &frame.parent {
        copy.parent = Some(copy_path(parent, depth, update));
    }
    Arc::new(copy)
}

/// Expression bindings for one node evaluation.
///
/// Resolution order: locals (`item`, `index`, `acc`, ...), then `input`,
/// then the scope chain. `nodes.<id>` reads recorded node outputs.
pub struct EvalContext<'a> {
    scope: &'a Scope,
    input: Option<&'a JsonValue>,
    locals: BTreeMap<&'static str, JsonValue>,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub fn new(scope: &'a Scope, input: Option<&'a JsonValue>) -> Self {
        Self {
            scope,
            input,
            locals: BTreeMap::new(),
        }
    }

    /// Binds an expression local.
    #[must_use]
    pub fn with_local(mut self, name: &'static str, value: JsonValue) -> Self {
        self.locals.insert(name, value);
        self
    }

    /// Rebinds an expression local in place.
    pub fn set_local(&mut self, name: &'static str, value: JsonValue) {
        self.locals.insert(name, value);
    }
}

impl Bindings for EvalContext<'_> {
    fn lookup(&self, name: &str) -> Option<&JsonValue> {
        if let Some(value) = self.locals.get(name) {
            return Some(value);
        }
        if name == "input"
            && let Some(input) = self.input
        {
            return Some(input);
        }
        self.scope.get(name)
    }

    fn node_output(&self, node_id: &str) -> Option<&JsonValue> {
        self.scope.output(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::evaluate;
    use serde_json::json;

    fn loop_frame(iteration: u32) -> FrameKind {
        FrameKind::Loop {
            node: NodeId::from("loop1"),
            iteration,
        }
    }

    #[test]
    fn root_binds_trigger_and_input_keys() {
        let scope = Scope::root(&json!({ "user": "ada", "limit": 3 }));
        assert_eq!(scope.get("user"), Some(&json!("ada")));
        assert_eq!(scope.get("trigger"), Some(&json!({ "user": "ada", "limit": 3 })));
        assert_eq!(scope.depth(), 1);
        assert_eq!(scope.branch_id(), "main");
    }

    #[test]
    fn nearest_frame_wins_on_read() {
        let root = Scope::root(&json!({ "x": 1 }));
        let inner = root.push(loop_frame(0)).define("x", json!(2));
        assert_eq!(inner.get("x"), Some(&json!(2)));
        assert_eq!(inner.pop().and_then(|s| s.get("x").cloned()), Some(json!(1)));
    }

    #[test]
    fn set_writes_nearest_defining_frame() {
        let root = Scope::root(&json!({ "total": 0 }));
        let inner = root.push(loop_frame(0)).set("total", json!(5));

        // the write landed in the workflow frame, visible after popping
        let outer = inner.pop().expect("parent frame");
        assert_eq!(outer.get("total"), Some(&json!(5)));
        // the original chain is untouched
        assert_eq!(root.get("total"), Some(&json!(0)));
    }

    #[test]
    fn set_of_undefined_name_stays_local() {
        let root = Scope::root(&json!({}));
        let inner = root.push(loop_frame(0)).set("tmp", json!(true));
        assert!(inner.is_defined("tmp"));
        assert!(!inner.pop().expect("parent").is_defined("tmp"));
    }

    #[test]
    fn sibling_branches_are_isolated() {
        let root = Scope::root(&json!({ "count": 0 }));
        let left = root
            .push(FrameKind::Branch {
                node: NodeId::from("fan"),
                port: "branch1".to_string(),
            })
            .set("count", json!(1));
        let right = root.push(FrameKind::Branch {
            node: NodeId::from("fan"),
            port: "branch2".to_string(),
        });
        assert_eq!(left.get("count"), Some(&json!(1)));
        assert_eq!(right.get("count"), Some(&json!(0)));
        assert_eq!(left.branch_id(), "fan:branch1");
    }

    #[test]
    fn remove_and_pop_branch() {
        let root = Scope::root(&json!({ "a": 1 }));
        let branch = root.push(FrameKind::Branch {
            node: NodeId::from("fan"),
            port: "b".to_string(),
        });
        let removed = branch.remove("a");
        assert!(!removed.is_defined("a"));
        assert_eq!(removed.pop_branch().depth(), 1);
        // pop_branch leaves non-branch frames alone
        let looped = root.push(loop_frame(1));
        assert_eq!(looped.pop_branch().depth(), 2);
    }

    #[test]
    fn iteration_and_branch_path() {
        let scope = Scope::root(&json!(null))
            .push(loop_frame(2))
            .push(FrameKind::Branch {
                node: NodeId::from("fan"),
                port: "branch1".to_string(),
            });
        assert_eq!(scope.iteration(), Some(2));
        assert_eq!(scope.branch_id(), "loop1#2/fan:branch1");
        assert_eq!(scope.truncate(1).branch_id(), "main");
    }

    #[test]
    fn snapshot_flattens_outer_to_inner() {
        let scope = Scope::root(&json!({ "a": 1, "b": 1 }))
            .push(loop_frame(0))
            .define("b", json!(2));
        let snapshot = scope.snapshot();
        assert_eq!(snapshot["a"], 1);
        assert_eq!(snapshot["b"], 2);
    }

    #[test]
    fn eval_context_resolution_order() {
        let scope = Scope::root(&json!({ "item": "outer", "input": "shadowed" }))
            .bind_output(&NodeId::from("agent1"), json!({ "text": "hi" }));
        let input = json!({ "score": 9 });
        let ctx = EvalContext::new(&scope, Some(&input)).with_local("item", json!("local"));

        assert_eq!(evaluate("{{item}}", &ctx).unwrap(), json!("local"));
        assert_eq!(evaluate("{{input.score}}", &ctx).unwrap(), json!(9));
        assert_eq!(evaluate("{{nodes.agent1.text}}", &ctx).unwrap(), json!("hi"));
        assert!(evaluate("{{missing}}", &ctx).is_err());
    }

    #[test]
    fn outputs_are_found_by_plain_id_from_inner_frames() {
        let scope = Scope::root(&json!({}))
            .bind_output(&NodeId::from("fetch"), json!([1, 2]))
            .push(loop_frame(0));
        assert_eq!(scope.output("fetch"), Some(&json!([1, 2])));
        assert_eq!(scope.output("other"), None);
    }
}
