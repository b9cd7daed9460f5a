//! Execution plan derived from a validated graph.
//!
//! The plan splits the graph into regions: a root region and one body per
//! loop node. A loop body is every node reachable from the loop's `item`
//! port, stopping at loop-back edges and at join nodes (`merge`,
//! `aggregator`), which become the loop's collectors. A nested loop is a
//! member of the enclosing body and owns its own body region.
//!
//! The plan also resolves which `errorHandler` protects each node.

use crate::edge::LOOP_BACK_PORT;
use crate::error::ValidationError;
use crate::graph::WorkflowGraph;
use crate::node::{Node, NodeConfig, NodeId, NodeType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Index of an edge in the plan.
pub type EdgeIndex = usize;

/// A resolved edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEdge {
    pub source: NodeId,
    pub source_port: String,
    pub target: NodeId,
    pub target_port: String,
    pub loop_back: bool,
}

/// The body of one loop node.
#[derive(Debug, Clone, Default)]
pub struct LoopBody {
    /// Nodes executed once per iteration.
    pub members: BTreeSet<NodeId>,
    /// Join nodes outside the body that receive values from it.
    pub collectors: BTreeSet<NodeId>,
    /// Edges leaving the loop's `item` port.
    pub item_edges: Vec<EdgeIndex>,
    /// The edge into the loop's `loopBack` port, if wired.
    pub loop_back: Option<EdgeIndex>,
    /// Edges feeding the body (at any depth) from outside the loop.
    pub external_inputs: Vec<EdgeIndex>,
    /// Edges from inside the loop to its collectors.
    pub exit_edges: Vec<EdgeIndex>,
}

/// Static scheduling information for a graph.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: HashMap<NodeId, Node>,
    entry: NodeId,
    edges: Vec<PlanEdge>,
    inbound: HashMap<NodeId, Vec<EdgeIndex>>,
    outbound: HashMap<NodeId, Vec<EdgeIndex>>,
    topo_index: HashMap<NodeId, usize>,
    region_of: HashMap<NodeId, Option<NodeId>>,
    root_members: BTreeSet<NodeId>,
    bodies: HashMap<NodeId, LoopBody>,
    protected: HashMap<NodeId, BTreeSet<NodeId>>,
    protector: HashMap<NodeId, NodeId>,
}

fn conflict(loop_id: &NodeId, message: impl Into<String>) -> ValidationError {
    ValidationError::LoopBodyConflict {
        loop_id: loop_id.clone(),
        message: message.into(),
    }
}

impl ExecutionPlan {
    /// Builds the plan for a structurally valid graph.
    ///
    /// # Errors
    ///
    /// Returns `LoopBodyConflict` when loop bodies are malformed, and the
    /// graph's own validation errors when it has no single entry or contains
    /// cycles.
    pub fn build(graph: &WorkflowGraph) -> Result<Self, ValidationError> {
        let entry = graph
            .entry()
            .map(|node| node.id.clone())
            .ok_or(ValidationError::NoEntryNode)?;
        let order = graph.topological_order()?;
        let topo_index: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let edges: Vec<PlanEdge> = graph
            .edges()
            .map(|edge| {
                let loop_back = graph
                    .get_node(&edge.target_node)
                    .is_some_and(|n| n.node_type() == NodeType::Loop)
                    && edge.target_port == LOOP_BACK_PORT;
                PlanEdge {
                    source: edge.source_node,
                    source_port: edge.source_port,
                    target: edge.target_node,
                    target_port: edge.target_port,
                    loop_back,
                }
            })
            .collect();

        let mut inbound: HashMap<NodeId, Vec<EdgeIndex>> = HashMap::new();
        let mut outbound: HashMap<NodeId, Vec<EdgeIndex>> = HashMap::new();
        for node in graph.nodes() {
            inbound.entry(node.id.clone()).or_default();
            outbound.entry(node.id.clone()).or_default();
        }
        for (index, edge) in edges.iter().enumerate() {
            inbound.entry(edge.target.clone()).or_default().push(index);
            outbound.entry(edge.source.clone()).or_default().push(index);
        }
        // deterministic edge order: by topological position of the far end
        for list in inbound.values_mut() {
            list.sort_by_key(|&i| (topo_index.get(&edges[i].source).copied(), i));
        }
        for list in outbound.values_mut() {
            list.sort_by_key(|&i| (topo_index.get(&edges[i].target).copied(), i));
        }

        let nodes: HashMap<NodeId, Node> = graph
            .nodes()
            .map(|node| (node.id.clone(), node.clone()))
            .collect();

        let mut plan = Self {
            nodes,
            entry,
            edges,
            inbound,
            outbound,
            topo_index,
            region_of: HashMap::new(),
            root_members: BTreeSet::new(),
            bodies: HashMap::new(),
            protected: HashMap::new(),
            protector: HashMap::new(),
        };
        plan.compute_bodies(&order)?;
        plan.check_bodies()?;
        plan.compute_protection(&order);
        Ok(plan)
    }

    fn compute_bodies(&mut self, order: &[NodeId]) -> Result<(), ValidationError> {
        let loops: Vec<NodeId> = order
            .iter()
            .filter(|id| self.node_type(id) == Some(NodeType::Loop))
            .cloned()
            .collect();

        let mut in_progress = HashSet::new();
        for loop_id in &loops {
            self.body_of(loop_id, &mut in_progress)?;
        }

        let mut region_of: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        for loop_id in &loops {
            let body = &self.bodies[loop_id];
            for member in &body.members {
                if let Some(Some(other)) = region_of.insert(member.clone(), Some(loop_id.clone()))
                {
                    return Err(conflict(
                        loop_id,
                        format!("node {member} also belongs to the body of loop {other}"),
                    ));
                }
            }
        }
        for id in order {
            region_of.entry(id.clone()).or_insert(None);
        }
        self.root_members = region_of
            .iter()
            .filter(|(_, region)| region.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        self.region_of = region_of;

        for loop_id in &loops {
            let external = self.external_inputs(loop_id);
            let exits = self.exit_edges(loop_id);
            if let Some(body) = self.bodies.get_mut(loop_id) {
                body.external_inputs = external;
                body.exit_edges = exits;
            }
        }
        Ok(())
    }

    fn body_of(
        &mut self,
        loop_id: &NodeId,
        in_progress: &mut HashSet<NodeId>,
    ) -> Result<LoopBody, ValidationError> {
        if let Some(body) = self.bodies.get(loop_id) {
            return Ok(body.clone());
        }
        if !in_progress.insert(loop_id.clone()) {
            return Err(conflict(loop_id, "loop body contains itself"));
        }

        let mut body = LoopBody::default();
        let mut queue: VecDeque<(NodeId, bool)> = VecDeque::new();
        for &index in &self.outbound[loop_id] {
            let edge = &self.edges[index];
            if edge.source_port == "item" {
                body.item_edges.push(index);
                queue.push_back((edge.target.clone(), false));
            }
        }

        let mut visited = HashSet::new();
        while let Some((id, forced)) = queue.pop_front() {
            if &id == loop_id {
                continue;
            }
            let is_join = self.node_type(&id).is_some_and(|t| t.is_join());
            if is_join && !forced {
                if !body.members.contains(&id) {
                    body.collectors.insert(id);
                }
                continue;
            }
            if forced {
                body.collectors.remove(&id);
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            body.members.insert(id.clone());

            let nested = if self.node_type(&id) == Some(NodeType::Loop) {
                Some(self.body_of(&id, in_progress)?)
            } else {
                None
            };
            for &index in &self.outbound[&id] {
                let edge = &self.edges[index];
                if nested.is_some() && edge.source_port == "item" {
                    continue;
                }
                if edge.loop_back {
                    if &edge.target == loop_id {
                        body.loop_back = Some(index);
                    }
                    continue;
                }
                queue.push_back((edge.target.clone(), false));
            }
            // a nested loop's collectors run once per iteration of this loop
            for collector in nested.into_iter().flat_map(|body| body.collectors) {
                queue.push_back((collector, true));
            }
        }

        in_progress.remove(loop_id);
        self.bodies.insert(loop_id.clone(), body.clone());
        Ok(body)
    }

    fn check_bodies(&self) -> Result<(), ValidationError> {
        for (loop_id, body) in &self.bodies {
            for &index in &self.outbound[loop_id] {
                let edge = &self.edges[index];
                if edge.source_port == "completed" && self.within(&edge.target, loop_id) {
                    return Err(conflict(
                        loop_id,
                        format!("'completed' feeds body node {}", edge.target),
                    ));
                }
            }
            for collector in &body.collectors {
                if self.region_of(collector) != self.region_of(loop_id) {
                    return Err(conflict(
                        loop_id,
                        format!("collector {collector} is not in the loop's region"),
                    ));
                }
            }
            let descendants = self.descendants(loop_id);
            for &index in &body.external_inputs {
                let source = &self.edges[index].source;
                if descendants.contains(source) {
                    return Err(conflict(
                        loop_id,
                        format!("body input from {source} depends on the loop itself"),
                    ));
                }
            }
        }
        for (index, edge) in self.edges.iter().enumerate() {
            if edge.loop_back && self.region_of(&edge.source) != Some(&edge.target) {
                return Err(conflict(
                    &edge.target,
                    format!("loop-back edge {index} from {} starts outside the body", edge.source),
                ));
            }
        }
        Ok(())
    }

    fn descendants(&self, start: &NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(id) = queue.pop_front() {
            for &index in self.outbound.get(&id).into_iter().flatten() {
                let edge = &self.edges[index];
                if !edge.loop_back && seen.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        seen
    }

    fn compute_protection(&mut self, order: &[NodeId]) {
        let handlers: Vec<NodeId> = order
            .iter()
            .filter(|id| self.node_type(id) == Some(NodeType::ErrorHandler))
            .cloned()
            .collect();

        for handler in &handlers {
            let reach_from = |plan: &Self, port: &str| -> HashSet<NodeId> {
                let mut seen = HashSet::new();
                let mut queue = VecDeque::new();
                for &index in &plan.outbound[handler] {
                    let edge = &plan.edges[index];
                    if edge.source_port == port && seen.insert(edge.target.clone()) {
                        queue.push_back(edge.target.clone());
                    }
                }
                while let Some(id) = queue.pop_front() {
                    // everything inside a reached loop is reached too
                    if plan.bodies.contains_key(&id) {
                        for member in plan.nodes.keys().filter(|n| plan.within(n, &id)) {
                            if seen.insert(member.clone()) {
                                queue.push_back(member.clone());
                            }
                        }
                    }
                    for &index in &plan.outbound[&id] {
                        let edge = &plan.edges[index];
                        if !edge.loop_back && seen.insert(edge.target.clone()) {
                            queue.push_back(edge.target.clone());
                        }
                    }
                }
                seen
            };

            let tried = reach_from(self, "try");
            let mut recovery = reach_from(self, "error");
            recovery.extend(reach_from(self, "fallback"));

            let scope = match self.nodes.get(handler).map(|n| &n.config) {
                Some(NodeConfig::ErrorHandler(config)) => config.scope.clone(),
                _ => Vec::new(),
            };
            let handler_region = self.region_of(handler).cloned();
            let protected: BTreeSet<NodeId> = tried
                .into_iter()
                .filter(|id| !recovery.contains(id))
                .filter(|id| scope.is_empty() || scope.contains(id))
                .filter(|id| match &handler_region {
                    Some(region) => self.within(id, region),
                    None => true,
                })
                .collect();
            self.protected.insert(handler.clone(), protected);
        }

        // innermost handler: the latest one in topological order
        for handler in &handlers {
            for id in &self.protected[handler] {
                let replace = match self.protector.get(id) {
                    Some(current) => self.topo_index[handler] > self.topo_index[current],
                    None => true,
                };
                if replace {
                    self.protector.insert(id.clone(), handler.clone());
                }
            }
        }
    }

    fn external_inputs(&self, loop_id: &NodeId) -> Vec<EdgeIndex> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                !edge.loop_back
                    && self.within(&edge.target, loop_id)
                    && !self.within(&edge.source, loop_id)
                    && &edge.source != loop_id
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn exit_edges(&self, loop_id: &NodeId) -> Vec<EdgeIndex> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                !edge.loop_back
                    && self.within(&edge.source, loop_id)
                    && !self.within(&edge.target, loop_id)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns true if `node_id` runs inside the body of `loop_id`, at any
    /// depth.
    #[must_use]
    pub fn within(&self, node_id: &NodeId, loop_id: &NodeId) -> bool {
        let mut region = self.region_of(node_id);
        while let Some(current) = region {
            if current == loop_id {
                return true;
            }
            region = self.region_of(current);
        }
        false
    }

    /// The innermost loop whose body contains the node; `None` for the root
    /// region.
    #[must_use]
    pub fn region_of(&self, node_id: &NodeId) -> Option<&NodeId> {
        self.region_of.get(node_id).and_then(Option::as_ref)
    }

    /// Nodes executed directly by a region.
    #[must_use]
    pub fn region_members(&self, region: Option<&NodeId>) -> &BTreeSet<NodeId> {
        match region.and_then(|id| self.bodies.get(id)) {
            Some(body) => &body.members,
            None => &self.root_members,
        }
    }

    /// The loop body of a loop node.
    #[must_use]
    pub fn body(&self, loop_id: &NodeId) -> Option<&LoopBody> {
        self.bodies.get(loop_id)
    }

    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    fn node_type(&self, node_id: &NodeId) -> Option<NodeType> {
        self.nodes.get(node_id).map(Node::node_type)
    }

    #[must_use]
    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    #[must_use]
    pub fn edge(&self, index: EdgeIndex) -> &PlanEdge {
        &self.edges[index]
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Inbound edges of a node, loop-back edges included.
    #[must_use]
    pub fn inbound(&self, node_id: &NodeId) -> &[EdgeIndex] {
        self.inbound.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Outbound edges of a node.
    #[must_use]
    pub fn outbound(&self, node_id: &NodeId) -> &[EdgeIndex] {
        self.outbound.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Edges a node waits on before it can run: its forward inbound edges
    /// and, for loops, the edges feeding the body from outside.
    #[must_use]
    pub fn wait_edges(&self, node_id: &NodeId) -> Vec<EdgeIndex> {
        let mut waits: Vec<EdgeIndex> = self
            .inbound(node_id)
            .iter()
            .copied()
            .filter(|&i| !self.edges[i].loop_back)
            .collect();
        if let Some(body) = self.bodies.get(node_id) {
            waits.extend(body.external_inputs.iter().copied());
        }
        waits
    }

    /// Edges resolved when a node finishes: its outbound edges and, for
    /// loops, the edges from the body to its collectors.
    #[must_use]
    pub fn exit_edges_of(&self, node_id: &NodeId) -> Vec<EdgeIndex> {
        let mut exits: Vec<EdgeIndex> = self
            .outbound(node_id)
            .iter()
            .copied()
            .filter(|&i| self.edges[i].source_port != "item" || self.bodies.get(node_id).is_none())
            .collect();
        if let Some(body) = self.bodies.get(node_id) {
            exits.extend(body.exit_edges.iter().copied());
        }
        exits
    }

    /// Position of a node in topological order.
    #[must_use]
    pub fn topo_position(&self, node_id: &NodeId) -> usize {
        self.topo_index.get(node_id).copied().unwrap_or(usize::MAX)
    }

    /// Nodes protected by an error handler.
    #[must_use]
    pub fn protected_by(&self, handler: &NodeId) -> Option<&BTreeSet<NodeId>> {
        self.protected.get(handler)
    }

    /// The innermost error handler protecting a node.
    #[must_use]
    pub fn protector(&self, node_id: &NodeId) -> Option<&NodeId> {
        self.protector.get(node_id)
    }

    /// Returns true if some edge leaves the node's `port`.
    #[must_use]
    pub fn is_wired(&self, node_id: &NodeId, port: &str) -> bool {
        self.outbound(node_id)
            .iter()
            .any(|&i| self.edges[i].source_port == port)
    }

    /// Output nodes keyed by their result key.
    #[must_use]
    pub fn output_nodes(&self) -> BTreeMap<String, NodeId> {
        self.nodes
            .values()
            .filter_map(|node| {
                crate::graph::output_key(node).map(|key| (key.to_string(), node.id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_value;
    use serde_json::json;

    fn plan_of(document: serde_json::Value) -> ExecutionPlan {
        let graph = parse_value(document).expect("valid graph");
        ExecutionPlan::build(&graph).expect("plan")
    }

    fn loop_document() -> serde_json::Value {
        json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "loop1", "type": "loop", "config": { "items": [1, 2, 3] } },
                { "id": "a", "type": "agent", "config": { "agentKind": "echo", "task": "{{item}}" } },
                { "id": "agg", "type": "aggregator" },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "loop1" },
                { "source": "loop1", "sourcePort": "item", "target": "a" },
                { "source": "a", "target": "agg" },
                { "source": "agg", "target": "out" }
            ]
        })
    }

    #[test]
    fn loop_body_stops_at_collectors() {
        let plan = plan_of(loop_document());
        let loop_id = NodeId::from("loop1");
        let body = plan.body(&loop_id).expect("loop body");

        assert_eq!(body.members, BTreeSet::from([NodeId::from("a")]));
        assert_eq!(body.collectors, BTreeSet::from([NodeId::from("agg")]));
        assert_eq!(body.exit_edges.len(), 1);
        assert_eq!(plan.region_of(&NodeId::from("a")), Some(&loop_id));
        assert_eq!(plan.region_of(&NodeId::from("agg")), None);
        assert!(plan.region_members(None).contains(&NodeId::from("agg")));
    }

    #[test]
    fn loop_back_and_completed() {
        let plan = plan_of(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "loop1", "type": "loop", "config": { "mode": "count", "count": 2 } },
                { "id": "calc", "type": "calculator", "config": { "operation": "add", "operands": ["{{item}}", 1] } },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "loop1" },
                { "source": "loop1", "sourcePort": "item", "target": "calc" },
                { "source": "calc", "target": "loop1", "targetPort": "loopBack" },
                { "source": "loop1", "sourcePort": "completed", "target": "out" }
            ]
        }));
        let body = plan.body(&NodeId::from("loop1")).expect("loop body");
        assert!(body.loop_back.is_some());
        assert_eq!(plan.region_of(&NodeId::from("out")), None);
        // loopBack is not a wait edge of the loop
        assert_eq!(plan.wait_edges(&NodeId::from("loop1")).len(), 1);
    }

    #[test]
    fn nested_loop_is_member_of_outer_body() {
        let plan = plan_of(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "outer", "type": "loop", "config": { "items": [[1, 2], [3]] } },
                { "id": "inner", "type": "loop", "config": { "items": "{{item}}" } },
                { "id": "a", "type": "agent", "config": { "agentKind": "echo", "task": "{{item}}" } },
                { "id": "collect", "type": "aggregator" },
                { "id": "all", "type": "aggregator" },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "outer" },
                { "source": "outer", "sourcePort": "item", "target": "inner" },
                { "source": "inner", "sourcePort": "item", "target": "a" },
                { "source": "a", "target": "collect" },
                { "source": "collect", "target": "all" },
                { "source": "all", "target": "out" }
            ]
        }));
        let outer = NodeId::from("outer");
        let inner = NodeId::from("inner");
        assert_eq!(plan.region_of(&inner), Some(&outer));
        assert_eq!(plan.region_of(&NodeId::from("a")), Some(&inner));
        // the inner loop's collector runs once per outer iteration
        assert_eq!(plan.region_of(&NodeId::from("collect")), Some(&outer));
        assert_eq!(plan.region_of(&NodeId::from("all")), None);
        assert!(plan.within(&NodeId::from("a"), &outer));
    }

    #[test]
    fn outside_values_feeding_a_body_are_external_inputs() {
        let plan = plan_of(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "outer", "type": "loop", "config": { "items": [[1], [2]] } },
                { "id": "inner", "type": "loop", "config": { "items": "{{item}}" } },
                { "id": "a", "type": "agent", "config": { "agentKind": "echo", "task": "{{item}}" } },
                { "id": "collect", "type": "merge", "inputPorts": ["inner", "outside"] },
                { "id": "all", "type": "aggregator" },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "outer" },
                { "source": "start", "target": "collect", "targetPort": "outside" },
                { "source": "outer", "sourcePort": "item", "target": "inner" },
                { "source": "inner", "sourcePort": "item", "target": "a" },
                { "source": "a", "target": "collect", "targetPort": "inner" },
                { "source": "collect", "target": "all" },
                { "source": "all", "target": "out" }
            ]
        }));
        let outer = NodeId::from("outer");
        let body = plan.body(&outer).expect("outer body");
        assert_eq!(body.external_inputs.len(), 1);
        let edge = plan.edge(body.external_inputs[0]);
        assert_eq!(edge.source, NodeId::from("start"));
        assert_eq!(edge.target_port, "outside");
        // the loop waits for its own input and the outside value
        assert_eq!(plan.wait_edges(&outer).len(), 2);
    }

    #[test]
    fn loop_back_from_outside_is_a_conflict() {
        let document = json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "loop1", "type": "loop", "config": { "items": [1] } },
                { "id": "a", "type": "agent", "config": { "agentKind": "echo", "task": "x" } },
                { "id": "b", "type": "agent", "config": { "agentKind": "echo", "task": "y" } },
                { "id": "out", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "loop1" },
                { "source": "start", "target": "b" },
                { "source": "loop1", "sourcePort": "item", "target": "a" },
                { "source": "b", "target": "loop1", "targetPort": "loopBack" },
                { "source": "loop1", "sourcePort": "completed", "target": "out" }
            ]
        });
        let document: crate::document::GraphDocument =
            serde_json::from_value(document).expect("document shape");
        assert!(matches!(
            WorkflowGraph::try_from(document),
            Err(ValidationError::LoopBodyConflict { .. })
        ));
    }

    #[test]
    fn handler_protects_try_side_only() {
        let plan = plan_of(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "guard", "type": "errorHandler", "config": { "retryCount": 2 } },
                { "id": "risky", "type": "agent", "config": { "agentKind": "flaky", "task": "go" } },
                { "id": "ok", "type": "output" },
                { "id": "recover", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "guard" },
                { "source": "guard", "sourcePort": "try", "target": "risky" },
                { "source": "risky", "target": "ok" },
                { "source": "guard", "sourcePort": "fallback", "target": "recover" }
            ]
        }));
        let guard = NodeId::from("guard");
        let protected = plan.protected_by(&guard).expect("handler");
        assert!(protected.contains(&NodeId::from("risky")));
        assert!(protected.contains(&NodeId::from("ok")));
        assert!(!protected.contains(&NodeId::from("recover")));
        assert_eq!(plan.protector(&NodeId::from("risky")), Some(&guard));
        assert!(plan.is_wired(&guard, "fallback"));
        assert!(!plan.is_wired(&guard, "error"));
    }
}
