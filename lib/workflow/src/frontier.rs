//! Per-region edge bookkeeping.
//!
//! A region (the root graph or one loop iteration) tracks the state of
//! every edge its nodes wait on. Nodes become ready once all of them are
//! resolved; failed inputs block a node and fully skipped inputs skip it.

use crate::error::NodeError;
use crate::node::{NodeConfig, NodeId};
use crate::plan::{EdgeIndex, ExecutionPlan};
use crate::scope::Scope;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A value travelling along an edge, with the scope it was produced in.
#[derive(Debug, Clone)]
pub struct Token {
    pub value: JsonValue,
    pub scope: Scope,
}

impl Token {
    #[must_use]
    pub fn new(value: JsonValue, scope: Scope) -> Self {
        Self { value, scope }
    }

    /// The same value seen from another scope.
    #[must_use]
    pub fn rescoped(&self, scope: &Scope) -> Self {
        Self {
            value: self.value.clone(),
            scope: scope.clone(),
        }
    }
}

/// Resolution state of one edge.
#[derive(Debug, Clone)]
pub enum EdgeState {
    Pending,
    /// One value per producing instance; loop collectors get one per
    /// iteration.
    Arrived(Vec<Token>),
    /// The source port emitted nothing; carries the source's scope.
    Skipped(Scope),
    /// The source failed without being handled.
    Failed(NodeError, Scope),
}

impl EdgeState {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Values that reached a node, grouped by input port in port order.
pub type PortValues = Vec<(String, Vec<Token>)>;

/// What a region should do with a node.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Some input is still pending. `arrived` is true once any join input
    /// has a value, which starts the join timer.
    Waiting { arrived: bool },
    Run(PortValues),
    Skip(Scope),
    Blocked(NodeError, Scope),
    /// An aggregator that waits for all ports lost one to a skip.
    Unfillable { port: String, scope: Scope },
}

/// Edge states and node progress of one region.
#[derive(Debug)]
pub struct Frontier {
    members: BTreeSet<NodeId>,
    edges: HashMap<EdgeIndex, EdgeState>,
    dispatched: HashSet<NodeId>,
    finished: HashSet<NodeId>,
}

static PENDING: EdgeState = EdgeState::Pending;

impl Frontier {
    /// Creates the frontier of `region`, with every edge pending.
    #[must_use]
    pub fn new(plan: &ExecutionPlan, region: Option<&NodeId>) -> Self {
        Self {
            members: plan.region_members(region).clone(),
            edges: HashMap::new(),
            dispatched: HashSet::new(),
            finished: HashSet::new(),
        }
    }

    pub fn set(&mut self, edge: EdgeIndex, state: EdgeState) {
        self.edges.insert(edge, state);
    }

    #[must_use]
    pub fn state(&self, edge: EdgeIndex) -> &EdgeState {
        self.edges.get(&edge).unwrap_or(&PENDING)
    }

    #[must_use]
    pub fn is_member(&self, node_id: &NodeId) -> bool {
        self.members.contains(node_id)
    }

    /// Members not yet dispatched, in topological order.
    #[must_use]
    pub fn candidates(&self, plan: &ExecutionPlan) -> Vec<NodeId> {
        let mut waiting: Vec<NodeId> = self
            .members
            .iter()
            .filter(|id| !self.dispatched.contains(*id))
            .cloned()
            .collect();
        waiting.sort_by_key(|id| plan.topo_position(id));
        waiting
    }

    pub fn dispatch(&mut self, node_id: &NodeId) {
        self.dispatched.insert(node_id.clone());
    }

    pub fn finish(&mut self, node_id: &NodeId) {
        self.dispatched.insert(node_id.clone());
        self.finished.insert(node_id.clone());
    }

    #[must_use]
    pub fn is_finished(&self, node_id: &NodeId) -> bool {
        self.finished.contains(node_id)
    }

    /// Members that never finished.
    #[must_use]
    pub fn unfinished(&self) -> Vec<&NodeId> {
        self.members
            .iter()
            .filter(|id| !self.finished.contains(*id))
            .collect()
    }

    /// Decides whether a member can run.
    ///
    /// Loops also wait for the edges feeding their body from outside, but
    /// only their own input edge decides whether they run, skip or block.
    #[must_use]
    pub fn readiness(&self, plan: &ExecutionPlan, node_id: &NodeId) -> Readiness {
        let Some(node) = plan.node(node_id) else {
            return Readiness::Waiting { arrived: false };
        };
        if let Some(body) = plan.body(node_id)
            && body
                .external_inputs
                .iter()
                .any(|&edge| !self.state(edge).is_resolved())
        {
            return Readiness::Waiting { arrived: false };
        }

        let mut own: Vec<EdgeIndex> = plan
            .inbound(node_id)
            .iter()
            .copied()
            .filter(|&edge| !plan.edge(edge).loop_back)
            .collect();
        own.sort_by_key(|&edge| node.input_position(&plan.edge(edge).target_port));

        if let Some((error, scope)) = own.iter().find_map(|&edge| match self.state(edge) {
            EdgeState::Failed(error, scope) => Some((error.clone(), scope.clone())),
            _ => None,
        }) {
            return Readiness::Blocked(error, scope);
        }

        let skipped: Vec<(EdgeIndex, &Scope)> = own
            .iter()
            .filter_map(|&edge| match self.state(edge) {
                EdgeState::Skipped(scope) => Some((edge, scope)),
                _ => None,
            })
            .collect();
        if !own.is_empty() && skipped.len() == own.len() {
            return Readiness::Skip(skipped[0].1.clone());
        }
        if let NodeConfig::Aggregator(config) = &node.config
            && config.wait_for_all
            && let Some(&(edge, scope)) = skipped.first()
        {
            return Readiness::Unfillable {
                port: plan.edge(edge).target_port.clone(),
                scope: scope.clone(),
            };
        }

        let mut ports = PortValues::new();
        let mut pending = false;
        for &edge in &own {
            match self.state(edge) {
                EdgeState::Pending => pending = true,
                EdgeState::Arrived(tokens) => {
                    ports.push((plan.edge(edge).target_port.clone(), tokens.clone()));
                }
                EdgeState::Skipped(_) | EdgeState::Failed(..) => {}
            }
        }
        if pending {
            let arrived = node.node_type().is_join() && !ports.is_empty();
            return Readiness::Waiting { arrived };
        }
        Readiness::Run(ports)
    }

    /// Values that reached a join so far, for partial results.
    #[must_use]
    pub fn arrived(&self, plan: &ExecutionPlan, node_id: &NodeId) -> PortValues {
        let Some(node) = plan.node(node_id) else {
            return PortValues::new();
        };
        let mut own: Vec<EdgeIndex> = plan.inbound(node_id).to_vec();
        own.sort_by_key(|&edge| node.input_position(&plan.edge(edge).target_port));
        own.into_iter()
            .filter_map(|edge| match self.state(edge) {
                EdgeState::Arrived(tokens) => {
                    Some((plan.edge(edge).target_port.clone(), tokens.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_value;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn plan() -> ExecutionPlan {
        let graph = parse_value(json!({
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "fan", "type": "parallel" },
                { "id": "a", "type": "transform", "config": { "operation": "flatten" } },
                { "id": "b", "type": "transform", "config": { "operation": "flatten" } },
                { "id": "join", "type": "merge" },
                { "id": "all", "type": "aggregator", "inputPorts": ["left", "right"] },
                { "id": "out", "type": "output" },
                { "id": "out2", "type": "output" }
            ],
            "edges": [
                { "source": "start", "target": "fan" },
                { "source": "fan", "sourcePort": "branch1", "target": "a" },
                { "source": "fan", "sourcePort": "branch2", "target": "b" },
                { "source": "a", "target": "join", "targetPort": "input1" },
                { "source": "b", "target": "join", "targetPort": "input2" },
                { "source": "join", "target": "out" },
                { "source": "a", "target": "all", "targetPort": "left" },
                { "source": "b", "target": "all", "targetPort": "right" },
                { "source": "all", "target": "out2" }
            ]
        }))
        .expect("valid graph");
        ExecutionPlan::build(&graph).expect("plan")
    }

    fn edge_between(plan: &ExecutionPlan, source: &str, target: &str) -> EdgeIndex {
        (0..plan.edge_count())
            .find(|&i| plan.edge(i).source.as_str() == source && plan.edge(i).target.as_str() == target)
            .expect("edge")
    }

    fn token(value: JsonValue) -> EdgeState {
        EdgeState::Arrived(vec![Token::new(value, Scope::root(&json!({})))])
    }

    fn skipped() -> EdgeState {
        EdgeState::Skipped(Scope::root(&json!({})))
    }

    #[test]
    fn entry_runs_without_inputs() {
        let plan = plan();
        let frontier = Frontier::new(&plan, None);
        assert!(matches!(
            frontier.readiness(&plan, &NodeId::from("start")),
            Readiness::Run(ports) if ports.is_empty()
        ));
        assert_eq!(frontier.candidates(&plan)[0], NodeId::from("start"));
    }

    #[test]
    fn merge_waits_then_ignores_skipped_ports() {
        let plan = plan();
        let mut frontier = Frontier::new(&plan, None);
        let join = NodeId::from("join");

        frontier.set(edge_between(&plan, "a", "join"), token(json!(1)));
        assert!(matches!(
            frontier.readiness(&plan, &join),
            Readiness::Waiting { arrived: true }
        ));

        frontier.set(edge_between(&plan, "b", "join"), skipped());
        let Readiness::Run(ports) = frontier.readiness(&plan, &join) else {
            panic!("merge should run");
        };
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].0, "input1");
    }

    #[test]
    fn aggregator_waiting_for_all_cannot_fill_skipped_port() {
        let plan = plan();
        let mut frontier = Frontier::new(&plan, None);
        frontier.set(edge_between(&plan, "a", "all"), token(json!(1)));
        frontier.set(edge_between(&plan, "b", "all"), skipped());
        assert!(matches!(
            frontier.readiness(&plan, &NodeId::from("all")),
            Readiness::Unfillable { port, .. } if port == "right"
        ));
    }

    #[test]
    fn all_skipped_inputs_skip_the_node() {
        let plan = plan();
        let mut frontier = Frontier::new(&plan, None);
        frontier.set(edge_between(&plan, "a", "all"), skipped());
        frontier.set(edge_between(&plan, "b", "all"), skipped());
        assert!(matches!(
            frontier.readiness(&plan, &NodeId::from("all")),
            Readiness::Skip(_)
        ));
    }

    #[test]
    fn failed_input_blocks() {
        let plan = plan();
        let mut frontier = Frontier::new(&plan, None);
        let error = NodeError {
            node_id: NodeId::from("join"),
            iteration: None,
            branch: "main".to_string(),
            kind: ErrorKind::JoinTimeout,
            message: "late".to_string(),
        };
        frontier.set(
            edge_between(&plan, "join", "out"),
            EdgeState::Failed(error.clone(), Scope::root(&json!({}))),
        );
        assert!(matches!(
            frontier.readiness(&plan, &NodeId::from("out")),
            Readiness::Blocked(blocked, _) if blocked == error
        ));
    }

    #[test]
    fn dispatched_nodes_leave_candidates() {
        let plan = plan();
        let mut frontier = Frontier::new(&plan, None);
        let start = NodeId::from("start");
        frontier.dispatch(&start);
        assert!(!frontier.candidates(&plan).contains(&start));
        assert!(!frontier.is_finished(&start));
        frontier.finish(&start);
        assert!(frontier.is_finished(&start));
        assert_eq!(frontier.unfinished().len(), plan.region_members(None).len() - 1);
    }
}
