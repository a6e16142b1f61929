//! Graph model for flow definitions.
//!
//! A flow is a set of nodes connected by directed edges. Loop and Parallel
//! nodes are containers that own children via `parent_id`; Conditional and
//! Switch nodes are routing nodes that pick one of several labeled outgoing
//! chains. The model is produced by an external loader and is never mutated
//! during a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::condition::ConditionNode;

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for an edge.
pub type EdgeId = String;

/// Unique identifier for a graph.
pub type GraphId = String;

/// Handle taken by a Conditional when its condition holds.
pub const HANDLE_THEN: &str = "then";

/// Handle taken by a Conditional when its condition fails.
pub const HANDLE_ELSE: &str = "else";

/// Handle taken by a Switch when no case matches.
pub const HANDLE_DEFAULT: &str = "default";

/// A flow graph: nodes, edges, and its declared inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    /// Unique identifier for this graph.
    pub id: GraphId,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Inputs the caller is expected to supply.
    #[serde(default)]
    pub inputs: Vec<InputDeclaration>,
    /// Output name to value template, resolved once the run finishes.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    /// Create a new empty graph.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Find a node by its ID.
    pub fn find_node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Position of a node in the declaration list, used as the final tie-break.
    fn declaration_index(&self, node_id: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id == node_id)
            .unwrap_or(usize::MAX)
    }

    /// Compare two nodes by authoring order.
    ///
    /// Explicit `order` wins over vertical position; horizontal position and
    /// then declaration order break remaining ties.
    pub fn authoring_cmp(&self, a: &FlowNode, b: &FlowNode) -> Ordering {
        a.sort_key()
            .total_cmp(&b.sort_key())
            .then(a.position.0.total_cmp(&b.position.0))
            .then(
                self.declaration_index(&a.id)
                    .cmp(&self.declaration_index(&b.id)),
            )
    }

    /// Sort node references in place by authoring order.
    pub fn sort_by_authoring_order(&self, nodes: &mut [&FlowNode]) {
        nodes.sort_by(|a, b| self.authoring_cmp(a, b));
    }

    /// Children of a container, sorted by authoring order.
    pub fn children_of(&self, container_id: &str) -> Vec<&FlowNode> {
        let mut children: Vec<&FlowNode> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == Some(container_id))
            .collect();
        self.sort_by_authoring_order(&mut children);
        children
    }

    /// Nodes with no parent container, sorted by authoring order.
    pub fn top_level_nodes(&self) -> Vec<&FlowNode> {
        let mut nodes: Vec<&FlowNode> = self.nodes.iter().filter(|n| n.parent_id.is_none()).collect();
        self.sort_by_authoring_order(&mut nodes);
        nodes
    }

    /// Outgoing edges of a node on a specific handle (`None` = unlabeled).
    pub fn outgoing_edges(&self, node_id: &str, handle: Option<&str>) -> Vec<&FlowEdge> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id && e.source_handle.as_deref() == handle)
            .collect()
    }

    /// All outgoing edges of a node regardless of handle.
    pub fn all_outgoing_edges(&self, node_id: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// All edges entering a node.
    pub fn incoming_edges(&self, node_id: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    /// Target of the single unlabeled outgoing edge, if there is one.
    pub fn next_in_chain(&self, node_id: &str) -> Option<&FlowNode> {
        self.outgoing_edges(node_id, None)
            .first()
            .and_then(|e| self.find_node(&e.target))
    }

    /// Walk the unlabeled chain starting at `start_id`.
    ///
    /// The walk includes the start node and follows single unlabeled edges
    /// while the current node auto-continues. It stops after a routing or
    /// Exit node, at a dead end, or when a node would repeat.
    pub fn chain_walk(&self, start_id: &str) -> Vec<&FlowNode> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.find_node(start_id);

        while let Some(node) = current {
            if !seen.insert(node.id.as_str()) {
                break;
            }
            chain.push(node);
            if !node.kind.auto_continues() {
                break;
            }
            current = self.next_in_chain(&node.id);
        }
        chain
    }

    /// Entry points of a region: nodes sharing `parent` that have no incoming
    /// edge from another node of the same region.
    pub fn region_entries(&self, parent: Option<&str>) -> Vec<&FlowNode> {
        let members: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == parent)
            .map(|n| n.id.as_str())
            .collect();

        let mut entries: Vec<&FlowNode> = self
            .nodes
            .iter()
            .filter(|n| members.contains(n.id.as_str()))
            .filter(|n| {
                !self
                    .incoming_edges(&n.id)
                    .iter()
                    .any(|e| members.contains(e.source.as_str()))
            })
            .collect();
        self.sort_by_authoring_order(&mut entries);
        entries
    }

    /// Every node reachable from `start_id` through any edge, including the
    /// children of containers met along the way. The start node is included.
    pub fn reachable_from(&self, start_id: &str) -> HashSet<NodeId> {
        let mut reached = HashSet::new();
        let mut stack = vec![start_id.to_string()];

        while let Some(id) = stack.pop() {
            if !reached.insert(id.clone()) {
                continue;
            }
            for edge in self.all_outgoing_edges(&id) {
                stack.push(edge.target.clone());
            }
            for child in self.children_of(&id) {
                stack.push(child.id.clone());
            }
        }
        reached
    }

    /// Loop variables visible to a node: those of every enclosing Loop.
    pub fn loop_variables_in_scope(&self, node_id: &str) -> Vec<&str> {
        let mut vars = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.find_node(node_id).and_then(|n| n.parent_id.as_deref());
        while let Some(parent_id) = current {
            if !seen.insert(parent_id) {
                break;
            }
            let Some(parent) = self.find_node(parent_id) else {
                break;
            };
            if let NodeKind::Loop(config) = &parent.kind {
                vars.push(config.variable.as_str());
                if let Some(index_var) = &config.index_variable {
                    vars.push(index_var.as_str());
                }
            }
            current = parent.parent_id.as_deref();
        }
        vars
    }
}

/// A declared flow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeclaration {
    pub name: String,
    /// Whether the caller must supply this input.
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller omits the input.
    #[serde(default)]
    pub default: Option<Value>,
}

impl InputDeclaration {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: Some(default),
        }
    }
}

/// A node in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Unique identifier for this node. Also its step id in the flow context.
    pub id: NodeId,
    /// Enclosing Loop or Parallel container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    /// Position in the authoring canvas (x, y).
    #[serde(default)]
    pub position: (f64, f64),
    /// Explicit authoring index, overriding vertical position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl FlowNode {
    /// Create a new top-level node.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            position: (0.0, 0.0),
            order: None,
            kind,
        }
    }

    /// Place this node inside a container.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the canvas position.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = (x, y);
        self
    }

    /// Set an explicit authoring index.
    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    fn sort_key(&self) -> f64 {
        self.order.map(|o| o as f64).unwrap_or(self.position.1)
    }
}

/// The kind of a node together with its kind-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke an external task.
    Task(TaskConfig),
    /// Two-way branch on a condition tree.
    Conditional(ConditionalConfig),
    /// N-way branch on a resolved value.
    Switch(SwitchConfig),
    /// Run the children once per element of a sequence.
    Loop(LoopConfig),
    /// Run the children concurrently, ordered by their internal edges.
    Parallel(ParallelConfig),
    /// Run another graph from the library.
    Subflow(SubflowConfig),
    /// Terminate the whole run.
    Exit(ExitConfig),
}

impl NodeKind {
    /// Get a human-readable label for this node kind.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Task(_) => "task",
            NodeKind::Conditional(_) => "conditional",
            NodeKind::Switch(_) => "switch",
            NodeKind::Loop(_) => "loop",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::Subflow(_) => "subflow",
            NodeKind::Exit(_) => "exit",
        }
    }

    /// Containers own children through `parent_id`.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Loop(_) | NodeKind::Parallel(_))
    }

    /// Routing nodes direct execution to one labeled chain.
    pub fn is_routing(&self) -> bool {
        matches!(self, NodeKind::Conditional(_) | NodeKind::Switch(_))
    }

    /// Whether execution follows this node's unlabeled edge once it completes.
    pub fn auto_continues(&self) -> bool {
        !self.is_routing() && !matches!(self, NodeKind::Exit(_))
    }

    /// Labeled output handles this node exposes.
    pub fn output_handles(&self) -> Vec<String> {
        match self {
            NodeKind::Conditional(_) => vec![HANDLE_THEN.to_string(), HANDLE_ELSE.to_string()],
            NodeKind::Switch(config) => {
                let mut handles: Vec<String> = config.cases.iter().map(|c| c.handle.clone()).collect();
                handles.push(HANDLE_DEFAULT.to_string());
                handles
            }
            _ => vec![],
        }
    }
}

/// Configuration for a Task node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Opaque identifier handed to the task invoker.
    pub task_id: String,
    /// Input name to value template.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Output names the task must produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Outputs recorded when every attempt fails.
    #[serde(default)]
    pub fallback_outputs: Option<HashMap<String, Value>>,
}

/// Retry policy for a Task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Configuration for a Conditional node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalConfig {
    pub condition: ConditionNode,
}

/// Configuration for a Switch node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConfig {
    /// Expression whose resolved value is matched against the cases.
    pub expression: String,
    /// Cases in declaration order.
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
}

/// A single Switch case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCase {
    /// Output handle taken when this case matches.
    pub handle: String,
    /// Acceptable values; any one matching selects the case.
    pub values: Vec<Value>,
}

impl SwitchCase {
    pub fn new(handle: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            handle: handle.into(),
            values,
        }
    }
}

/// Configuration for a Loop node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Template resolving to the sequence to iterate.
    pub items: Value,
    /// Name the current element is bound to inside the body.
    #[serde(default = "default_loop_variable")]
    pub variable: String,
    /// Optional name bound to the zero-based iteration index.
    #[serde(default)]
    pub index_variable: Option<String>,
}

fn default_loop_variable() -> String {
    "item".to_string()
}

impl LoopConfig {
    pub fn new(items: impl Into<Value>, variable: impl Into<String>) -> Self {
        Self {
            items: items.into(),
            variable: variable.into(),
            index_variable: None,
        }
    }
}

/// Configuration for a Parallel node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Cap on concurrently running children for this node.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Configuration for a Subflow node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowConfig {
    /// Library id of the graph to run.
    pub graph_id: GraphId,
    /// Input bindings seeding the subflow's input scope.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Subflow outputs copied back into this node's output. Empty copies all.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Configuration for an Exit node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitConfig {
    #[serde(default)]
    pub reason: Option<String>,
    /// Outputs reported in place of the graph's declared outputs.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    /// Unique identifier for this edge.
    pub id: EdgeId,
    /// Source node ID.
    pub source: NodeId,
    /// Source handle (e.g. "then", "else", a case handle). Unlabeled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target node ID.
    pub target: NodeId,
}

impl FlowEdge {
    /// Create an unlabeled edge.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
        }
    }

    /// Create an edge leaving a named handle.
    pub fn labeled(
        id: impl Into<String>,
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: Some(handle.into()),
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeKind::Task(TaskConfig {
                task_id: "noop".to_string(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_children_sorted_by_vertical_position() {
        let mut graph = FlowGraph::new("g", "G");
        graph.nodes.push(FlowNode::new("loop", NodeKind::Loop(LoopConfig::new("${inputs.xs}", "x"))));
        graph.nodes.push(task("low").with_parent("loop").at(0.0, 200.0));
        graph.nodes.push(task("high").with_parent("loop").at(0.0, 10.0));
        graph.nodes.push(task("pinned").with_parent("loop").at(0.0, 500.0).with_order(0));

        let ids: Vec<&str> = graph.children_of("loop").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["pinned", "high", "low"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let mut graph = FlowGraph::new("g", "G");
        graph.nodes.push(task("b"));
        graph.nodes.push(task("a"));

        let ids: Vec<&str> = graph.top_level_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_chain_walk_stops_after_routing_node() {
        let mut graph = FlowGraph::new("g", "G");
        graph.nodes.push(task("a"));
        graph.nodes.push(task("b"));
        graph.nodes.push(FlowNode::new(
            "cond",
            NodeKind::Conditional(ConditionalConfig {
                condition: ConditionNode::simple("true"),
            }),
        ));
        graph.nodes.push(task("c"));
        graph.edges.push(FlowEdge::new("e1", "a", "b"));
        graph.edges.push(FlowEdge::new("e2", "b", "cond"));
        graph.edges.push(FlowEdge::labeled("e3", "cond", HANDLE_THEN, "c"));

        let ids: Vec<&str> = graph.chain_walk("a").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "cond"]);
    }

    #[test]
    fn test_chain_walk_terminates_on_cycle() {
        let mut graph = FlowGraph::new("g", "G");
        graph.nodes.push(task("a"));
        graph.nodes.push(task("b"));
        graph.edges.push(FlowEdge::new("e1", "a", "b"));
        graph.edges.push(FlowEdge::new("e2", "b", "a"));

        assert_eq!(graph.chain_walk("a").len(), 2);
    }

    #[test]
    fn test_outgoing_edges_by_handle() {
        let mut graph = FlowGraph::new("g", "G");
        graph.edges.push(FlowEdge::labeled("e1", "cond", HANDLE_THEN, "a"));
        graph.edges.push(FlowEdge::labeled("e2", "cond", HANDLE_ELSE, "b"));
        graph.edges.push(FlowEdge::new("e3", "a", "b"));

        assert_eq!(graph.outgoing_edges("cond", Some(HANDLE_THEN)).len(), 1);
        assert_eq!(graph.outgoing_edges("cond", None).len(), 0);
        assert_eq!(graph.all_outgoing_edges("cond").len(), 2);
    }

    #[test]
    fn test_region_entries_ignore_outer_edges() {
        let mut graph = FlowGraph::new("g", "G");
        graph.nodes.push(task("before"));
        graph.nodes.push(FlowNode::new("par", NodeKind::Parallel(ParallelConfig::default())));
        graph.nodes.push(task("x").with_parent("par"));
        graph.nodes.push(task("y").with_parent("par").at(0.0, 1.0));
        graph.nodes.push(task("z").with_parent("par").at(0.0, 2.0));
        graph.edges.push(FlowEdge::new("e0", "before", "x"));
        graph.edges.push(FlowEdge::new("e1", "y", "z"));

        let ids: Vec<&str> = graph.region_entries(Some("par")).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[test]
    fn test_loop_variables_in_scope() {
        let mut graph = FlowGraph::new("g", "G");
        let mut outer = LoopConfig::new("${inputs.rows}", "row");
        outer.index_variable = Some("i".to_string());
        graph.nodes.push(FlowNode::new("outer", NodeKind::Loop(outer)));
        graph.nodes.push(
            FlowNode::new("inner", NodeKind::Loop(LoopConfig::new("${row}", "cell"))).with_parent("outer"),
        );
        graph.nodes.push(task("leaf").with_parent("inner"));

        assert_eq!(graph.loop_variables_in_scope("leaf"), vec!["cell", "row", "i"]);
        assert!(graph.loop_variables_in_scope("outer").is_empty());
    }

    #[test]
    fn test_node_serialization() {
        let node = task("fetch").at(10.0, 20.0);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["taskId"], "noop");
        assert_eq!(json["position"], serde_json::json!([10.0, 20.0]));

        let parsed: FlowNode = serde_json::from_value(serde_json::json!({
            "id": "l",
            "type": "loop",
            "items": "${inputs.xs}"
        }))
        .unwrap();
        match parsed.kind {
            NodeKind::Loop(config) => assert_eq!(config.variable, "item"),
            other => panic!("Expected loop, got {:?}", other),
        }
    }
}
