//! Fluent builder for flow graphs
//!
//! Provides a fluent API for constructing graphs programmatically. Nodes are
//! stacked vertically in insertion order, so authoring order matches the
//! order of the `add_*` calls unless a position or order is set explicitly.

use serde_json::Value;

use crate::condition::ConditionNode;
use crate::types::{
    ConditionalConfig, ExitConfig, FlowEdge, FlowGraph, FlowNode, InputDeclaration, LoopConfig,
    NodeKind, ParallelConfig, RetryPolicy, SubflowConfig, SwitchCase, SwitchConfig, TaskConfig,
};

/// Vertical spacing between auto-placed nodes
const ROW_HEIGHT: f64 = 100.0;

/// Fluent builder for constructing flow graphs
///
/// # Example
///
/// ```ignore
/// let graph = FlowBuilder::new("flow-1", "My Flow")
///     .input("name")
///     .add_task("greet", "say-hello")
///     .bind("who", "${inputs.name}")
///     .add_task("log", "write-log")
///     .connect("greet", "log")
///     .output("greeting", "${greet.text}")
///     .build();
/// ```
pub struct FlowBuilder {
    graph: FlowGraph,
    edge_counter: usize,
}

impl FlowBuilder {
    /// Create a new flow builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            graph: FlowGraph::new(id, name),
            edge_counter: 0,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.graph.description = description.into();
        self
    }

    /// Declare a required input
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.graph.inputs.push(InputDeclaration::required(name));
        self
    }

    /// Declare an optional input with a default value
    pub fn input_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.graph.inputs.push(InputDeclaration::optional(name, default));
        self
    }

    /// Declare a graph output
    pub fn output(mut self, name: impl Into<String>, template: impl Into<Value>) -> Self {
        self.graph.outputs.insert(name.into(), template.into());
        self
    }

    /// Add a pre-built node
    pub fn add_node(mut self, mut node: FlowNode) -> Self {
        if node.position == (0.0, 0.0) {
            node.position = (0.0, self.graph.nodes.len() as f64 * ROW_HEIGHT);
        }
        self.graph.nodes.push(node);
        self
    }

    fn push(self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.add_node(FlowNode::new(id, kind))
    }

    /// Add a Task node
    pub fn add_task(self, id: impl Into<String>, task_id: impl Into<String>) -> Self {
        self.push(
            id,
            NodeKind::Task(TaskConfig {
                task_id: task_id.into(),
                ..Default::default()
            }),
        )
    }

    /// Add a Conditional node
    pub fn add_conditional(self, id: impl Into<String>, condition: ConditionNode) -> Self {
        self.push(id, NodeKind::Conditional(ConditionalConfig { condition }))
    }

    /// Add a Switch node
    pub fn add_switch(
        self,
        id: impl Into<String>,
        expression: impl Into<String>,
        cases: Vec<SwitchCase>,
    ) -> Self {
        self.push(
            id,
            NodeKind::Switch(SwitchConfig {
                expression: expression.into(),
                cases,
            }),
        )
    }

    /// Add a Loop node
    pub fn add_loop(
        self,
        id: impl Into<String>,
        items: impl Into<Value>,
        variable: impl Into<String>,
    ) -> Self {
        self.push(id, NodeKind::Loop(LoopConfig::new(items, variable)))
    }

    /// Add a Parallel node
    pub fn add_parallel(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::Parallel(ParallelConfig::default()))
    }

    /// Add a Subflow node
    pub fn add_subflow(self, id: impl Into<String>, graph_id: impl Into<String>) -> Self {
        self.push(
            id,
            NodeKind::Subflow(SubflowConfig {
                graph_id: graph_id.into(),
                ..Default::default()
            }),
        )
    }

    /// Add an Exit node
    pub fn add_exit(self, id: impl Into<String>, reason: Option<&str>) -> Self {
        self.push(
            id,
            NodeKind::Exit(ExitConfig {
                reason: reason.map(str::to_string),
                ..Default::default()
            }),
        )
    }

    fn last_node(&mut self) -> Option<&mut FlowNode> {
        self.graph.nodes.last_mut()
    }

    /// Place the most recently added node inside a container
    pub fn child_of(mut self, parent_id: impl Into<String>) -> Self {
        if let Some(node) = self.last_node() {
            node.parent_id = Some(parent_id.into());
        }
        self
    }

    /// Set the position of the most recently added node
    pub fn at(mut self, x: f64, y: f64) -> Self {
        if let Some(node) = self.last_node() {
            node.position = (x, y);
        }
        self
    }

    /// Set an explicit authoring index on the most recently added node
    pub fn with_order(mut self, order: i64) -> Self {
        if let Some(node) = self.last_node() {
            node.order = Some(order);
        }
        self
    }

    /// Add an input binding to the most recently added Task, Subflow, or
    /// Exit node (Exit bindings become its outputs)
    pub fn bind(mut self, name: impl Into<String>, template: impl Into<Value>) -> Self {
        if let Some(node) = self.last_node() {
            match &mut node.kind {
                NodeKind::Task(c) => {
                    c.inputs.insert(name.into(), template.into());
                }
                NodeKind::Subflow(c) => {
                    c.inputs.insert(name.into(), template.into());
                }
                NodeKind::Exit(c) => {
                    c.outputs.insert(name.into(), template.into());
                }
                _ => {}
            }
        }
        self
    }

    /// Declare the outputs of the most recently added Task (required names)
    /// or Subflow (names copied back)
    pub fn produces(mut self, names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        if let Some(node) = self.last_node() {
            match &mut node.kind {
                NodeKind::Task(c) => c.outputs = names,
                NodeKind::Subflow(c) => c.outputs = names,
                _ => {}
            }
        }
        self
    }

    /// Retry the most recently added Task
    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::Task(c),
            ..
        }) = self.last_node()
        {
            c.retry = Some(RetryPolicy {
                max_attempts,
                backoff_ms,
            });
        }
        self
    }

    /// Outputs recorded when the most recently added Task exhausts its attempts
    pub fn with_fallback(mut self, outputs: Value) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::Task(c),
            ..
        }) = self.last_node()
        {
            if let Value::Object(map) = outputs {
                c.fallback_outputs = Some(map.into_iter().collect());
            }
        }
        self
    }

    /// Bind the zero-based index on the most recently added Loop
    pub fn with_index_variable(mut self, name: impl Into<String>) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::Loop(c),
            ..
        }) = self.last_node()
        {
            c.index_variable = Some(name.into());
        }
        self
    }

    /// Cap concurrency on the most recently added Parallel
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::Parallel(c),
            ..
        }) = self.last_node()
        {
            c.max_concurrency = Some(max);
        }
        self
    }

    /// Connect two nodes with an unlabeled edge (auto-generates edge ID)
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edge_counter += 1;
        self.graph.edges.push(FlowEdge::new(
            format!("edge-{}", self.edge_counter),
            source,
            target,
        ));
        self
    }

    /// Connect a named handle of `source` to `target`
    pub fn connect_handle(
        mut self,
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edge_counter += 1;
        self.graph.edges.push(FlowEdge::labeled(
            format!("edge-{}", self.edge_counter),
            source,
            handle,
            target,
        ));
        self
    }

    /// Build the graph without validation
    pub fn build(self) -> FlowGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HANDLE_THEN;
    use serde_json::json;

    #[test]
    fn test_builder_basic() {
        let graph = FlowBuilder::new("f", "Flow")
            .with_description("demo")
            .input("name")
            .input_with_default("limit", json!(10))
            .add_task("a", "fetch")
            .bind("who", "${inputs.name}")
            .produces(&["body"])
            .with_retry(3, 5)
            .add_task("b", "store")
            .connect("a", "b")
            .output("body", "${a.body}")
            .build();

        assert_eq!(graph.description, "demo");
        assert_eq!(graph.inputs.len(), 2);
        assert!(graph.inputs[0].required);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges[0].id, "edge-1");
        assert!(graph.edges[0].source_handle.is_none());

        match &graph.nodes[0].kind {
            NodeKind::Task(c) => {
                assert_eq!(c.task_id, "fetch");
                assert_eq!(c.inputs.get("who"), Some(&json!("${inputs.name}")));
                assert_eq!(c.outputs, vec!["body".to_string()]);
                assert_eq!(c.retry.as_ref().map(|r| r.max_attempts), Some(3));
            }
            other => panic!("Expected task, got {:?}", other),
        }
    }

    #[test]
    fn test_insertion_order_is_authoring_order() {
        let graph = FlowBuilder::new("f", "Flow")
            .add_loop("l", "${inputs.xs}", "x")
            .add_task("second", "t")
            .child_of("l")
            .add_task("first", "t")
            .child_of("l")
            .at(0.0, 0.5)
            .build();

        let ids: Vec<&str> = graph.children_of("l").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_container_modifiers() {
        let graph = FlowBuilder::new("f", "Flow")
            .add_conditional("c", ConditionNode::simple("${inputs.ok}"))
            .add_parallel("p")
            .with_max_concurrency(2)
            .add_loop("l", json!([1, 2]), "n")
            .with_index_variable("i")
            .add_exit("stop", Some("done"))
            .bind("code", 1)
            .connect_handle("c", HANDLE_THEN, "p")
            .build();

        assert_eq!(graph.edges[0].source_handle.as_deref(), Some(HANDLE_THEN));
        assert!(matches!(
            &graph.nodes[1].kind,
            NodeKind::Parallel(ParallelConfig { max_concurrency: Some(2) })
        ));
        assert!(matches!(&graph.nodes[2].kind, NodeKind::Loop(c) if c.index_variable.as_deref() == Some("i")));
        assert!(matches!(&graph.nodes[3].kind, NodeKind::Exit(c) if c.outputs.contains_key("code")));
    }
}
