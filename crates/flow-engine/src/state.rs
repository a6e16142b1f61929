//! Per-node execution state for a single run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{FlowGraph, NodeId};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Lifecycle state of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
}

impl NodeState {
    /// Completed and skipped nodes satisfy dependencies.
    pub fn is_done(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Skipped)
    }
}

/// Container and routing bookkeeping shown to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    /// One-based iteration currently running (Loop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_iterations: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<Value>,
    /// Children currently running, in launch order (Parallel).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_children: Vec<NodeId>,
    /// Handle chosen by a Conditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_branch: Option<String>,
    /// Handle chosen by a Switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_case: Option<String>,
}

impl ContainerMetadata {
    /// Record that a Parallel child started.
    pub fn child_started(&mut self, child_id: &str) {
        if !self.active_children.iter().any(|c| c == child_id) {
            self.active_children.push(child_id.to_string());
        }
    }

    /// Move a Parallel child from active to completed.
    pub fn child_finished(&mut self, child_id: &str, completed: bool) {
        self.active_children.retain(|c| c != child_id);
        if completed && !self.completed_children.iter().any(|c| c == child_id) {
            self.completed_children.push(child_id.to_string());
        }
    }

    /// Clear the per-iteration loop fields.
    pub fn clear_iteration(&mut self) {
        self.current_iteration = None;
        self.current_item = None;
    }
}

/// Execution record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    /// Resolved input values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present only for container and routing nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContainerMetadata>,
}

impl NodeExecution {
    pub fn pending(with_metadata: bool) -> Self {
        Self {
            state: NodeState::Pending,
            started_at_ms: None,
            finished_at_ms: None,
            inputs: None,
            output: None,
            error: None,
            metadata: with_metadata.then(ContainerMetadata::default),
        }
    }

    /// Return to `pending`, dropping everything recorded so far.
    pub fn reset(&mut self) {
        *self = Self::pending(self.metadata.is_some());
    }
}

/// State of every node in a run, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStateMap {
    nodes: HashMap<NodeId, NodeExecution>,
}

impl ExecutionStateMap {
    /// Every node of the graph starts out `pending`.
    pub fn for_graph(graph: &FlowGraph) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| {
                let with_metadata = n.kind.is_container() || n.kind.is_routing();
                (n.id.clone(), NodeExecution::pending(with_metadata))
            })
            .collect();
        Self { nodes }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.get(node_id)
    }

    /// State of a node; unknown nodes count as pending.
    pub fn state(&self, node_id: &str) -> NodeState {
        self.nodes
            .get(node_id)
            .map(|e| e.state)
            .unwrap_or(NodeState::Pending)
    }

    pub fn is_done(&self, node_id: &str) -> bool {
        self.state(node_id).is_done()
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeExecution {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeExecution::pending(false))
    }

    pub fn mark_running(&mut self, node_id: &str, inputs: Option<Value>) -> &NodeExecution {
        let exec = self.entry(node_id);
        exec.state = NodeState::Running;
        exec.started_at_ms = Some(now_ms());
        exec.finished_at_ms = None;
        exec.inputs = inputs;
        exec.output = None;
        exec.error = None;
        exec
    }

    pub fn mark_completed(&mut self, node_id: &str, output: Value) -> &NodeExecution {
        let exec = self.entry(node_id);
        exec.state = NodeState::Completed;
        exec.finished_at_ms = Some(now_ms());
        exec.output = Some(output);
        exec
    }

    pub fn mark_error(&mut self, node_id: &str, message: impl Into<String>) -> &NodeExecution {
        let exec = self.entry(node_id);
        exec.state = NodeState::Error;
        exec.finished_at_ms = Some(now_ms());
        exec.error = Some(message.into());
        exec
    }

    pub fn mark_skipped(&mut self, node_id: &str) -> &NodeExecution {
        let exec = self.entry(node_id);
        exec.state = NodeState::Skipped;
        exec
    }

    /// Reset a node to `pending`. Returns whether anything changed.
    pub fn reset(&mut self, node_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(exec) if exec.state != NodeState::Pending => {
                exec.reset();
                true
            }
            _ => false,
        }
    }

    /// Mutable container metadata, created on first use.
    pub fn metadata_mut(&mut self, node_id: &str) -> &mut ContainerMetadata {
        self.entry(node_id)
            .metadata
            .get_or_insert_with(ContainerMetadata::default)
    }

    /// Replace a node's record wholesale.
    pub fn insert(&mut self, node_id: impl Into<NodeId>, execution: NodeExecution) {
        self.nodes.insert(node_id.into(), execution);
    }

    /// Move every record of `other` into this map, overwriting existing ones.
    pub fn absorb(&mut self, other: ExecutionStateMap) {
        self.nodes.extend(other.nodes);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeExecution)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|e| e.state == state).count()
    }
}
