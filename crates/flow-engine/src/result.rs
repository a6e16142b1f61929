//! The outcome of a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Result of executing a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Whether the run finished without error or cancellation.
    pub success: bool,
    /// The graph's declared outputs, or an Exit node's outputs.
    pub outputs: HashMap<String, Value>,
    /// Set when an Exit node or a stop request ended the run.
    pub terminated_early: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    /// Node the failure is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of node executions, counting every loop iteration.
    pub nodes_executed: u32,
    /// Total execution time in milliseconds.
    pub execution_time_ms: u64,
}

impl RunResult {
    /// The run completed normally.
    pub fn success(outputs: HashMap<String, Value>, nodes_executed: u32, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            outputs,
            terminated_early: false,
            termination_reason: None,
            failed_node_id: None,
            error_message: None,
            nodes_executed,
            execution_time_ms,
        }
    }

    /// An Exit node ended the run.
    pub fn terminated(
        reason: Option<String>,
        outputs: HashMap<String, Value>,
        nodes_executed: u32,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            terminated_early: true,
            termination_reason: reason,
            ..Self::success(outputs, nodes_executed, execution_time_ms)
        }
    }

    /// The run failed with an error attributed to `failed_node_id`.
    pub fn failure(
        failed_node_id: Option<String>,
        error: impl Into<String>,
        nodes_executed: u32,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            terminated_early: false,
            termination_reason: None,
            failed_node_id,
            error_message: Some(error.into()),
            nodes_executed,
            execution_time_ms,
        }
    }

    /// The run was stopped by its caller.
    pub fn cancelled(nodes_executed: u32, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            terminated_early: true,
            termination_reason: Some("stopped".to_string()),
            failed_node_id: None,
            error_message: None,
            nodes_executed,
            execution_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors() {
        let mut outputs = HashMap::new();
        outputs.insert("total".to_string(), json!(3));

        let ok = RunResult::success(outputs.clone(), 4, 10);
        assert!(ok.success);
        assert!(!ok.terminated_early);

        let exited = RunResult::terminated(Some("done early".to_string()), outputs, 2, 5);
        assert!(exited.success);
        assert!(exited.terminated_early);
        assert_eq!(exited.termination_reason.as_deref(), Some("done early"));

        let failed = RunResult::failure(Some("fetch".to_string()), "boom", 1, 1);
        assert!(!failed.success);
        assert_eq!(failed.failed_node_id.as_deref(), Some("fetch"));
        assert!(failed.outputs.is_empty());

        let stopped = RunResult::cancelled(1, 1);
        assert!(!stopped.success);
        assert!(stopped.error_message.is_none());
    }

    #[test]
    fn test_serialization() {
        let result = RunResult::failure(Some("n".to_string()), "bad", 0, 0);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["failedNodeId"], "n");
        assert_eq!(json["errorMessage"], "bad");
        assert!(json.get("terminationReason").is_none());
    }
}
