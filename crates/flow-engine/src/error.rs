//! Error types for the flow engine

use thiserror::Error;

use crate::condition::ConditionError;
use crate::resolver::ResolveError;
use crate::validation::ValidationReport;

/// Result type alias using FlowEngineError
pub type Result<T> = std::result::Result<T, FlowEngineError>;

/// Errors that can occur while validating or running a flow
#[derive(Debug, Error)]
pub enum FlowEngineError {
    /// The graph failed pre-run validation
    #[error("Graph validation failed: {0}")]
    Validation(ValidationReport),

    /// A node is configured in a way the engine cannot run
    #[error("Configuration error on node '{node_id}': {message}")]
    Configuration { node_id: String, message: String },

    /// A variable reference could not be resolved
    #[error("Resolution error on node '{node_id}': {source}")]
    Resolution {
        node_id: String,
        #[source]
        source: ResolveError,
    },

    /// A condition could not be evaluated
    #[error("Condition error on node '{node_id}': {source}")]
    Condition {
        node_id: String,
        #[source]
        source: ConditionError,
    },

    /// The task invoker reported a failure
    #[error("Task '{node_id}' failed: {message}")]
    TaskFailed { node_id: String, message: String },

    /// The run was stopped while this node was in flight
    #[error("Run cancelled at node '{node_id}'")]
    Cancelled { node_id: String },

    /// Too many node executions for a single run
    #[error("Execution limit reached at node '{node_id}' ({limit} nodes)")]
    ExecutionLimit { node_id: String, limit: u32 },

    /// A Subflow node names a graph that is not in the library
    #[error("Subflow node '{node_id}' references unknown graph '{graph_id}'")]
    UnknownSubflow { node_id: String, graph_id: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowEngineError {
    /// Create a configuration error for a node
    pub fn configuration(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a resolution error for a node
    pub fn resolution(node_id: impl Into<String>, source: ResolveError) -> Self {
        Self::Resolution {
            node_id: node_id.into(),
            source,
        }
    }

    /// Create a condition error for a node
    pub fn condition(node_id: impl Into<String>, source: ConditionError) -> Self {
        Self::Condition {
            node_id: node_id.into(),
            source,
        }
    }

    /// Create a task failure for a node
    pub fn task_failed(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// The node this error is attributed to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Configuration { node_id, .. }
            | Self::Resolution { node_id, .. }
            | Self::Condition { node_id, .. }
            | Self::TaskFailed { node_id, .. }
            | Self::Cancelled { node_id }
            | Self::ExecutionLimit { node_id, .. }
            | Self::UnknownSubflow { node_id, .. } => Some(node_id),
            Self::Validation(report) => report.errors.first().and_then(|e| e.node_id()),
            Self::Serialization(_) | Self::Io(_) => None,
        }
    }

    /// Whether this error represents a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_attribution() {
        let err = FlowEngineError::task_failed("fetch", "timeout");
        assert_eq!(err.node_id(), Some("fetch"));
        assert_eq!(err.to_string(), "Task 'fetch' failed: timeout");

        let err = FlowEngineError::ExecutionLimit {
            node_id: "body".to_string(),
            limit: 10,
        };
        assert_eq!(err.node_id(), Some("body"));

        let err = FlowEngineError::Io(std::io::Error::other("disk"));
        assert_eq!(err.node_id(), None);
    }

    #[test]
    fn test_cancelled() {
        let err = FlowEngineError::Cancelled {
            node_id: "n".to_string(),
        };
        assert!(err.is_cancelled());
        assert!(!FlowEngineError::configuration("n", "bad").is_cancelled());
    }
}
