//! Event types for observing a run
//!
//! Events are sent from the engine to any consumer (a UI, a log, a test) to
//! report node state transitions and run lifecycle changes. They are never
//! required for correctness: a failing sink does not affect the run.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::result::RunResult;
use crate::session::RunStatus;
use crate::state::NodeExecution;

/// Trait for sending execution events
///
/// This abstracts over the transport mechanism (mpsc, a UI bridge, etc.)
/// so the engine can be embedded in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    /// The run was accepted and is about to execute
    #[serde(rename_all = "camelCase")]
    RunStarted {
        run_id: String,
        graph_id: String,
        node_count: usize,
    },

    /// A node changed state. Carries the node's full execution record.
    #[serde(rename_all = "camelCase")]
    NodeStateChanged {
        run_id: String,
        node_id: String,
        node_type: String,
        execution: NodeExecution,
    },

    /// The run paused at a node boundary
    #[serde(rename_all = "camelCase")]
    RunPaused { run_id: String },

    /// The run resumed after a pause
    #[serde(rename_all = "camelCase")]
    RunResumed { run_id: String },

    /// The run reached a terminal status
    #[serde(rename_all = "camelCase")]
    RunFinished {
        run_id: String,
        status: RunStatus,
        result: RunResult,
    },
}

impl ExecutionEvent {
    /// Run this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStateChanged { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunResumed { run_id }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: ExecutionEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Node state changes for one node, in emission order
    pub fn node_events(&self, node_id: &str) -> Vec<NodeExecution> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::NodeStateChanged {
                    node_id: id,
                    execution,
                    ..
                } if id == node_id => Some(execution),
                _ => None,
            })
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

/// Forwards events into a tokio unbounded channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}
