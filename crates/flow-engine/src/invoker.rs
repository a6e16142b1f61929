//! The seam between the engine and whatever actually performs tasks.
//!
//! The engine passes a Task node's opaque `task_id` and its resolved inputs
//! to a [`TaskInvoker`] and records the returned outputs. How a task is
//! implemented is entirely up to the embedder.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Named outputs produced by a task.
pub type TaskOutputs = HashMap<String, Value>;

/// Failure reported by a task invoker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runs external tasks on behalf of the engine.
///
/// Invocations may be long-running; the engine awaits many of them
/// concurrently when a Parallel node fans out.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    /// Run a task with its resolved inputs and return its outputs.
    async fn invoke(&self, task_id: &str, inputs: HashMap<String, Value>) -> Result<TaskOutputs, TaskError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted invoker for engine tests.

    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Pair of signals for holding a task mid-invocation.
    #[derive(Clone, Default)]
    pub struct Gate {
        pub entered: Arc<Notify>,
        pub release: Arc<Notify>,
    }

    impl Gate {
        /// Wait until the gated task has started.
        pub async fn wait_entered(&self) {
            self.entered.notified().await;
        }

        /// Let the gated task finish.
        pub fn open(&self) {
            self.release.notify_one();
        }
    }

    /// Echoes inputs back as outputs unless told otherwise.
    #[derive(Default)]
    pub struct MockInvoker {
        outputs: Mutex<HashMap<String, TaskOutputs>>,
        failures: Mutex<HashMap<String, u32>>,
        gates: Mutex<HashMap<String, Gate>>,
        calls: Mutex<Vec<(String, HashMap<String, Value>)>>,
    }

    impl MockInvoker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Always return these outputs for `task_id`.
        pub fn respond(&self, task_id: &str, outputs: Value) {
            let map = match outputs {
                Value::Object(map) => map.into_iter().collect(),
                _ => HashMap::new(),
            };
            self.outputs.lock().unwrap().insert(task_id.to_string(), map);
        }

        /// Fail the next `times` invocations of `task_id`.
        pub fn fail_times(&self, task_id: &str, times: u32) {
            self.failures.lock().unwrap().insert(task_id.to_string(), times);
        }

        pub fn fail_always(&self, task_id: &str) {
            self.fail_times(task_id, u32::MAX);
        }

        /// Hold invocations of `task_id` until the returned gate is opened.
        pub fn gate(&self, task_id: &str) -> Gate {
            let gate = Gate::default();
            self.gates.lock().unwrap().insert(task_id.to_string(), gate.clone());
            gate
        }

        pub fn calls(&self) -> Vec<(String, HashMap<String, Value>)> {
            self.calls.lock().unwrap().clone()
        }

        /// Task ids in invocation order.
        pub fn call_ids(&self) -> Vec<String> {
            self.calls().into_iter().map(|(id, _)| id).collect()
        }
    }

    #[async_trait]
    impl TaskInvoker for MockInvoker {
        async fn invoke(&self, task_id: &str, inputs: HashMap<String, Value>) -> Result<TaskOutputs, TaskError> {
            self.calls
                .lock()
                .unwrap()
                .push((task_id.to_string(), inputs.clone()));

            let gate = self.gates.lock().unwrap().get(task_id).cloned();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(task_id) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining = remaining.saturating_sub(1);
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(TaskError::new(format!("task '{}' failed", task_id)));
            }

            let configured = self.outputs.lock().unwrap().get(task_id).cloned();
            Ok(configured.unwrap_or(inputs))
        }
    }
}
