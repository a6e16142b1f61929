//! Run sessions: start a flow, observe it, steer it.
//!
//! [`FlowEngine::start`] validates a graph, spawns the run on the tokio
//! runtime and hands back a [`RunHandle`]. The handle exposes the run status,
//! a snapshot of every node's execution record, and the pause, step, resume
//! and stop controls.

pub mod control;

pub use control::{Checkpoint, ControlMode, RunControl};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::error::{FlowEngineError, Result};
use crate::events::{EventError, EventSink, ExecutionEvent, NullEventSink};
use crate::invoker::TaskInvoker;
use crate::library::GraphLibrary;
use crate::resolver::FlowContext;
use crate::result::RunResult;
use crate::scheduler::{Completion, Interpreter, RunEnvironment, RunState};
use crate::state::ExecutionStateMap;
use crate::types::FlowGraph;
use crate::validation::{prepare_inputs, validate_graph, ValidationReport};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

/// Options for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Start paused and advance one node per [`RunHandle::step`].
    pub step_mode: bool,
}

impl RunOptions {
    pub fn step_mode() -> Self {
        Self { step_mode: true }
    }
}

/// Starts runs against a task invoker and a library of subflow graphs.
pub struct FlowEngine {
    invoker: Arc<dyn TaskInvoker>,
    library: Arc<GraphLibrary>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(invoker: Arc<dyn TaskInvoker>) -> Self {
        Self {
            invoker,
            library: Arc::new(GraphLibrary::new()),
            config: EngineConfig::default(),
        }
    }

    /// Graphs available to Subflow nodes.
    pub fn with_library(mut self, library: GraphLibrary) -> Self {
        self.library = Arc::new(library);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn library(&self) -> &GraphLibrary {
        &self.library
    }

    /// Validate a graph without running it.
    pub fn validate(&self, graph: &FlowGraph) -> ValidationReport {
        validate_graph(graph, &self.config, &self.library)
    }

    /// Validate and start a run. Must be called from within a tokio runtime.
    ///
    /// Validation problems and missing required inputs abort before anything
    /// is spawned or emitted.
    pub fn start(
        &self,
        graph: FlowGraph,
        inputs: HashMap<String, Value>,
        options: RunOptions,
        sink: Arc<dyn EventSink>,
    ) -> Result<RunHandle> {
        let mut report = self.validate(&graph);
        let inputs = match prepare_inputs(&graph, inputs) {
            Ok(inputs) => inputs,
            Err(errors) => {
                report.errors.extend(errors);
                HashMap::new()
            }
        };
        if !report.is_ok() {
            return Err(FlowEngineError::Validation(report));
        }

        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let control = RunControl::new(options.step_mode);
        let initial = if options.step_mode {
            RunStatus::Paused
        } else {
            RunStatus::Running
        };
        let (status_tx, _) = watch::channel(initial);
        let status = Arc::new(status_tx);
        let (result_tx, result_rx) = watch::channel(None);

        let snapshot = Arc::new(Mutex::new(ExecutionStateMap::for_graph(&graph)));
        let recorder: Arc<dyn EventSink> = Arc::new(RecordingSink {
            inner: sink,
            snapshot: snapshot.clone(),
        });

        let env = RunEnvironment::new(
            run_id.clone(),
            self.invoker.clone(),
            self.library.clone(),
            self.config.clone(),
            recorder.clone(),
            control.clone(),
        );

        log::info!(
            "Starting run '{}' of graph '{}' ({} nodes{})",
            run_id,
            graph.id,
            graph.nodes.len(),
            if options.step_mode { ", step mode" } else { "" }
        );

        let task_status = status.clone();
        tokio::spawn(async move {
            let result = run_to_completion(graph, inputs, env, &task_status).await;
            result_tx.send_replace(Some(result));
        });

        Ok(RunHandle {
            run_id,
            control,
            status,
            result: result_rx,
            snapshot,
            sink: recorder,
        })
    }

    /// Run a graph to completion without observing it.
    pub async fn run(&self, graph: FlowGraph, inputs: HashMap<String, Value>) -> Result<RunResult> {
        let handle = self.start(graph, inputs, RunOptions::default(), Arc::new(NullEventSink))?;
        Ok(handle.wait().await)
    }
}

async fn run_to_completion(
    graph: FlowGraph,
    inputs: HashMap<String, Value>,
    env: RunEnvironment,
    status: &watch::Sender<RunStatus>,
) -> RunResult {
    env.emit(ExecutionEvent::RunStarted {
        run_id: env.run_id.clone(),
        graph_id: graph.id.clone(),
        node_count: graph.nodes.len(),
    });

    let started = Instant::now();
    let mut state = RunState::new(FlowContext::new(inputs), ExecutionStateMap::for_graph(&graph));
    let outcome = Interpreter::new(&graph, &env).execute(&mut state).await;
    let elapsed = started.elapsed().as_millis() as u64;
    let executed = env.nodes_executed();

    let (final_status, result) = match outcome {
        Ok(Completion::Finished(outputs)) => (RunStatus::Completed, RunResult::success(outputs, executed, elapsed)),
        Ok(Completion::Exited(signal)) => (
            RunStatus::Completed,
            RunResult::terminated(signal.reason, signal.outputs, executed, elapsed),
        ),
        Err(e) if e.is_cancelled() => (RunStatus::Stopped, RunResult::cancelled(executed, elapsed)),
        Err(e) => {
            log::error!("Run '{}' failed: {}", env.run_id, e);
            (
                RunStatus::Error,
                RunResult::failure(e.node_id().map(str::to_string), e.to_string(), executed, elapsed),
            )
        }
    };

    log::info!(
        "Run '{}' finished as {:?}: {} node executions in {}ms",
        env.run_id,
        final_status,
        executed,
        elapsed
    );

    status.send_replace(final_status);
    env.emit(ExecutionEvent::RunFinished {
        run_id: env.run_id.clone(),
        status: final_status,
        result: result.clone(),
    });
    result
}

/// Tees events to the caller's sink and keeps the observer snapshot current.
struct RecordingSink {
    inner: Arc<dyn EventSink>,
    snapshot: Arc<Mutex<ExecutionStateMap>>,
}

impl EventSink for RecordingSink {
    fn send(&self, event: ExecutionEvent) -> std::result::Result<(), EventError> {
        if let ExecutionEvent::NodeStateChanged { node_id, execution, .. } = &event {
            self.snapshot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(node_id.clone(), execution.clone());
        }
        self.inner.send(event)
    }
}

/// Handle to a started run.
pub struct RunHandle {
    run_id: String,
    control: RunControl,
    status: Arc<watch::Sender<RunStatus>>,
    result: watch::Receiver<Option<RunResult>>,
    snapshot: Arc<Mutex<ExecutionStateMap>>,
    sink: Arc<dyn EventSink>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Copy of every node's current execution record.
    ///
    /// Subflow nodes appear under `<subflowNode>/<innerNode>` once they have
    /// changed state.
    pub fn snapshot(&self) -> ExecutionStateMap {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.sink.send(event) {
            log::debug!("Dropping event for run '{}': {}", self.run_id, e);
        }
    }

    /// Replace the status unless the run already finished.
    fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    /// Let the running node finish and start nothing new. No-op unless running.
    pub fn pause(&self) -> bool {
        if self.status() != RunStatus::Running || !self.control.pause() {
            return false;
        }
        if !self.transition(RunStatus::Running, RunStatus::Paused) {
            return false;
        }
        log::info!("Run '{}' paused", self.run_id);
        self.emit(ExecutionEvent::RunPaused {
            run_id: self.run_id.clone(),
        });
        true
    }

    /// Start exactly one more node, then pause again. No-op unless paused.
    pub fn step(&self) -> bool {
        self.status() == RunStatus::Paused && self.control.step()
    }

    /// Continue normally, leaving step mode. No-op unless paused.
    pub fn resume(&self) -> bool {
        if self.status() != RunStatus::Paused || !self.control.resume() {
            return false;
        }
        if !self.transition(RunStatus::Paused, RunStatus::Running) {
            return false;
        }
        log::info!("Run '{}' resumed", self.run_id);
        self.emit(ExecutionEvent::RunResumed {
            run_id: self.run_id.clone(),
        });
        true
    }

    /// Cancel the run. The node in flight is marked as an error; nothing else
    /// starts. Pending nodes stay pending.
    pub fn stop(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        let stopped = self.control.stop();
        if stopped {
            log::info!("Stop requested for run '{}'", self.run_id);
        }
        stopped
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> RunResult {
        let mut rx = self.result.clone();
        let finished = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        finished.unwrap_or_else(|| {
            RunResult::failure(None, format!("Run '{}' ended without a result", self.run_id), 0, 0)
        })
    }
}
