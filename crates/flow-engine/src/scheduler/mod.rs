//! The interpreter: walks a flow graph and drives every node kind.
//!
//! A run is a sequence of regions. A region is the top level of a graph or
//! the body of a Loop; each of its entry nodes starts a chain that follows
//! unlabeled edges. Routing nodes run the chain behind the chosen handle and
//! mark everything reachable only from the other handles as skipped. Loop
//! bodies run once per item; Parallel children run concurrently in the order
//! computed by [`ParallelPlan`].
//!
//! The interpreter is the only writer of a run's [`RunState`]. Parallel
//! children each run against a fork of the state which is merged back when
//! the child finishes, so no lock guards run state.

pub mod parallel;

pub use parallel::ParallelPlan;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::condition::values_equal;
use crate::config::EngineConfig;
use crate::error::{FlowEngineError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::invoker::{TaskInvoker, TaskOutputs};
use crate::library::GraphLibrary;
use crate::resolver::{FlowContext, ResolveError, Resolver, Scope};
use crate::session::control::{Checkpoint, RunControl};
use crate::state::{ExecutionStateMap, NodeState};
use crate::types::{
    ConditionalConfig, FlowGraph, FlowNode, LoopConfig, NodeId, NodeKind, ParallelConfig,
    SubflowConfig, SwitchConfig, TaskConfig, HANDLE_DEFAULT, HANDLE_ELSE, HANDLE_THEN,
};
use crate::validation::prepare_inputs;

/// Everything a run shares across its forks and subflows.
pub struct RunEnvironment {
    pub run_id: String,
    pub invoker: Arc<dyn TaskInvoker>,
    pub library: Arc<GraphLibrary>,
    pub config: EngineConfig,
    pub sink: Arc<dyn EventSink>,
    pub control: RunControl,
    executions: AtomicU32,
}

impl RunEnvironment {
    pub fn new(
        run_id: impl Into<String>,
        invoker: Arc<dyn TaskInvoker>,
        library: Arc<GraphLibrary>,
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
        control: RunControl,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            invoker,
            library,
            config,
            sink,
            control,
            executions: AtomicU32::new(0),
        }
    }

    /// Node executions so far, counting every loop iteration.
    pub fn nodes_executed(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    fn count_execution(&self, node_id: &str) -> Result<()> {
        let limit = self.config.max_node_executions;
        let count = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if count > limit {
            return Err(FlowEngineError::ExecutionLimit {
                node_id: node_id.to_string(),
                limit,
            });
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.sink.send(event) {
            log::debug!("Dropping event for run '{}': {}", self.run_id, e);
        }
    }
}

/// Mutable state of one branch of a run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub context: FlowContext,
    pub scope: Scope,
    pub states: ExecutionStateMap,
    /// Step outputs recorded or cleared since this state was forked.
    written: Vec<NodeId>,
}

impl RunState {
    pub fn new(context: FlowContext, states: ExecutionStateMap) -> Self {
        Self {
            context,
            scope: Scope::new(),
            states,
            written: Vec::new(),
        }
    }

    fn record_output(&mut self, node_id: &str, output: Value) {
        self.context.set_step_output(node_id, output);
        self.written.push(node_id.to_string());
    }

    fn clear_output(&mut self, node_id: &str) {
        if self.context.clear_step(node_id).is_some() {
            self.written.push(node_id.to_string());
        }
    }

    /// Independent copy for a concurrently running child.
    fn fork(&self) -> Self {
        Self {
            context: self.context.clone(),
            scope: self.scope.clone(),
            states: ExecutionStateMap::default(),
            written: Vec::new(),
        }
    }

    /// Merge what a fork produced back into this state.
    fn absorb(&mut self, fork: RunState) {
        let RunState {
            context,
            states,
            written,
            ..
        } = fork;
        for node_id in written {
            match context.step_output(&node_id) {
                Some(output) => self.record_output(&node_id, output.clone()),
                None => self.clear_output(&node_id),
            }
        }
        self.states.absorb(states);
    }
}

/// Why an Exit node ended the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub node_id: NodeId,
    pub reason: Option<String>,
    pub outputs: HashMap<String, Value>,
}

/// Control-flow signal returned by every node.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    Exit(ExitSignal),
}

/// How a graph finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Every chain ran to its end; carries the resolved graph outputs.
    Finished(HashMap<String, Value>),
    /// An Exit node ended the run.
    Exited(ExitSignal),
}

struct NodeOutcome {
    output: Value,
    flow: Flow,
}

impl NodeOutcome {
    fn proceed(output: Value) -> Self {
        Self {
            output,
            flow: Flow::Continue,
        }
    }
}

fn to_object(map: &HashMap<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Interprets one graph. Subflows get their own interpreter over the same
/// run environment.
pub struct Interpreter<'r> {
    graph: &'r FlowGraph,
    env: &'r RunEnvironment,
    /// Prefix applied to node ids in events and errors (`<subflowNode>/`).
    prefix: String,
    emit_events: bool,
}

impl<'r> Interpreter<'r> {
    pub fn new(graph: &'r FlowGraph, env: &'r RunEnvironment) -> Self {
        Self {
            graph,
            env,
            prefix: String::new(),
            emit_events: true,
        }
    }

    fn nested(&self, graph: &'r FlowGraph, node_id: &str) -> Interpreter<'r> {
        Interpreter {
            graph,
            env: self.env,
            prefix: format!("{}{}/", self.prefix, node_id),
            emit_events: self.emit_events && self.env.config.forward_subflow_events,
        }
    }

    fn qualify(&self, node_id: &str) -> String {
        format!("{}{}", self.prefix, node_id)
    }

    /// Run the whole graph.
    pub async fn execute(&self, state: &mut RunState) -> Result<Completion> {
        match self.run_region(None, state).await? {
            Flow::Exit(signal) => Ok(Completion::Exited(signal)),
            Flow::Continue => Ok(Completion::Finished(self.graph_outputs(state))),
        }
    }

    /// Resolve the graph's declared outputs. Unresolvable references become null.
    pub fn graph_outputs(&self, state: &RunState) -> HashMap<String, Value> {
        let resolver = Resolver::new(&state.context, &state.scope);
        self.graph
            .outputs
            .iter()
            .map(|(name, template)| {
                let value = resolver.resolve_value(template).unwrap_or_else(|e| {
                    log::warn!(
                        "Output '{}' of graph '{}' could not be resolved: {}",
                        name,
                        self.graph.id,
                        e
                    );
                    Value::Null
                });
                (name.clone(), value)
            })
            .collect()
    }

    fn emit_node(&self, node: &FlowNode, state: &RunState) {
        let Some(execution) = state.states.get(&node.id) else {
            return;
        };
        log::debug!("Node '{}' -> {:?}", self.qualify(&node.id), execution.state);
        if !self.emit_events {
            return;
        }
        self.env.emit(ExecutionEvent::NodeStateChanged {
            run_id: self.env.run_id.clone(),
            node_id: self.qualify(&node.id),
            node_type: node.kind.label().to_string(),
            execution: execution.clone(),
        });
    }

    async fn checkpoint(&self, node_id: &str) -> Result<()> {
        match self.env.control.checkpoint().await {
            Checkpoint::Proceed => Ok(()),
            Checkpoint::Stopped => Err(FlowEngineError::Cancelled {
                node_id: self.qualify(node_id),
            }),
        }
    }

    /// Run every entry chain of a region in authoring order.
    fn run_region<'a>(&'a self, parent: Option<&'a str>, state: &'a mut RunState) -> BoxFuture<'a, Result<Flow>> {
        async move {
            let mut visited = HashSet::new();
            for entry in self.graph.region_entries(parent) {
                if let Flow::Exit(signal) = self.run_chain(&entry.id, state, &mut visited).await? {
                    return Ok(Flow::Exit(signal));
                }
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    /// Run the chain starting at `start`. Stops at skipped or already visited nodes.
    fn run_chain<'a>(
        &'a self,
        start: &'a str,
        state: &'a mut RunState,
        visited: &'a mut HashSet<NodeId>,
    ) -> BoxFuture<'a, Result<Flow>> {
        async move {
            for node in self.graph.chain_walk(start) {
                if state.states.state(&node.id) == NodeState::Skipped || !visited.insert(node.id.clone()) {
                    break;
                }
                if let Flow::Exit(signal) = self.execute_node(node, state, Some(&mut *visited)).await? {
                    return Ok(Flow::Exit(signal));
                }
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    /// Execute one node through its full lifecycle.
    ///
    /// `branches` carries the visited set of the enclosing region. Routing
    /// nodes walk their chosen branch only when it is present; Parallel
    /// children pass `None` and leave branch nodes to the Parallel plan.
    fn execute_node<'a>(
        &'a self,
        node: &'r FlowNode,
        state: &'a mut RunState,
        branches: Option<&'a mut HashSet<NodeId>>,
    ) -> BoxFuture<'a, Result<Flow>> {
        async move {
            self.checkpoint(&node.id).await?;
            if let Err(e) = self.env.count_execution(&self.qualify(&node.id)) {
                state.states.mark_error(&node.id, e.to_string());
                self.emit_node(node, state);
                return Err(e);
            }

            let inputs = match self.resolve_inputs(node, state) {
                Ok(inputs) => inputs,
                Err(e) => {
                    state.states.mark_error(&node.id, e.to_string());
                    self.emit_node(node, state);
                    return Err(e);
                }
            };
            state.states.mark_running(&node.id, inputs.as_ref().map(to_object));
            self.emit_node(node, state);

            let outcome = match &node.kind {
                NodeKind::Task(config) => self.run_task(node, config, inputs.unwrap_or_default()).await,
                NodeKind::Conditional(config) => self.run_conditional(node, config, state, branches).await,
                NodeKind::Switch(config) => self.run_switch(node, config, state, branches).await,
                NodeKind::Loop(config) => self.run_loop(node, config, state).await,
                NodeKind::Parallel(config) => self.run_parallel(node, config, state).await,
                NodeKind::Subflow(config) => self.run_subflow(node, config, inputs.unwrap_or_default()).await,
                NodeKind::Exit(config) => {
                    let outputs = inputs.unwrap_or_default();
                    log::info!("Exit node '{}' ended the run", self.qualify(&node.id));
                    Ok(NodeOutcome {
                        output: json!({ "reason": config.reason, "outputs": to_object(&outputs) }),
                        flow: Flow::Exit(ExitSignal {
                            node_id: self.qualify(&node.id),
                            reason: config.reason.clone(),
                            outputs,
                        }),
                    })
                }
            };

            // A stop requested while the node was in flight wins over its result.
            let outcome = match outcome {
                Ok(_) if self.env.control.is_stopped() => Err(FlowEngineError::Cancelled {
                    node_id: self.qualify(&node.id),
                }),
                other => other,
            };

            match outcome {
                Ok(NodeOutcome { output, flow }) => {
                    state.record_output(&node.id, output.clone());
                    state.states.mark_completed(&node.id, output);
                    self.emit_node(node, state);
                    Ok(flow)
                }
                Err(e) => {
                    state.states.mark_error(&node.id, e.to_string());
                    self.emit_node(node, state);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// Resolved bindings of Task, Subflow and Exit nodes.
    fn resolve_inputs(&self, node: &FlowNode, state: &RunState) -> Result<Option<HashMap<String, Value>>> {
        let bindings = match &node.kind {
            NodeKind::Task(c) => &c.inputs,
            NodeKind::Subflow(c) => &c.inputs,
            NodeKind::Exit(c) => &c.outputs,
            _ => return Ok(None),
        };
        Resolver::new(&state.context, &state.scope)
            .resolve_bindings(bindings)
            .map(Some)
            .map_err(|e| FlowEngineError::resolution(self.qualify(&node.id), e))
    }

    async fn run_task(
        &self,
        node: &FlowNode,
        config: &TaskConfig,
        inputs: HashMap<String, Value>,
    ) -> Result<NodeOutcome> {
        let attempts = config.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
        let backoff_ms = config.retry.as_ref().map_or(0, |r| r.backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.invoke_once(config, inputs.clone()).await {
                Ok(outputs) => return Ok(NodeOutcome::proceed(to_object(&outputs))),
                Err(message) => last_error = message,
            }
            if attempt < attempts {
                log::warn!(
                    "Task '{}' attempt {}/{} failed: {}",
                    self.qualify(&node.id),
                    attempt,
                    attempts,
                    last_error
                );
                if self.env.control.is_stopped() {
                    return Err(FlowEngineError::Cancelled {
                        node_id: self.qualify(&node.id),
                    });
                }
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }

        if let Some(fallback) = &config.fallback_outputs {
            log::warn!(
                "Task '{}' failed after {} attempt(s), using fallback outputs: {}",
                self.qualify(&node.id),
                attempts,
                last_error
            );
            return Ok(NodeOutcome::proceed(to_object(fallback)));
        }
        Err(FlowEngineError::task_failed(self.qualify(&node.id), last_error))
    }

    async fn invoke_once(
        &self,
        config: &TaskConfig,
        inputs: HashMap<String, Value>,
    ) -> std::result::Result<TaskOutputs, String> {
        let call = self.env.invoker.invoke(&config.task_id, inputs);
        let result = match self.env.config.task_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                Ok(result) => result,
                Err(_) => return Err(format!("timed out after {}ms", ms)),
            },
            None => call.await,
        };
        let outputs = result.map_err(|e| e.message)?;

        if let Some(missing) = config.outputs.iter().find(|name| !outputs.contains_key(*name)) {
            return Err(format!("missing declared output '{}'", missing));
        }
        Ok(outputs)
    }

    async fn run_conditional(
        &self,
        node: &FlowNode,
        config: &ConditionalConfig,
        state: &mut RunState,
        branches: Option<&mut HashSet<NodeId>>,
    ) -> Result<NodeOutcome> {
        let taken = config
            .condition
            .evaluate(&Resolver::new(&state.context, &state.scope))
            .map_err(|e| FlowEngineError::condition(self.qualify(&node.id), e))?;
        let handle = if taken { HANDLE_THEN } else { HANDLE_ELSE };

        state.states.metadata_mut(&node.id).active_branch = Some(handle.to_string());
        self.emit_node(node, state);

        let output = json!({ "branch": handle });
        let flow = self.route(node, handle, output.clone(), state, branches).await?;
        Ok(NodeOutcome { output, flow })
    }

    async fn run_switch(
        &self,
        node: &FlowNode,
        config: &SwitchConfig,
        state: &mut RunState,
        branches: Option<&mut HashSet<NodeId>>,
    ) -> Result<NodeOutcome> {
        let value = match Resolver::new(&state.context, &state.scope).resolve(&config.expression) {
            Ok(value) => Some(value),
            Err(e) if e.is_missing() => None,
            Err(e) => return Err(FlowEngineError::resolution(self.qualify(&node.id), e)),
        };

        let handle = value
            .as_ref()
            .and_then(|v| {
                config
                    .cases
                    .iter()
                    .find(|case| case.values.iter().any(|candidate| values_equal(candidate, v)))
            })
            .map_or(HANDLE_DEFAULT, |case| case.handle.as_str());

        state.states.metadata_mut(&node.id).matched_case = Some(handle.to_string());
        self.emit_node(node, state);

        let output = json!({ "case": handle, "value": value.unwrap_or(Value::Null) });
        let flow = self.route(node, handle, output.clone(), state, branches).await?;
        Ok(NodeOutcome { output, flow })
    }

    /// Skip the untaken branches, then walk the taken one if `branches` is given.
    async fn route(
        &self,
        node: &FlowNode,
        handle: &str,
        output: Value,
        state: &mut RunState,
        branches: Option<&mut HashSet<NodeId>>,
    ) -> Result<Flow> {
        self.skip_untaken(node, handle, state);
        state.record_output(&node.id, output);

        let Some(visited) = branches else {
            return Ok(Flow::Continue);
        };
        for edge in self.graph.outgoing_edges(&node.id, Some(handle)) {
            if let Flow::Exit(signal) = self.run_chain(&edge.target, state, visited).await? {
                return Ok(Flow::Exit(signal));
            }
        }
        Ok(Flow::Continue)
    }

    /// Mark every node reachable only from untaken handles as skipped.
    fn skip_untaken(&self, node: &FlowNode, taken: &str, state: &mut RunState) {
        let reach = |handle: &str| -> HashSet<NodeId> {
            self.graph
                .outgoing_edges(&node.id, Some(handle))
                .iter()
                .flat_map(|e| self.graph.reachable_from(&e.target))
                .collect()
        };

        let kept = reach(taken);
        let mut untaken: HashSet<NodeId> = HashSet::new();
        for handle in node.kind.output_handles() {
            if handle != taken {
                untaken.extend(reach(&handle));
            }
        }

        let mut skipped: Vec<&FlowNode> = untaken
            .iter()
            .filter(|id| !kept.contains(*id) && **id != node.id)
            .filter_map(|id| self.graph.find_node(id))
            .collect();
        self.graph.sort_by_authoring_order(&mut skipped);

        for skipped_node in skipped {
            if state.states.state(&skipped_node.id) == NodeState::Pending {
                state.states.mark_skipped(&skipped_node.id);
                self.emit_node(skipped_node, state);
            }
        }
    }

    /// All nodes nested anywhere inside a container.
    fn descendants(&self, container_id: &str) -> Vec<&'r FlowNode> {
        let mut out = Vec::new();
        let mut stack = vec![container_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            for child in self.graph.children_of(&id) {
                if seen.insert(child.id.as_str()) {
                    stack.push(child.id.clone());
                    out.push(child);
                }
            }
        }
        out
    }

    /// Outputs of the completed children, keyed by child id.
    fn collect_outputs(&self, children: &[&FlowNode], state: &RunState) -> Value {
        let outputs = children
            .iter()
            .filter(|child| state.states.state(&child.id) == NodeState::Completed)
            .filter_map(|child| {
                state
                    .context
                    .step_output(&child.id)
                    .map(|output| (child.id.clone(), output.clone()))
            })
            .collect();
        Value::Object(outputs)
    }

    async fn run_loop(&self, node: &FlowNode, config: &LoopConfig, state: &mut RunState) -> Result<NodeOutcome> {
        let items = Resolver::new(&state.context, &state.scope)
            .resolve_sequence(&config.items)
            .map_err(|e| match e {
                ResolveError::NotIterable(_) => FlowEngineError::configuration(self.qualify(&node.id), e.to_string()),
                other => FlowEngineError::resolution(self.qualify(&node.id), other),
            })?;

        let total = items.len();
        let body = self.descendants(&node.id);
        let children = self.graph.children_of(&node.id);
        let mut iterations = Vec::with_capacity(total);
        log::debug!("Loop '{}' iterating {} item(s)", self.qualify(&node.id), total);

        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                for body_node in &body {
                    state.clear_output(&body_node.id);
                    if state.states.reset(&body_node.id) {
                        self.emit_node(body_node, state);
                    }
                }
            }

            let meta = state.states.metadata_mut(&node.id);
            meta.current_iteration = Some(index + 1);
            meta.total_iterations = Some(total);
            meta.current_item = Some(item.clone());
            self.emit_node(node, state);

            state.scope.push(config.variable.clone(), item);
            if let Some(index_variable) = &config.index_variable {
                state.scope.push(index_variable.clone(), json!(index));
            }

            let flow = self.run_region(Some(node.id.as_str()), state).await;

            if config.index_variable.is_some() {
                state.scope.pop();
            }
            state.scope.pop();

            let flow = match flow {
                Ok(flow) => flow,
                Err(e) => {
                    state.states.metadata_mut(&node.id).clear_iteration();
                    return Err(e);
                }
            };
            iterations.push(self.collect_outputs(&children, state));

            if let Flow::Exit(signal) = flow {
                state.states.metadata_mut(&node.id).clear_iteration();
                return Ok(NodeOutcome {
                    output: Value::Array(iterations),
                    flow: Flow::Exit(signal),
                });
            }
        }

        state.states.metadata_mut(&node.id).clear_iteration();
        Ok(NodeOutcome::proceed(Value::Array(iterations)))
    }

    async fn run_parallel(
        &self,
        node: &FlowNode,
        config: &ParallelConfig,
        state: &mut RunState,
    ) -> Result<NodeOutcome> {
        let plan = ParallelPlan::build(self.graph, &node.id);
        let limit = config
            .max_concurrency
            .or(self.env.config.max_parallelism)
            .unwrap_or(usize::MAX)
            .max(1);

        let mut waiting: Vec<&'r FlowNode> = plan
            .order()
            .iter()
            .filter_map(|id| self.graph.find_node(id))
            .collect();
        let mut running: FuturesUnordered<BoxFuture<'_, (&'r FlowNode, RunState, Result<Flow>)>> =
            FuturesUnordered::new();
        let mut failure: Option<FlowEngineError> = None;
        let mut exit: Option<ExitSignal> = None;

        loop {
            if failure.is_none() && exit.is_none() && !self.env.control.is_stopped() {
                let mut i = 0;
                while i < waiting.len() && running.len() < limit {
                    let child = waiting[i];
                    if state.states.state(&child.id) == NodeState::Skipped {
                        waiting.remove(i);
                        continue;
                    }
                    if !plan.is_ready(&child.id, |dep| state.states.is_done(dep)) {
                        i += 1;
                        continue;
                    }
                    waiting.remove(i);

                    state.states.metadata_mut(&node.id).child_started(&child.id);
                    self.emit_node(node, state);

                    let mut fork = state.fork();
                    running.push(
                        async move {
                            let result = self.execute_node(child, &mut fork, None).await;
                            (child, fork, result)
                        }
                        .boxed(),
                    );
                }
            }

            let Some((child, fork, result)) = running.next().await else {
                break;
            };
            state.absorb(fork);
            state
                .states
                .metadata_mut(&node.id)
                .child_finished(&child.id, result.is_ok());
            self.emit_node(node, state);

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(signal)) => {
                    exit.get_or_insert(signal);
                }
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => log::debug!("Additional failure in parallel '{}': {}", node.id, e),
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let output = self.collect_outputs(&self.graph.children_of(&node.id), state);
        if let Some(signal) = exit {
            return Ok(NodeOutcome {
                output,
                flow: Flow::Exit(signal),
            });
        }
        if !waiting.is_empty() && !self.env.control.is_stopped() {
            let ids: Vec<&str> = waiting.iter().map(|n| n.id.as_str()).collect();
            return Err(FlowEngineError::configuration(
                self.qualify(&node.id),
                format!("children never became ready: {}", ids.join(", ")),
            ));
        }
        Ok(NodeOutcome::proceed(output))
    }

    async fn run_subflow(
        &self,
        node: &FlowNode,
        config: &SubflowConfig,
        inputs: HashMap<String, Value>,
    ) -> Result<NodeOutcome> {
        let env: &'r RunEnvironment = self.env;
        let graph = env
            .library
            .get(&config.graph_id)
            .ok_or_else(|| FlowEngineError::UnknownSubflow {
                node_id: self.qualify(&node.id),
                graph_id: config.graph_id.clone(),
            })?;

        let inputs = prepare_inputs(graph, inputs).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            FlowEngineError::configuration(self.qualify(&node.id), messages.join("; "))
        })?;

        let child = self.nested(graph, &node.id);
        let mut sub_state = RunState::new(FlowContext::new(inputs), ExecutionStateMap::for_graph(graph));
        let produced = match child.execute(&mut sub_state).await? {
            Completion::Finished(outputs) => outputs,
            Completion::Exited(signal) => {
                log::debug!("Subflow '{}' ended at exit node '{}'", graph.id, signal.node_id);
                signal.outputs
            }
        };

        let outputs = if config.outputs.is_empty() {
            produced
        } else {
            config
                .outputs
                .iter()
                .map(|name| {
                    let value = produced.get(name).cloned().unwrap_or_else(|| {
                        log::warn!("Subflow '{}' produced no output '{}'", graph.id, name);
                        Value::Null
                    });
                    (name.clone(), value)
                })
                .collect()
        };
        Ok(NodeOutcome::proceed(to_object(&outputs)))
    }
}
