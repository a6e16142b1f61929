//! Flow Engine - Control-flow graph execution
//!
//! This crate runs flow graphs: directed graphs of task, routing and
//! container nodes authored in a visual editor. It supports:
//!
//! - Conditional and Switch routing with nested all/any/none conditions
//! - Loops over resolved sequences with scoped loop variables
//! - Parallel containers that schedule children by their internal edges
//! - Subflows, Exit nodes, task retries and fallback outputs
//! - Pause, step, resume and stop with per-node state snapshots
//!
//! # Architecture
//!
//! - `FlowGraph`: the serialized graph model (nodes, edges, containment)
//! - `validate_graph`: structural and reference checks before any run
//! - `Resolver`: `${scope.path}` references and string interpolation
//! - `Interpreter`: walks regions and chains, drives every node kind
//! - `FlowEngine` / `RunHandle`: starts runs and steers them
//! - `EventSink`: generic event streaming for observers
//! - `TaskInvoker`: the seam through which Task nodes reach real work
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{FlowBuilder, FlowEngine, RunOptions, NullEventSink};
//!
//! let graph = FlowBuilder::new("greet", "Greet")
//!     .input("name")
//!     .add_task("hello", "say_hello")
//!     .bind("who", "${inputs.name}")
//!     .output("message", "${hello.message}")
//!     .build();
//!
//! let engine = FlowEngine::new(invoker);
//! let handle = engine.start(graph, inputs, RunOptions::default(), Arc::new(NullEventSink))?;
//! let result = handle.wait().await;
//! ```

pub mod builder;
pub mod condition;
pub mod config;
pub mod error;
pub mod events;
pub mod invoker;
pub mod library;
pub mod resolver;
pub mod result;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod types;
pub mod validation;

// Re-export key types
pub use builder::FlowBuilder;
pub use condition::{ConditionError, ConditionNode, Quantifier};
pub use config::EngineConfig;
pub use error::{FlowEngineError, Result};
pub use events::{ChannelEventSink, EventSink, ExecutionEvent, NullEventSink, VecEventSink};
pub use invoker::{TaskError, TaskInvoker, TaskOutputs};
pub use library::{GraphLibrary, GraphMetadata};
pub use resolver::{FlowContext, ResolveError, Resolver, Scope};
pub use result::RunResult;
pub use scheduler::{Completion, Interpreter, ParallelPlan};
pub use session::{FlowEngine, RunHandle, RunOptions, RunStatus};
pub use state::{ContainerMetadata, ExecutionStateMap, NodeExecution, NodeState};
pub use types::{FlowEdge, FlowGraph, FlowNode, NodeKind};
pub use validation::{validate_graph, ValidationError, ValidationReport, ValidationWarning};
