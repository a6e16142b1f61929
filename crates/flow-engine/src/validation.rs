//! Pre-run validation of flow graphs
//!
//! Validates graph structure, containment, handles, conditions and variable
//! references, and detects cycles. Every problem is collected into a single
//! [`ValidationReport`] instead of failing on the first one.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::condition::ConditionError;
use crate::config::EngineConfig;
use crate::library::GraphLibrary;
use crate::resolver::{parse_template, reference_scope, Segment, INPUT_SCOPE};
use crate::types::{FlowGraph, FlowNode, NodeKind};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Two nodes share an id
    DuplicateNode { node_id: String },
    /// An edge references a non-existent node
    UnknownNode { edge_id: String, node_id: String },
    /// A node names a parent that does not exist
    UnknownParent { node_id: String, parent_id: String },
    /// A node's parent is not a Loop or Parallel
    ParentNotContainer { node_id: String, parent_id: String },
    /// Parent references loop back on themselves
    ContainmentCycle { node_id: String },
    /// A chain node has more than one unlabeled outgoing edge
    AmbiguousChain { node_id: String },
    /// An edge leaves a handle its source does not expose
    InvalidHandle {
        node_id: String,
        edge_id: String,
        handle: Option<String>,
    },
    /// Cycle detected among the listed nodes
    CycleDetected { node_ids: Vec<String> },
    /// A condition tree is malformed
    InvalidCondition { node_id: String, error: ConditionError },
    /// A reference token is malformed
    InvalidReference { node_id: Option<String>, reference: String },
    /// A reference names no input, node, or enclosing loop variable
    UnknownScope {
        node_id: Option<String>,
        reference: String,
    },
    /// A Loop source is a literal that is not a sequence
    LoopSourceNotIterable { node_id: String },
    /// A Subflow names a graph missing from the library
    UnknownSubflow { node_id: String, graph_id: String },
    /// The caller did not supply a required input
    MissingRequiredInput { name: String },
}

impl ValidationError {
    /// The node this error is attributed to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateNode { node_id }
            | Self::UnknownParent { node_id, .. }
            | Self::ParentNotContainer { node_id, .. }
            | Self::ContainmentCycle { node_id }
            | Self::AmbiguousChain { node_id }
            | Self::InvalidHandle { node_id, .. }
            | Self::InvalidCondition { node_id, .. }
            | Self::LoopSourceNotIterable { node_id }
            | Self::UnknownSubflow { node_id, .. } => Some(node_id),
            Self::UnknownNode { node_id, .. } => Some(node_id),
            Self::InvalidReference { node_id, .. } | Self::UnknownScope { node_id, .. } => {
                node_id.as_deref()
            }
            Self::CycleDetected { node_ids } => node_ids.first().map(String::as_str),
            Self::MissingRequiredInput { .. } => None,
        }
    }
}

impl ValidationError {
    /// Qualify every node id with the Subflow node that called the graph.
    fn within(self, subflow_id: &str) -> Self {
        let q = |id: String| format!("{}/{}", subflow_id, id);
        match self {
            Self::DuplicateNode { node_id } => Self::DuplicateNode { node_id: q(node_id) },
            Self::UnknownNode { edge_id, node_id } => Self::UnknownNode {
                edge_id,
                node_id: q(node_id),
            },
            Self::UnknownParent { node_id, parent_id } => Self::UnknownParent {
                node_id: q(node_id),
                parent_id: q(parent_id),
            },
            Self::ParentNotContainer { node_id, parent_id } => Self::ParentNotContainer {
                node_id: q(node_id),
                parent_id: q(parent_id),
            },
            Self::ContainmentCycle { node_id } => Self::ContainmentCycle { node_id: q(node_id) },
            Self::AmbiguousChain { node_id } => Self::AmbiguousChain { node_id: q(node_id) },
            Self::InvalidHandle {
                node_id,
                edge_id,
                handle,
            } => Self::InvalidHandle {
                node_id: q(node_id),
                edge_id,
                handle,
            },
            Self::CycleDetected { node_ids } => Self::CycleDetected {
                node_ids: node_ids.into_iter().map(q).collect(),
            },
            Self::InvalidCondition { node_id, error } => Self::InvalidCondition {
                node_id: q(node_id),
                error,
            },
            // Graph outputs of a subflow are attributed to the calling node.
            Self::InvalidReference { node_id, reference } => Self::InvalidReference {
                node_id: Some(node_id.map_or_else(|| subflow_id.to_string(), q)),
                reference,
            },
            Self::UnknownScope { node_id, reference } => Self::UnknownScope {
                node_id: Some(node_id.map_or_else(|| subflow_id.to_string(), q)),
                reference,
            },
            Self::LoopSourceNotIterable { node_id } => Self::LoopSourceNotIterable { node_id: q(node_id) },
            Self::UnknownSubflow { node_id, graph_id } => Self::UnknownSubflow {
                node_id: q(node_id),
                graph_id,
            },
            Self::MissingRequiredInput { name } => Self::MissingRequiredInput { name },
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "Duplicate node id '{}'", node_id),
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "Edge '{}' references unknown node '{}'", edge_id, node_id)
            }
            Self::UnknownParent { node_id, parent_id } => {
                write!(f, "Node '{}' references unknown parent '{}'", node_id, parent_id)
            }
            Self::ParentNotContainer { node_id, parent_id } => {
                write!(
                    f,
                    "Node '{}' has parent '{}' which is not a Loop or Parallel",
                    node_id, parent_id
                )
            }
            Self::ContainmentCycle { node_id } => {
                write!(f, "Node '{}' is its own ancestor", node_id)
            }
            Self::AmbiguousChain { node_id } => {
                write!(f, "Node '{}' has more than one unlabeled outgoing edge", node_id)
            }
            Self::InvalidHandle {
                node_id,
                edge_id,
                handle,
            } => match handle {
                Some(handle) => write!(
                    f,
                    "Edge '{}' leaves unknown handle '{}' of node '{}'",
                    edge_id, handle, node_id
                ),
                None => write!(
                    f,
                    "Edge '{}' leaves routing node '{}' without a handle",
                    edge_id, node_id
                ),
            },
            Self::CycleDetected { node_ids } => {
                write!(f, "Cycle detected between nodes: {}", node_ids.join(", "))
            }
            Self::InvalidCondition { node_id, error } => {
                write!(f, "Invalid condition on node '{}': {}", node_id, error)
            }
            Self::InvalidReference { node_id, reference } => match node_id {
                Some(id) => write!(f, "Malformed reference '{}' on node '{}'", reference, id),
                None => write!(f, "Malformed reference '{}' in graph outputs", reference),
            },
            Self::UnknownScope { node_id, reference } => match node_id {
                Some(id) => write!(f, "Unknown variable scope in '${{{}}}' on node '{}'", reference, id),
                None => write!(f, "Unknown variable scope in '${{{}}}' in graph outputs", reference),
            },
            Self::LoopSourceNotIterable { node_id } => {
                write!(f, "Loop '{}' iterates over a value that is not a sequence", node_id)
            }
            Self::UnknownSubflow { node_id, graph_id } => {
                write!(f, "Subflow '{}' references unknown graph '{}'", node_id, graph_id)
            }
            Self::MissingRequiredInput { name } => {
                write!(f, "Required input '{}' was not supplied", name)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Non-fatal findings
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// A condition nests quantifiers deeper than the configured threshold
    DeepQuantifier {
        node_id: String,
        depth: usize,
        limit: usize,
    },
    /// A container has no children
    EmptyContainer { node_id: String },
}

impl ValidationWarning {
    fn within(self, subflow_id: &str) -> Self {
        match self {
            Self::DeepQuantifier { node_id, depth, limit } => Self::DeepQuantifier {
                node_id: format!("{}/{}", subflow_id, node_id),
                depth,
                limit,
            },
            Self::EmptyContainer { node_id } => Self::EmptyContainer {
                node_id: format!("{}/{}", subflow_id, node_id),
            },
        }
    }
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeepQuantifier {
                node_id,
                depth,
                limit,
            } => write!(
                f,
                "Condition on node '{}' nests quantifiers {} deep (more than {})",
                node_id, depth, limit
            ),
            Self::EmptyContainer { node_id } => write!(f, "Container '{}' has no children", node_id),
        }
    }
}

/// Everything validation found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// No errors (warnings allowed)
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Fold in the report of a graph called by Subflow node `subflow_id`
    fn merge_within(&mut self, subflow_id: &str, other: ValidationReport) {
        self.merge(ValidationReport {
            errors: other.errors.into_iter().map(|e| e.within(subflow_id)).collect(),
            warnings: other.warnings.into_iter().map(|w| w.within(subflow_id)).collect(),
        });
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

/// Validate a flow graph
///
/// Returns all errors found (not just the first), plus warnings. Library
/// graphs reached through Subflow nodes are validated too, with their node
/// ids qualified by the calling node (`call/check`).
pub fn validate_graph(
    graph: &FlowGraph,
    config: &EngineConfig,
    library: &GraphLibrary,
) -> ValidationReport {
    let mut calling = HashSet::from([graph.id.clone()]);
    let report = check_graph(graph, config, library, &mut calling);

    for warning in &report.warnings {
        log::warn!("Graph '{}': {}", graph.id, warning);
    }
    report
}

/// `calling` holds the graphs on the current Subflow call path.
fn check_graph(
    graph: &FlowGraph,
    config: &EngineConfig,
    library: &GraphLibrary,
    calling: &mut HashSet<String>,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    validate_node_ids(graph, &mut report.errors);
    validate_edge_references(graph, &mut report.errors);
    let containment_ok = validate_containment(graph, &mut report);
    validate_handles(graph, &mut report.errors);
    detect_cycles(graph, &mut report.errors);
    validate_conditions(graph, config, &mut report);
    if containment_ok {
        validate_references(graph, &mut report.errors);
    }
    validate_node_configs(graph, library, &mut report.errors);
    validate_subflows(graph, config, library, calling, &mut report);
    report
}

/// Apply input declarations to caller-supplied inputs
///
/// Missing optional inputs take their defaults; missing required inputs are
/// errors. Undeclared inputs pass through unchanged.
pub fn prepare_inputs(
    graph: &FlowGraph,
    mut supplied: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, Vec<ValidationError>> {
    let mut errors = Vec::new();
    for decl in &graph.inputs {
        if supplied.contains_key(&decl.name) {
            continue;
        }
        match &decl.default {
            Some(default) => {
                supplied.insert(decl.name.clone(), default.clone());
            }
            None if decl.required => errors.push(ValidationError::MissingRequiredInput {
                name: decl.name.clone(),
            }),
            None => {}
        }
    }

    if errors.is_empty() {
        Ok(supplied)
    } else {
        Err(errors)
    }
}

fn validate_node_ids(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }
}

/// Check that all edge source/target nodes exist
fn validate_edge_references(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &graph.edges {
        if !node_ids.contains(edge.source.as_str()) {
            errors.push(ValidationError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
            });
        }
        if !node_ids.contains(edge.target.as_str()) {
            errors.push(ValidationError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
            });
        }
    }
}

/// Check parent references. Returns false when containment is cyclic.
fn validate_containment(graph: &FlowGraph, report: &mut ValidationReport) -> bool {
    let mut acyclic = true;

    for node in &graph.nodes {
        if let Some(parent_id) = &node.parent_id {
            match graph.find_node(parent_id) {
                None => report.errors.push(ValidationError::UnknownParent {
                    node_id: node.id.clone(),
                    parent_id: parent_id.clone(),
                }),
                Some(parent) if !parent.kind.is_container() => {
                    report.errors.push(ValidationError::ParentNotContainer {
                        node_id: node.id.clone(),
                        parent_id: parent_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        let mut seen = HashSet::new();
        let mut current = node.parent_id.as_deref();
        while let Some(parent_id) = current {
            if parent_id == node.id || !seen.insert(parent_id) {
                report.errors.push(ValidationError::ContainmentCycle {
                    node_id: node.id.clone(),
                });
                acyclic = false;
                break;
            }
            current = graph.find_node(parent_id).and_then(|p| p.parent_id.as_deref());
        }

        if node.kind.is_container() && graph.children_of(&node.id).is_empty() {
            report.warnings.push(ValidationWarning::EmptyContainer {
                node_id: node.id.clone(),
            });
        }
    }
    acyclic
}

fn inside_parallel(graph: &FlowGraph, node: &FlowNode) -> bool {
    node.parent_id
        .as_deref()
        .and_then(|p| graph.find_node(p))
        .map_or(false, |p| matches!(p.kind, NodeKind::Parallel(_)))
}

/// Check edge handles against what each source node exposes
fn validate_handles(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    for node in &graph.nodes {
        let handles = node.kind.output_handles();
        let mut unlabeled = 0;

        for edge in graph.all_outgoing_edges(&node.id) {
            match &edge.source_handle {
                None if node.kind.is_routing() => errors.push(ValidationError::InvalidHandle {
                    node_id: node.id.clone(),
                    edge_id: edge.id.clone(),
                    handle: None,
                }),
                None => unlabeled += 1,
                Some(handle) if !handles.contains(handle) => {
                    errors.push(ValidationError::InvalidHandle {
                        node_id: node.id.clone(),
                        edge_id: edge.id.clone(),
                        handle: Some(handle.clone()),
                    })
                }
                Some(_) => {}
            }
        }

        // Parallel children may fan out to several dependents.
        if unlabeled > 1 && !inside_parallel(graph, node) {
            errors.push(ValidationError::AmbiguousChain {
                node_id: node.id.clone(),
            });
        }
    }
}

/// Detect cycles using Kahn's algorithm (topological sort)
///
/// Edges between children of the same Parallel node are left out: the
/// Parallel scheduler breaks cycles among its children itself.
fn detect_cycles(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let parallel_internal = |source: &FlowNode, target: &FlowNode| {
        source.parent_id.is_some() && source.parent_id == target.parent_id && inside_parallel(graph, source)
    };

    let mut in_degree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in &graph.edges {
        let (Some(source), Some(target)) = (graph.find_node(&edge.source), graph.find_node(&edge.target)) else {
            continue;
        };
        if parallel_internal(source, target) {
            continue;
        }
        adjacency.entry(source.id.as_str()).or_default().push(target.id.as_str());
        *in_degree.entry(target.id.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    while let Some(node_id) = queue.pop_front() {
        for &target in adjacency.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(target) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    let remaining: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg > 0)
        .map(|(&id, _)| id)
        .collect();
    if !remaining.is_empty() {
        errors.push(ValidationError::CycleDetected {
            node_ids: remaining.into_iter().map(str::to_string).collect(),
        });
    }
}

fn validate_conditions(graph: &FlowGraph, config: &EngineConfig, report: &mut ValidationReport) {
    for node in &graph.nodes {
        let NodeKind::Conditional(cond) = &node.kind else {
            continue;
        };
        for error in cond.condition.validate() {
            report.errors.push(ValidationError::InvalidCondition {
                node_id: node.id.clone(),
                error,
            });
        }
        let depth = cond.condition.depth();
        if depth > config.quantifier_depth_warning {
            report.warnings.push(ValidationWarning::DeepQuantifier {
                node_id: node.id.clone(),
                depth,
                limit: config.quantifier_depth_warning,
            });
        }
    }
}

/// Every string template a node resolves at run time
fn node_templates(node: &FlowNode) -> Vec<&str> {
    let mut out = Vec::new();
    match &node.kind {
        NodeKind::Task(c) => c.inputs.values().for_each(|v| collect_strings(v, &mut out)),
        NodeKind::Conditional(c) => out.extend(c.condition.expressions()),
        NodeKind::Switch(c) => out.push(c.expression.as_str()),
        NodeKind::Loop(c) => collect_strings(&c.items, &mut out),
        NodeKind::Subflow(c) => c.inputs.values().for_each(|v| collect_strings(v, &mut out)),
        NodeKind::Exit(c) => c.outputs.values().for_each(|v| collect_strings(v, &mut out)),
        NodeKind::Parallel(_) => {}
    }
    out
}

fn check_template(
    graph: &FlowGraph,
    node_id: Option<&str>,
    loop_vars: &[&str],
    template: &str,
    errors: &mut Vec<ValidationError>,
) {
    let segments = match parse_template(template) {
        Ok(segments) => segments,
        Err(_) => {
            errors.push(ValidationError::InvalidReference {
                node_id: node_id.map(str::to_string),
                reference: template.to_string(),
            });
            return;
        }
    };

    for segment in segments {
        let Segment::Reference(reference) = segment else {
            continue;
        };
        let scope = reference_scope(reference);
        let known = scope == INPUT_SCOPE || loop_vars.contains(&scope) || graph.find_node(scope).is_some();
        if !known {
            errors.push(ValidationError::UnknownScope {
                node_id: node_id.map(str::to_string),
                reference: reference.to_string(),
            });
        }
    }
}

/// Check that every reference names `inputs`, a node, or an enclosing loop variable
fn validate_references(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    for node in &graph.nodes {
        let loop_vars = graph.loop_variables_in_scope(&node.id);
        for template in node_templates(node) {
            check_template(graph, Some(&node.id), &loop_vars, template, errors);
        }
    }

    let mut names: Vec<&String> = graph.outputs.keys().collect();
    names.sort();
    for name in names {
        if let Some(template) = graph.outputs.get(name) {
            let mut templates = Vec::new();
            collect_strings(template, &mut templates);
            for t in templates {
                check_template(graph, None, &[], t, errors);
            }
        }
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn validate_node_configs(graph: &FlowGraph, library: &GraphLibrary, errors: &mut Vec<ValidationError>) {
    for node in &graph.nodes {
        match &node.kind {
            NodeKind::Loop(c) if !matches!(c.items, Value::String(_) | Value::Array(_)) => {
                errors.push(ValidationError::LoopSourceNotIterable {
                    node_id: node.id.clone(),
                });
            }
            NodeKind::Subflow(c) if !library.contains(&c.graph_id) => {
                errors.push(ValidationError::UnknownSubflow {
                    node_id: node.id.clone(),
                    graph_id: c.graph_id.clone(),
                });
            }
            _ => {}
        }
    }
}

/// Validate the library graph behind every Subflow node
///
/// A graph already on the call path is not entered again.
fn validate_subflows(
    graph: &FlowGraph,
    config: &EngineConfig,
    library: &GraphLibrary,
    calling: &mut HashSet<String>,
    report: &mut ValidationReport,
) {
    for node in &graph.nodes {
        let NodeKind::Subflow(c) = &node.kind else {
            continue;
        };
        let Some(called) = library.get(&c.graph_id) else {
            continue;
        };
        if !calling.insert(c.graph_id.clone()) {
            log::debug!("Subflow '{}' re-enters graph '{}'", node.id, c.graph_id);
            continue;
        }
        let nested = check_graph(called, config, library, calling);
        calling.remove(&c.graph_id);
        report.merge_within(&node.id, nested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;
    use crate::condition::ConditionNode;
    use crate::types::{HANDLE_ELSE, HANDLE_THEN};
    use serde_json::json;

    fn validate(graph: &FlowGraph) -> ValidationReport {
        validate_graph(graph, &EngineConfig::default(), &GraphLibrary::new())
    }

    #[test]
    fn test_valid_graph() {
        let graph = FlowBuilder::new("f", "Valid")
            .input("name")
            .add_task("a", "fetch")
            .bind("who", "${inputs.name}")
            .add_conditional("c", ConditionNode::simple("${a.ok} == true"))
            .add_task("yes", "t")
            .add_task("no", "t")
            .connect("a", "c")
            .connect_handle("c", HANDLE_THEN, "yes")
            .connect_handle("c", HANDLE_ELSE, "no")
            .output("result", "${a.body}")
            .build();

        let report = validate(&graph);
        assert!(report.is_ok(), "Expected no errors, got: {:?}", report.errors);
    }

    #[test]
    fn test_edge_references_missing_node() {
        let graph = FlowBuilder::new("f", "Dangling")
            .add_task("a", "t")
            .connect("a", "ghost")
            .build();

        let report = validate(&graph);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::UnknownNode { node_id, .. } if node_id == "ghost"
        )));
    }

    #[test]
    fn test_detect_chain_cycle() {
        let graph = FlowBuilder::new("f", "Cyclic")
            .add_task("a", "t")
            .add_task("b", "t")
            .connect("a", "b")
            .connect("b", "a")
            .build();

        let report = validate(&graph);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::CycleDetected { node_ids } if node_ids == &vec!["a".to_string(), "b".to_string()]
        )));
    }

    #[test]
    fn test_parallel_internal_cycle_allowed() {
        let graph = FlowBuilder::new("f", "Par")
            .add_parallel("p")
            .add_task("x", "t")
            .child_of("p")
            .add_task("y", "t")
            .child_of("p")
            .connect("x", "y")
            .connect("y", "x")
            .build();

        let report = validate(&graph);
        assert!(!report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::CycleDetected { .. })));
    }

    #[test]
    fn test_containment_errors() {
        let graph = FlowBuilder::new("f", "Parents")
            .add_task("owner", "t")
            .add_task("a", "t")
            .child_of("owner")
            .add_task("b", "t")
            .child_of("nowhere")
            .build();

        let report = validate(&graph);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::ParentNotContainer { node_id, .. } if node_id == "a")));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownParent { node_id, .. } if node_id == "b")));
    }

    #[test]
    fn test_containment_cycle() {
        let graph = FlowBuilder::new("f", "Loops")
            .add_loop("l1", json!([1]), "x")
            .child_of("l2")
            .add_loop("l2", json!([1]), "y")
            .child_of("l1")
            .build();

        let report = validate(&graph);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::ContainmentCycle { .. })));
    }

    #[test]
    fn test_empty_quantifier_is_error() {
        let graph = FlowBuilder::new("f", "Empty")
            .add_conditional("c", ConditionNode::any(vec![]))
            .build();

        let report = validate(&graph);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0],
            ValidationError::InvalidCondition { node_id, error: ConditionError::EmptyQuantifier { .. } } if node_id == "c"
        ));
        assert_eq!(report.errors[0].node_id(), Some("c"));
    }

    #[test]
    fn test_deep_quantifier_warns() {
        let deep = ConditionNode::all(vec![ConditionNode::any(vec![ConditionNode::none(vec![
            ConditionNode::simple("${inputs.x}"),
        ])])]);
        let graph = FlowBuilder::new("f", "Deep").add_conditional("c", deep).build();

        let report = validate(&graph);
        assert!(report.is_ok());
        assert!(matches!(
            report.warnings.as_slice(),
            [ValidationWarning::DeepQuantifier { depth: 3, limit: 2, .. }]
        ));
    }

    #[test]
    fn test_unknown_scope() {
        let graph = FlowBuilder::new("f", "Scopes")
            .add_loop("l", "${inputs.rows}", "row")
            .add_task("inner", "t")
            .child_of("l")
            .bind("r", "${row.id}")
            .add_task("outer", "t")
            .bind("r", "${row.id}")
            .bind("s", "${missing.value}")
            .build();

        let report = validate(&graph);
        let scopes: Vec<&str> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::UnknownScope { node_id, reference } => {
                    assert_eq!(node_id.as_deref(), Some("outer"));
                    Some(reference.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.contains(&"row.id"));
        assert!(scopes.contains(&"missing.value"));
    }

    #[test]
    fn test_handles() {
        let graph = FlowBuilder::new("f", "Handles")
            .add_conditional("c", ConditionNode::Literal(true))
            .add_task("a", "t")
            .add_task("b", "t")
            .add_task("d", "t")
            .connect("c", "a")
            .connect_handle("c", "maybe", "b")
            .connect_handle("a", HANDLE_THEN, "b")
            .connect("b", "a")
            .connect("b", "d")
            .build();

        let report = validate(&graph);
        let invalid = report
            .errors
            .iter()
            .filter(|e| matches!(e, ValidationError::InvalidHandle { .. }))
            .count();
        assert_eq!(invalid, 3);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::AmbiguousChain { node_id } if node_id == "b")));
    }

    #[test]
    fn test_unknown_subflow_and_bad_loop_source() {
        let graph = FlowBuilder::new("f", "Configs")
            .add_subflow("s", "absent")
            .add_loop("l", json!(5), "x")
            .add_task("body", "t")
            .child_of("l")
            .build();

        let report = validate(&graph);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownSubflow { graph_id, .. } if graph_id == "absent")));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::LoopSourceNotIterable { node_id } if node_id == "l")));
    }

    #[test]
    fn test_subflow_graphs_are_validated() {
        let inner = FlowBuilder::new("inner", "Inner")
            .add_task("side", "side_effect")
            .add_conditional("c", ConditionNode::all(vec![]))
            .add_subflow("deeper", "absent")
            .connect("side", "c")
            .build();
        let library = GraphLibrary::new().with_graph(inner);
        let graph = FlowBuilder::new("f", "Outer").add_subflow("call", "inner").build();

        let report = validate_graph(&graph, &EngineConfig::default(), &library);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidCondition { node_id, .. } if node_id == "call/c")));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownSubflow { node_id, .. } if node_id == "call/deeper")));
    }

    #[test]
    fn test_recursive_subflow_terminates() {
        let looping = FlowBuilder::new("again", "Again")
            .add_subflow("call", "again")
            .add_task("t", "t")
            .bind("x", "${missing.v}")
            .build();
        let library = GraphLibrary::new().with_graph(looping.clone());

        let report = validate_graph(&looping, &EngineConfig::default(), &library);
        let unknown: Vec<_> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::UnknownScope { node_id, .. } => node_id.as_deref(),
                _ => None,
            })
            .collect();
        assert_eq!(unknown, vec!["t"]);
    }

    #[test]
    fn test_collects_multiple_errors() {
        let graph = FlowBuilder::new("f", "Many")
            .add_task("a", "t")
            .bind("x", "${nope}")
            .add_conditional("c", ConditionNode::all(vec![]))
            .connect("a", "ghost")
            .output("o", "${also_nope.v}")
            .build();

        let report = validate(&graph);
        assert!(report.errors.len() >= 4, "got: {:?}", report.errors);
        assert!(report.to_string().contains("ghost"));
    }

    #[test]
    fn test_prepare_inputs() {
        let graph = FlowBuilder::new("f", "Inputs")
            .input("required")
            .input_with_default("limit", json!(10))
            .build();

        let mut supplied = HashMap::new();
        supplied.insert("required".to_string(), json!("x"));
        supplied.insert("extra".to_string(), json!(1));
        let inputs = prepare_inputs(&graph, supplied).unwrap();
        assert_eq!(inputs.get("limit"), Some(&json!(10)));
        assert_eq!(inputs.get("extra"), Some(&json!(1)));

        let errors = prepare_inputs(&graph, HashMap::new()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::MissingRequiredInput {
                name: "required".to_string()
            }]
        );
    }
}
