//! Execution plan for the children of a Parallel node.
//!
//! Only edges whose endpoints are both children of the Parallel node take
//! part. Children are ordered with Kahn's algorithm, ties broken by
//! authoring order. When the queue runs dry while children remain (they sit
//! on a cycle), the earliest remaining child is promoted to an entry point
//! and the sort continues.

use std::collections::{BTreeSet, HashMap};

use crate::types::{FlowGraph, NodeId};

/// Order and dependencies of one Parallel node's children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelPlan {
    order: Vec<NodeId>,
    dependencies: HashMap<NodeId, Vec<NodeId>>,
}

impl ParallelPlan {
    /// Plan the children of `parallel_id`.
    pub fn build(graph: &FlowGraph, parallel_id: &str) -> Self {
        let children = graph.children_of(parallel_id);
        let rank: HashMap<&str, usize> = children
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let internal: Vec<(usize, usize)> = graph
            .edges
            .iter()
            .filter_map(|e| Some((*rank.get(e.source.as_str())?, *rank.get(e.target.as_str())?)))
            .filter(|(s, t)| s != t)
            .collect();

        let mut in_degree = vec![0usize; children.len()];
        for &(_, target) in &internal {
            in_degree[target] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..children.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = vec![false; children.len()];
        let mut position = vec![usize::MAX; children.len()];
        let mut order = Vec::with_capacity(children.len());

        while order.len() < children.len() {
            let next = match ready.pop_first() {
                Some(next) => next,
                // Cycle: promote the earliest child not yet placed.
                None => match (0..children.len()).find(|&i| !placed[i]) {
                    Some(i) => i,
                    None => break,
                },
            };
            if placed[next] {
                continue;
            }
            placed[next] = true;
            position[next] = order.len();
            order.push(next);

            for &(source, target) in &internal {
                if source == next && !placed[target] {
                    in_degree[target] = in_degree[target].saturating_sub(1);
                    if in_degree[target] == 0 {
                        ready.insert(target);
                    }
                }
            }
        }

        // Dependencies are the internal edges that point forward in the order.
        let mut dependencies: HashMap<NodeId, Vec<NodeId>> = children
            .iter()
            .map(|n| (n.id.clone(), Vec::new()))
            .collect();
        for &(source, target) in &internal {
            if position[source] < position[target] {
                if let Some(deps) = dependencies.get_mut(&children[target].id) {
                    if !deps.contains(&children[source].id) {
                        deps.push(children[source].id.clone());
                    }
                }
            }
        }

        Self {
            order: order.into_iter().map(|i| children[i].id.clone()).collect(),
            dependencies,
        }
    }

    /// Children in execution order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Internal predecessors that must finish before `child_id` starts.
    pub fn dependencies(&self, child_id: &str) -> &[NodeId] {
        self.dependencies
            .get(child_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Children that start as soon as the Parallel node does.
    pub fn entry_points(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Whether every dependency of `child_id` satisfies `done`.
    pub fn is_ready(&self, child_id: &str, done: impl Fn(&str) -> bool) -> bool {
        self.dependencies(child_id).iter().all(|d| done(d))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;

    fn parallel(children: &[&str]) -> FlowBuilder {
        let mut builder = FlowBuilder::new("f", "Par").add_parallel("p");
        for child in children {
            builder = builder.add_task(*child, "t").child_of("p");
        }
        builder
    }

    #[test]
    fn test_independent_and_chained_children() {
        // {X, Y -> Z}
        let graph = parallel(&["x", "y", "z"]).connect("y", "z").build();
        let plan = ParallelPlan::build(&graph, "p");

        assert_eq!(plan.entry_points(), vec!["x", "y"]);
        assert!(plan.dependencies("x").is_empty());
        assert_eq!(plan.dependencies("z"), &["y".to_string()]);
        assert!(plan.is_ready("x", |_| false));
        assert!(!plan.is_ready("z", |_| false));
        assert!(plan.is_ready("z", |id| id == "y"));
    }

    #[test]
    fn test_edges_leaving_the_parallel_are_ignored() {
        let graph = parallel(&["x", "y"])
            .add_task("outside", "t")
            .connect("outside", "y")
            .connect("x", "outside")
            .build();
        let plan = ParallelPlan::build(&graph, "p");

        assert_eq!(plan.entry_points(), vec!["x", "y"]);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_ties_broken_by_authoring_order() {
        let graph = parallel(&["a", "b", "c", "d"])
            .connect("c", "a")
            .connect("d", "b")
            .build();
        let plan = ParallelPlan::build(&graph, "p");

        assert_eq!(plan.order(), &["c", "a", "d", "b"]);
        assert_eq!(plan.entry_points(), vec!["c", "d"]);
    }

    #[test]
    fn test_cycle_members_become_entry_points() {
        let graph = parallel(&["a", "b", "c"])
            .connect("a", "b")
            .connect("b", "a")
            .connect("b", "c")
            .build();
        let plan = ParallelPlan::build(&graph, "p");

        assert_eq!(plan.order(), &["a", "b", "c"]);
        assert_eq!(plan.entry_points(), vec!["a"]);
        assert_eq!(plan.dependencies("b"), &["a".to_string()]);
        assert_eq!(plan.dependencies("c"), &["b".to_string()]);
    }

    #[test]
    fn test_diamond() {
        let graph = parallel(&["top", "left", "right", "bottom"])
            .connect("top", "left")
            .connect("top", "right")
            .connect("left", "bottom")
            .connect("right", "bottom")
            .build();
        let plan = ParallelPlan::build(&graph, "p");

        assert_eq!(plan.order(), &["top", "left", "right", "bottom"]);
        assert_eq!(plan.dependencies("bottom").len(), 2);
    }
}
