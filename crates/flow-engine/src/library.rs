//! Registry of graphs that Subflow nodes can run.
//!
//! The library is an in-memory map keyed by graph id. It can be populated
//! programmatically or from a directory of `*.json` graph files.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::types::{FlowGraph, GraphId};

/// Metadata for a graph (for listing).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub node_count: usize,
}

/// Graphs available to Subflow nodes, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct GraphLibrary {
    graphs: HashMap<GraphId, FlowGraph>,
}

impl GraphLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` graph in a directory.
    ///
    /// Files that fail to parse are logged and skipped. Returns the number of
    /// graphs loaded.
    pub async fn load_dir(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut count = 0;

        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            if file_path.extension().map_or(false, |e| e == "json") {
                let content = tokio::fs::read_to_string(&file_path).await?;
                match serde_json::from_str::<FlowGraph>(&content) {
                    Ok(graph) => {
                        log::info!("Loaded graph '{}' from {:?}", graph.id, file_path);
                        self.insert(graph);
                        count += 1;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse graph from {:?}: {}", file_path, e);
                    }
                }
            }
        }
        Ok(count)
    }

    /// Insert or replace a graph. Returns the graph previously stored under the same id.
    pub fn insert(&mut self, graph: FlowGraph) -> Option<FlowGraph> {
        self.graphs.insert(graph.id.clone(), graph)
    }

    /// Builder-style insert.
    pub fn with_graph(mut self, graph: FlowGraph) -> Self {
        self.insert(graph);
        self
    }

    pub fn get(&self, id: &str) -> Option<&FlowGraph> {
        self.graphs.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<FlowGraph> {
        self.graphs.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.graphs.contains_key(id)
    }

    /// List all graphs, sorted by id.
    pub fn list(&self) -> Vec<GraphMetadata> {
        let mut list: Vec<GraphMetadata> = self
            .graphs
            .values()
            .map(|g| GraphMetadata {
                id: g.id.clone(),
                name: g.name.clone(),
                description: g.description.clone(),
                node_count: g.nodes.len(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
