//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Tunables shared by every run started from one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Maximum node executions per run (prevents infinite loops).
    pub max_node_executions: u32,
    /// Cap on concurrently running children of a Parallel node. A node's own
    /// `maxConcurrency` takes precedence.
    pub max_parallelism: Option<usize>,
    /// Quantifier depth above which validation emits a warning.
    pub quantifier_depth_warning: usize,
    /// Timeout applied to each task invocation.
    pub task_timeout_ms: Option<u64>,
    /// Emit node events from inside subflows.
    pub forward_subflow_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_executions: 1000,
            max_parallelism: None,
            quantifier_depth_warning: 2,
            task_timeout_ms: None,
            forward_subflow_events: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&content)?;
        log::debug!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Set the maximum number of node executions.
    pub fn with_max_node_executions(mut self, max: u32) -> Self {
        self.max_node_executions = max;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = Some(max);
        self
    }

    pub fn with_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = Some(timeout_ms);
        self
    }
}
