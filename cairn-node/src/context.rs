//! Per-node runtime context.

use std::sync::Arc;

use cairn_core::{config::Config, metrics::Metrics, NodeId};

/// Everything a node needs from its host, passed in explicitly.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub config: Arc<Config>,
    pub metrics: Metrics,
}

impl NodeContext {
    pub fn new(node_id: NodeId, config: Config) -> Self {
        Self {
            node_id,
            config: Arc::new(config),
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}
