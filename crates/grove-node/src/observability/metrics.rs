//! Node metrics registry.

use grove_consensus::ConsensusMetrics;
use grove_pubqueue::QueueMetrics;
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Prometheus registry of a node and the metric families it shares with
/// every engine and the publish queue.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Consensus families, shared by all engines.
    pub consensus: ConsensusMetrics,
    /// Publish queue families.
    pub queue: QueueMetrics,
    /// Registered groups.
    pub groups: Gauge,
    /// Groups with a running engine.
    pub running_groups: Gauge,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics")
            .field("groups", &self.groups.get())
            .field("running_groups", &self.running_groups.get())
            .finish()
    }
}

impl NodeMetrics {
    /// Creates the registry with every family registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let consensus = ConsensusMetrics::new();
        consensus.register(&mut registry);

        let queue = QueueMetrics::new();
        queue.register(&mut registry);

        let groups = Gauge::default();
        registry.register("grove_groups", "Number of registered groups", groups.clone());

        let running_groups = Gauge::default();
        registry.register(
            "grove_running_groups",
            "Number of groups with a running engine",
            running_groups.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            consensus,
            queue,
            groups,
            running_groups,
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}
