//! Shared Prometheus registry

use parking_lot::RwLock;
use prometheus_client::registry::{Metric, Registry};
use std::sync::Arc;

use super::MetricsError;

/// Thread-safe registry shared by every metric the relay exports
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    /// Create a registry whose metric names carry `prefix`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::with_prefix(prefix))),
        }
    }

    pub fn register(&self, name: &str, help: &str, metric: impl Metric) {
        self.registry.write().register(name, help, metric);
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let registry = self.registry.read();
        let mut buffer = String::new();

        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        Ok(buffer)
    }
}
