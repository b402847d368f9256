//! Readiness aggregation
//!
//! Combines the loops' assignment state with the target's own liveness probe
//! into the single answer served by the health endpoint.

use relay_config::ReadinessQuorum;
use std::sync::Arc;
use tracing::debug;

use crate::consumer_loop::LoopHandle;
use crate::metrics::RelayMetrics;
use crate::target::TargetProbe;

#[derive(Clone)]
pub struct ReadinessAggregator {
    loops: Vec<LoopHandle>,
    probe: Option<Arc<dyn TargetProbe>>,
    quorum: ReadinessQuorum,
    metrics: RelayMetrics,
}

impl ReadinessAggregator {
    pub fn new(
        loops: Vec<LoopHandle>,
        probe: Option<Arc<dyn TargetProbe>>,
        quorum: ReadinessQuorum,
        metrics: RelayMetrics,
    ) -> Self {
        Self {
            loops,
            probe,
            quorum,
            metrics,
        }
    }

    /// Loop half of the check, without probing the target
    pub fn loops_ready(&self) -> bool {
        if self.loops.is_empty() {
            return false;
        }
        match self.quorum {
            ReadinessQuorum::Any => self.loops.iter().any(LoopHandle::is_ready),
            ReadinessQuorum::All => self.loops.iter().all(LoopHandle::is_ready),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        if let Some(probe) = &self.probe {
            if !probe.is_alive().await {
                debug!("Health check failed: target not alive");
                self.metrics.health_check_failed("target");
                return false;
            }
        }

        if !self.loops_ready() {
            debug!(quorum = ?self.quorum, "Health check failed: consumer loops not ready");
            self.metrics.health_check_failed("loops");
            return false;
        }

        true
    }
}
