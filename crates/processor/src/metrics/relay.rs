use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use std::time::Duration;

use super::{MetricsRegistry, Result};

/// Terminal outcome of a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    Retried,
    DeadLettered,
    Failed,
    Skipped,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Retried => "retried",
            OutcomeKind::DeadLettered => "dead_lettered",
            OutcomeKind::Failed => "failed",
            OutcomeKind::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CauseLabels {
    cause: String,
}

fn latency_histogram() -> Histogram {
    // 1ms .. ~32s
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

/// Metrics handle shared by every loop in the process
#[derive(Clone)]
pub struct RelayMetrics {
    registry: MetricsRegistry,
    records_consumed: Counter,
    records: Family<OutcomeLabels, Counter>,
    target_failures: Family<CauseLabels, Counter>,
    call_latency: Histogram,
    result_latency: Histogram,
    batch_duration: Histogram,
    commits: Counter,
    commit_conflicts: Counter,
    target_unavailable: Counter,
    loop_errors: Counter,
    ready_loops: Gauge,
    health_check_failures: Family<CauseLabels, Counter>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = MetricsRegistry::with_prefix("relay");
        let metrics = Self {
            registry: registry.clone(),
            records_consumed: Counter::default(),
            records: Family::default(),
            target_failures: Family::default(),
            call_latency: latency_histogram(),
            result_latency: latency_histogram(),
            batch_duration: latency_histogram(),
            commits: Counter::default(),
            commit_conflicts: Counter::default(),
            target_unavailable: Counter::default(),
            loop_errors: Counter::default(),
            ready_loops: Gauge::default(),
            health_check_failures: Family::default(),
        };

        registry.register(
            "records_consumed",
            "Records returned by broker polls",
            metrics.records_consumed.clone(),
        );
        registry.register(
            "records",
            "Records by terminal outcome",
            metrics.records.clone(),
        );
        registry.register(
            "target_failures",
            "Failed target calls by cause",
            metrics.target_failures.clone(),
        );
        registry.register(
            "target_call_latency_seconds",
            "Time until the target answered",
            metrics.call_latency.clone(),
        );
        registry.register(
            "target_result_latency_seconds",
            "Time from record timestamp until a successful target result",
            metrics.result_latency.clone(),
        );
        registry.register(
            "batch_duration_seconds",
            "Time to bring a batch to a terminal result",
            metrics.batch_duration.clone(),
        );
        registry.register("commits", "Successful offset commits", metrics.commits.clone());
        registry.register(
            "commit_conflicts",
            "Offset commits rejected by a rebalance",
            metrics.commit_conflicts.clone(),
        );
        registry.register(
            "target_unavailable",
            "Batches aborted because the target was unreachable",
            metrics.target_unavailable.clone(),
        );
        registry.register(
            "loop_errors",
            "Consumer loops terminated by an error",
            metrics.loop_errors.clone(),
        );
        registry.register(
            "ready_loops",
            "Consumer loops holding a partition assignment",
            metrics.ready_loops.clone(),
        );
        registry.register(
            "health_check_failures",
            "Failed health checks by reason",
            metrics.health_check_failures.clone(),
        );

        metrics
    }

    pub fn records_consumed(&self, count: usize) {
        self.records_consumed.inc_by(count as u64);
    }

    pub fn record_outcome(&self, outcome: OutcomeKind) {
        self.record_outcomes(outcome, 1);
    }

    pub fn record_outcomes(&self, outcome: OutcomeKind, count: usize) {
        if count == 0 {
            return;
        }
        self.records
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc_by(count as u64);
    }

    /// Observe one completed target call, successful or not
    pub fn observe_call(
        &self,
        call_latency: Option<Duration>,
        result_latency: Option<Duration>,
        failure_cause: Option<&str>,
    ) {
        if let Some(latency) = call_latency {
            self.call_latency.observe(latency.as_secs_f64());
        }
        if let Some(latency) = result_latency {
            self.result_latency.observe(latency.as_secs_f64());
        }
        if let Some(cause) = failure_cause {
            self.target_failures
                .get_or_create(&CauseLabels {
                    cause: cause.to_string(),
                })
                .inc();
        }
    }

    pub fn observe_batch(&self, elapsed: Duration) {
        self.batch_duration.observe(elapsed.as_secs_f64());
    }

    pub fn commit_succeeded(&self) {
        self.commits.inc();
    }

    pub fn commit_conflict(&self) {
        self.commit_conflicts.inc();
    }

    pub fn target_unavailable(&self) {
        self.target_unavailable.inc();
    }

    pub fn loop_error(&self) {
        self.loop_errors.inc();
    }

    pub fn loop_ready(&self) {
        self.ready_loops.inc();
    }

    pub fn loop_not_ready(&self) {
        self.ready_loops.dec();
    }

    pub fn health_check_failed(&self, reason: &str) {
        self.health_check_failures
            .get_or_create(&CauseLabels {
                cause: reason.to_string(),
            })
            .inc();
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String> {
        self.registry.encode()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_are_labelled() {
        let metrics = RelayMetrics::new();
        metrics.record_outcome(OutcomeKind::Success);
        metrics.record_outcomes(OutcomeKind::Skipped, 2);
        metrics.record_outcomes(OutcomeKind::Failed, 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"relay_records_total{outcome="success"} 1"#));
        assert!(text.contains(r#"relay_records_total{outcome="skipped"} 2"#));
        assert!(!text.contains(r#"outcome="failed""#));
    }

    #[test]
    fn test_call_observations() {
        let metrics = RelayMetrics::new();
        metrics.observe_call(Some(Duration::from_millis(20)), None, Some("status"));
        metrics.observe_call(
            Some(Duration::from_millis(5)),
            Some(Duration::from_millis(50)),
            None,
        );

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"relay_target_failures_total{cause="status"} 1"#));
        assert!(text.contains("relay_target_call_latency_seconds_count 2"));
        assert!(text.contains("relay_target_result_latency_seconds_count 1"));
    }

    #[test]
    fn test_ready_loops_gauge() {
        let metrics = RelayMetrics::new();
        metrics.loop_ready();
        metrics.loop_ready();
        metrics.loop_not_ready();

        let text = metrics.encode().unwrap();
        assert!(text.contains("relay_ready_loops 1"));
    }
}
