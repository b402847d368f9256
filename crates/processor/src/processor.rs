//! Batch processor
//!
//! Key groups are dispatched concurrently, bounded by a global limit and a
//! per-partition limit. Records inside one group run strictly one after the
//! other: the next record is not dispatched until the previous one has a
//! terminal outcome. Per-record failures become routing decisions; only an
//! unreachable target or an unacknowledged reroute aborts the batch.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use relay_types::{KeyGroup, Record, TopicPartition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ProcessorError, Result};
use crate::metrics::{OutcomeKind, RelayMetrics};
use crate::router::{FailureRouter, Routing};
use crate::target::TargetGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Maximum key groups in flight
    pub concurrency: usize,
    /// Maximum key groups in flight for one partition
    pub concurrency_per_partition: usize,
    /// Minimum record age before dispatch
    pub processing_delay: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            concurrency_per_partition: 1,
            processing_delay: Duration::ZERO,
        }
    }
}

/// Terminal result of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.retried + self.dead_lettered + self.failed + self.skipped
    }

    fn merge(&mut self, other: BatchResult) {
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// How long `record` still has to wait before it is old enough to dispatch
fn remaining_delay(record: &Record, delay: Duration) -> Duration {
    if delay.is_zero() {
        return Duration::ZERO;
    }
    match record.timestamp {
        Some(timestamp) => {
            let age = (Utc::now() - timestamp).to_std().unwrap_or(Duration::ZERO);
            delay.saturating_sub(age)
        }
        None => delay,
    }
}

#[derive(Clone)]
pub struct Processor {
    gateway: TargetGateway,
    router: FailureRouter,
    metrics: RelayMetrics,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        gateway: TargetGateway,
        router: FailureRouter,
        metrics: RelayMetrics,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            gateway,
            router,
            metrics,
            settings,
        }
    }

    /// Bring every record of every group to a terminal outcome
    pub async fn process(&self, groups: Vec<KeyGroup>) -> Result<BatchResult> {
        let started = Instant::now();
        let global = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut per_partition: HashMap<TopicPartition, Arc<Semaphore>> = HashMap::new();

        let mut in_flight = FuturesUnordered::new();
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let partition_limit = group.home_partition().map(|tp| {
                per_partition
                    .entry(tp)
                    .or_insert_with(|| {
                        Arc::new(Semaphore::new(self.settings.concurrency_per_partition.max(1)))
                    })
                    .clone()
            });
            let global = global.clone();

            in_flight.push(async move {
                let _partition_permit = match partition_limit {
                    Some(limit) => Some(
                        limit
                            .acquire_owned()
                            .await
                            .map_err(|e| ProcessorError::Unexpected(e.to_string()))?,
                    ),
                    None => None,
                };
                let _permit = global
                    .acquire_owned()
                    .await
                    .map_err(|e| ProcessorError::Unexpected(e.to_string()))?;

                let tally = self.process_group(group).await?;
                Ok::<_, ProcessorError>(tally)
            });
        }

        let mut result = BatchResult::default();
        while let Some(group_result) = in_flight.next().await {
            match group_result {
                Ok(tally) => result.merge(tally),
                Err(e) => {
                    if matches!(e, ProcessorError::TargetUnavailable(_)) {
                        self.metrics.target_unavailable();
                    }
                    return Err(e);
                }
            }
        }

        result.elapsed = started.elapsed();
        self.metrics.observe_batch(result.elapsed);
        Ok(result)
    }

    async fn process_group(&self, group: KeyGroup) -> Result<BatchResult> {
        let mut tally = BatchResult::default();

        for record in group.records {
            let wait = remaining_delay(&record, self.settings.processing_delay);
            if !wait.is_zero() {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    delay_ms = wait.as_millis() as u64,
                    "Holding record until processing delay elapses"
                );
                tokio::time::sleep(wait).await;
            }

            let outcome = self.gateway.call(record).await;
            if outcome.success() {
                tally.succeeded += 1;
                self.metrics.record_outcome(OutcomeKind::Success);
                continue;
            }

            if outcome.target_unreachable() {
                let cause = outcome
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_default();
                warn!(
                    topic = %outcome.record.topic,
                    partition = outcome.record.partition,
                    offset = outcome.record.offset,
                    "Target unreachable, aborting batch"
                );
                return Err(ProcessorError::TargetUnavailable(cause));
            }

            let kind = match self.router.route(&outcome).await? {
                Routing::Retried => {
                    tally.retried += 1;
                    OutcomeKind::Retried
                }
                Routing::DeadLettered => {
                    tally.dead_lettered += 1;
                    OutcomeKind::DeadLettered
                }
                Routing::Failed => {
                    tally.failed += 1;
                    OutcomeKind::Failed
                }
            };
            self.metrics.record_outcome(kind);
        }

        Ok(tally)
    }
}
