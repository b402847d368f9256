//! Consumer loop
//!
//! One loop owns one broker connection and runs
//! `Polling -> Partitioning -> Processing -> Committing -> Polling` until it is
//! stopped or fails. A checkpoint is committed only after the processor
//! reports the whole batch terminal. Stop is cooperative: it is observed at the
//! top of a cycle, so a batch in flight always drains first.

use futures::FutureExt;
use relay_types::CommitCheckpoint;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::ProcessorError;
use crate::metrics::{OutcomeKind, RelayMetrics};
use crate::partitioner::KeyPartitioner;
use crate::processor::Processor;

/// Pause after a transient poll error before polling again
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopPhase {
    Stopped = 0,
    Polling = 1,
    Partitioning = 2,
    Processing = 3,
    Committing = 4,
    Stopping = 5,
    Closed = 6,
}

impl LoopPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopPhase::Polling,
            2 => LoopPhase::Partitioning,
            3 => LoopPhase::Processing,
            4 => LoopPhase::Committing,
            5 => LoopPhase::Stopping,
            6 => LoopPhase::Closed,
            _ => LoopPhase::Stopped,
        }
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Stopped => "stopped",
            LoopPhase::Polling => "polling",
            LoopPhase::Partitioning => "partitioning",
            LoopPhase::Processing => "processing",
            LoopPhase::Committing => "committing",
            LoopPhase::Stopping => "stopping",
            LoopPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-loop state, written only by the owning loop
#[derive(Debug)]
struct LoopState {
    id: usize,
    running: AtomicBool,
    ready: AtomicBool,
    stop_requested: AtomicBool,
    phase: AtomicU8,
}

/// Read access to a loop's state plus the cooperative stop switch
#[derive(Debug, Clone)]
pub struct LoopHandle {
    state: Arc<LoopState>,
}

impl LoopHandle {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            state: Arc::new(LoopState {
                id,
                running: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                phase: AtomicU8::new(LoopPhase::Stopped as u8),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.state.id
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Whether the loop holds a partition assignment
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from_u8(self.state.phase.load(Ordering::SeqCst))
    }

    /// Ask the loop to finish its current cycle and close
    pub fn stop(&self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.state.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn set_running(&self, running: bool) {
        self.state.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn set_ready(&self, ready: bool) -> bool {
        self.state.ready.swap(ready, Ordering::SeqCst)
    }
}

/// Why a loop stopped
#[derive(Debug)]
pub enum LoopExit {
    /// Stop was requested
    Stopped,
    /// The target refused connections; a restart is needed
    TargetUnavailable(String),
    /// Uncategorized or non-recoverable failure
    Fatal(ProcessorError),
    /// Did not drain within the shutdown grace period
    Aborted,
}

impl LoopExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, LoopExit::Stopped)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub poll_timeout: Duration,
    pub poll_records: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            poll_records: 50,
        }
    }
}

pub struct ConsumerLoop<B: Broker> {
    broker: B,
    topic: String,
    partitioner: KeyPartitioner,
    processor: Processor,
    metrics: RelayMetrics,
    settings: LoopSettings,
    handle: LoopHandle,
}

impl<B: Broker> ConsumerLoop<B> {
    pub fn new(
        id: usize,
        broker: B,
        topic: impl Into<String>,
        partitioner: KeyPartitioner,
        processor: Processor,
        metrics: RelayMetrics,
        settings: LoopSettings,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            partitioner,
            processor,
            metrics,
            settings,
            handle: LoopHandle::new(id),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run until stopped or failed; the broker is closed on every path
    pub async fn run(mut self) -> LoopExit {
        let id = self.handle.id();
        self.handle.set_running(true);
        self.handle.set_phase(LoopPhase::Polling);
        info!(loop_id = id, topic = %self.topic, "Consumer loop started");

        let exit = match AssertUnwindSafe(self.cycle()).catch_unwind().await {
            Ok(exit) => exit,
            Err(_) => {
                error!(loop_id = id, "Consumer loop panicked");
                self.metrics.loop_error();
                LoopExit::Fatal(ProcessorError::Unexpected("consumer loop panicked".into()))
            }
        };

        self.handle.set_phase(LoopPhase::Stopping);
        if self.handle.set_ready(false) {
            self.metrics.loop_not_ready();
        }
        self.broker.close().await;
        self.handle.set_phase(LoopPhase::Closed);
        self.handle.set_running(false);

        match &exit {
            LoopExit::Stopped => info!(loop_id = id, "Consumer loop closed"),
            other => error!(loop_id = id, exit = ?other, "Consumer loop terminated"),
        }
        exit
    }

    async fn cycle(&mut self) -> LoopExit {
        let id = self.handle.id();

        if let Err(e) = self.broker.subscribe(&self.topic).await {
            error!(loop_id = id, error = %e, severity = %e.severity(), "Subscribe failed");
            self.metrics.loop_error();
            return LoopExit::Fatal(e);
        }

        loop {
            if self.handle.stop_requested() {
                return LoopExit::Stopped;
            }

            self.handle.set_phase(LoopPhase::Polling);
            let batch = match self
                .broker
                .poll(self.settings.poll_timeout, self.settings.poll_records)
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(loop_id = id, error = %e, "Transient poll error");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!(loop_id = id, error = %e, severity = %e.severity(), "Poll failed");
                    self.metrics.loop_error();
                    return LoopExit::Fatal(e);
                }
            };

            if !self.handle.is_ready() && self.broker.has_assignment() {
                self.handle.set_ready(true);
                self.metrics.loop_ready();
                info!(loop_id = id, "Consumer loop ready");
            }

            if batch.is_empty() {
                continue;
            }
            self.metrics.records_consumed(batch.len());
            let checkpoint = CommitCheckpoint::for_batch(&batch);

            self.handle.set_phase(LoopPhase::Partitioning);
            let partitioned = self.partitioner.partition(batch);
            let skipped = partitioned.skipped.len();
            if skipped > 0 {
                debug!(loop_id = id, skipped, "Skipped superseded records");
                self.metrics.record_outcomes(OutcomeKind::Skipped, skipped);
            }

            self.handle.set_phase(LoopPhase::Processing);
            match self.processor.process(partitioned.groups).await {
                Ok(mut result) => {
                    result.skipped += skipped;
                    debug!(
                        loop_id = id,
                        succeeded = result.succeeded,
                        retried = result.retried,
                        dead_lettered = result.dead_lettered,
                        failed = result.failed,
                        skipped = result.skipped,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        "Batch terminal"
                    );
                }
                Err(ProcessorError::TargetUnavailable(cause)) => {
                    error!(loop_id = id, cause = %cause, "Target unavailable, batch not committed");
                    return LoopExit::TargetUnavailable(cause);
                }
                Err(e) => {
                    error!(loop_id = id, error = %e, severity = %e.severity(), "Batch aborted");
                    self.metrics.loop_error();
                    return LoopExit::Fatal(e);
                }
            }

            self.handle.set_phase(LoopPhase::Committing);
            match self.broker.commit(&checkpoint).await {
                Ok(()) => self.metrics.commit_succeeded(),
                Err(e) if e.is_commit_conflict() => {
                    // The next poll resumes from the last committed offset
                    warn!(loop_id = id, error = %e, "Commit rejected, batch may be re-delivered");
                    self.metrics.commit_conflict();
                }
                Err(e) => {
                    error!(loop_id = id, error = %e, severity = %e.severity(), "Commit failed");
                    self.metrics.loop_error();
                    return LoopExit::Fatal(e);
                }
            }
        }
    }
}
