//! Common test utilities for pipeline integration tests
//!
//! The fakes share one [`EventLog`] so tests can check the relative order of
//! target dispatches, completions, commits and closes.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_config::UnkeyedGrouping;
use relay_processor::{
    Broker, ConsumerLoop, FailureRouter, KeyPartitioner, LoopSettings, Processor,
    ProcessorError, ProcessorResult, ProcessorSettings, RecordProducer, RelayMetrics,
    TargetGateway, TargetTransport,
};
use relay_types::{Batch, CommitCheckpoint, Envelope, Record, TargetError, TargetResponse};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "orders";
pub const RETRY_TOPIC: &str = "orders-retry";
pub const DEAD_LETTER_TOPIC: &str = "orders-dlq";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dispatch(i64),
    Complete(i64),
    Commit(CommitCheckpoint),
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn position(&self, wanted: &Event) -> Option<usize> {
        self.0.lock().iter().position(|event| event == wanted)
    }

    pub fn dispatched(&self) -> Vec<i64> {
        self.0
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Dispatch(offset) => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn commits(&self) -> Vec<CommitCheckpoint> {
        self.0
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Commit(checkpoint) => Some(checkpoint.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn keyed(offset: i64, key: &str) -> Record {
    Record::new(TOPIC, 0, offset).with_key(key).with_value("ok")
}

pub fn keyed_on(partition: i32, offset: i64, key: &str) -> Record {
    Record::new(TOPIC, partition, offset)
        .with_key(key)
        .with_value("ok")
}

/// One scripted answer to a poll
pub enum Poll {
    Records(Batch),
    Fail(ProcessorError),
}

/// In-memory broker driven by a poll script
///
/// Once the script is exhausted every poll waits out its timeout and returns
/// an empty batch.
pub struct MemoryBroker {
    polls: VecDeque<Poll>,
    commit_results: VecDeque<ProcessorResult<()>>,
    assign_after_polls: usize,
    polls_seen: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    log: EventLog,
}

impl MemoryBroker {
    pub fn new(log: EventLog) -> Self {
        Self {
            polls: VecDeque::new(),
            commit_results: VecDeque::new(),
            assign_after_polls: 0,
            polls_seen: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    pub fn with_batch(mut self, batch: Batch) -> Self {
        self.polls.push_back(Poll::Records(batch));
        self
    }

    pub fn with_empty_polls(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.polls.push_back(Poll::Records(Vec::new()));
        }
        self
    }

    pub fn with_poll_error(mut self, err: ProcessorError) -> Self {
        self.polls.push_back(Poll::Fail(err));
        self
    }

    /// Answer the next commit with `result` instead of success
    pub fn with_commit_result(mut self, result: ProcessorResult<()>) -> Self {
        self.commit_results.push_back(result);
        self
    }

    /// Report a partition assignment only after `polls` polls
    pub fn assign_after(mut self, polls: usize) -> Self {
        self.assign_after_polls = polls;
        self
    }

    pub fn polls_seen(&self) -> Arc<AtomicUsize> {
        self.polls_seen.clone()
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&mut self, _topic: &str) -> ProcessorResult<()> {
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration, _max_records: usize) -> ProcessorResult<Batch> {
        self.polls_seen.fetch_add(1, Ordering::SeqCst);
        match self.polls.pop_front() {
            Some(Poll::Records(batch)) => Ok(batch),
            Some(Poll::Fail(err)) => Err(err),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    fn has_assignment(&self) -> bool {
        self.polls_seen.load(Ordering::SeqCst) > self.assign_after_polls
    }

    async fn commit(&mut self, checkpoint: &CommitCheckpoint) -> ProcessorResult<()> {
        if let Some(result) = self.commit_results.pop_front() {
            result?;
        }
        self.log.push(Event::Commit(checkpoint.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.push(Event::Closed);
    }
}

/// Target that answers after `latency`, failing records by value
///
/// A value of `fail` gets a 500, `down` a refused connection.
pub struct ScriptedTarget {
    latency: Duration,
    log: EventLog,
    calls: AtomicUsize,
}

impl ScriptedTarget {
    pub fn new(log: EventLog, latency: Duration) -> Self {
        Self {
            latency,
            log,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetTransport for ScriptedTarget {
    async fn send(&self, record: &Record) -> Result<TargetResponse, TargetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.push(Event::Dispatch(record.offset));
        tokio::time::sleep(self.latency).await;

        let result = match record.value.as_deref() {
            Some(b"fail") => Err(TargetError::Status(500)),
            Some(b"down") => Err(TargetError::Unreachable("connection refused".into())),
            _ => Ok(TargetResponse::new(self.latency)),
        };
        self.log.push(Event::Complete(record.offset));
        result
    }
}

/// Producer that keeps every envelope it was asked to write
#[derive(Default)]
pub struct RecordingProducer {
    produced: Mutex<Vec<Envelope>>,
}

impl RecordingProducer {
    pub fn produced(&self) -> Vec<Envelope> {
        self.produced.lock().clone()
    }
}

#[async_trait]
impl RecordProducer for RecordingProducer {
    async fn produce(&self, envelope: Envelope) -> ProcessorResult<()> {
        self.produced.lock().push(envelope);
        Ok(())
    }
}

/// Knobs for [`build_loop`]
pub struct Harness {
    pub concurrency: usize,
    pub concurrency_per_partition: usize,
    pub dedup: bool,
    pub retry_topic: Option<String>,
    pub dead_letter_topic: Option<String>,
    pub target_latency: Duration,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            concurrency: 4,
            concurrency_per_partition: 4,
            dedup: false,
            retry_topic: None,
            dead_letter_topic: None,
            target_latency: Duration::from_millis(10),
        }
    }
}

pub struct Built {
    pub consumer_loop: ConsumerLoop<MemoryBroker>,
    pub target: Arc<ScriptedTarget>,
    pub producer: Arc<RecordingProducer>,
    pub metrics: RelayMetrics,
}

pub fn build_loop(harness: Harness, broker: MemoryBroker, log: EventLog) -> Built {
    let metrics = RelayMetrics::new();
    let target = Arc::new(ScriptedTarget::new(log, harness.target_latency));
    let producer = Arc::new(RecordingProducer::default());

    let gateway = TargetGateway::new(target.clone(), metrics.clone());
    let router = FailureRouter::new(
        Some(producer.clone() as Arc<dyn RecordProducer>),
        harness.retry_topic,
        harness.dead_letter_topic,
        1,
    );
    let processor = Processor::new(
        gateway,
        router,
        metrics.clone(),
        ProcessorSettings {
            concurrency: harness.concurrency,
            concurrency_per_partition: harness.concurrency_per_partition,
            processing_delay: Duration::ZERO,
        },
    );

    let consumer_loop = ConsumerLoop::new(
        0,
        broker,
        TOPIC,
        KeyPartitioner::new(harness.dedup, UnkeyedGrouping::Singleton),
        processor,
        metrics.clone(),
        LoopSettings {
            poll_timeout: Duration::from_millis(100),
            poll_records: 50,
        },
    );

    Built {
        consumer_loop,
        target,
        producer,
        metrics,
    }
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
