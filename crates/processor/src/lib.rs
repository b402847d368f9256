//! Record pipeline for the topic relay
//!
//! Polled batches are grouped by key, dispatched to the target with bounded
//! concurrency while keeping per-key order, rerouted to retry or dead-letter
//! topics on failure, and committed only once every record is terminal.

pub mod broker;
pub mod consumer_loop;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod partitioner;
pub mod processor;
pub mod readiness;
pub mod router;
pub mod supervisor;
pub mod target;

pub use broker::Broker;
pub use consumer_loop::{ConsumerLoop, LoopExit, LoopHandle, LoopPhase, LoopSettings};
pub use error::{ErrorSeverity, ProcessorError, Result as ProcessorResult};
pub use health::HealthServer;
pub use kafka::{KafkaBroker, KafkaRecordProducer};
pub use metrics::{OutcomeKind, RelayMetrics};
pub use partitioner::{KeyPartitioner, Partitioned};
pub use processor::{BatchResult, Processor, ProcessorSettings};
pub use readiness::ReadinessAggregator;
pub use router::{FailureRouter, RecordProducer, Routing};
pub use supervisor::Supervisor;
pub use target::{
    HttpProbe, HttpTarget, TargetGateway, TargetProbe, TargetTransport, DEFAULT_PROBE_TIMEOUT,
};
