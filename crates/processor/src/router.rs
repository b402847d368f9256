//! Failure routing
//!
//! A failed record goes to the retry topic while its retry budget lasts, then
//! to the dead-letter topic. With neither topic configured the failure is
//! logged and counted, and the record is still terminal.

use async_trait::async_trait;
use relay_types::{CallOutcome, Destination, Envelope, Record};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{ProcessorError, Result};

/// Writes rerouted records back to the broker
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Resolves once the broker acknowledged the write
    async fn produce(&self, envelope: Envelope) -> Result<()>;
}

/// Where a failed record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Retried,
    DeadLettered,
    /// No topic available; only logged and counted
    Failed,
}

#[derive(Clone)]
pub struct FailureRouter {
    producer: Option<Arc<dyn RecordProducer>>,
    retry_topic: Option<String>,
    dead_letter_topic: Option<String>,
    retry_budget: u32,
}

impl FailureRouter {
    pub fn new(
        producer: Option<Arc<dyn RecordProducer>>,
        retry_topic: Option<String>,
        dead_letter_topic: Option<String>,
        retry_budget: u32,
    ) -> Self {
        Self {
            producer,
            retry_topic,
            dead_letter_topic,
            retry_budget,
        }
    }

    /// Router that never produces anything
    pub fn disabled() -> Self {
        Self::new(None, None, None, 0)
    }

    fn envelope_for(&self, record: &Record) -> Option<Envelope> {
        let attempt = record.retry_attempt();
        match (&self.retry_topic, &self.dead_letter_topic) {
            (Some(retry), _) if attempt < self.retry_budget => {
                Some(Envelope::retry(record, retry.clone(), attempt + 1))
            }
            (_, Some(dead_letter)) => Some(Envelope::dead_letter(record, dead_letter.clone())),
            _ => None,
        }
    }

    /// Route a failed outcome; only an unacknowledged write is an error
    pub async fn route(&self, outcome: &CallOutcome) -> Result<Routing> {
        let record = &outcome.record;
        let cause = outcome
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();

        let (envelope, producer) = match (self.envelope_for(record), &self.producer) {
            (Some(envelope), Some(producer)) => (envelope, producer),
            _ => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    cause = %cause,
                    "Record failed with no retry or dead-letter topic available"
                );
                return Ok(Routing::Failed);
            }
        };

        let routing = match envelope.destination {
            Destination::Retry => Routing::Retried,
            Destination::DeadLetter => Routing::DeadLettered,
        };
        let destination = envelope.topic.clone();

        producer.produce(envelope).await.map_err(|e| match e {
            ProcessorError::Production { .. } => e,
            other => ProcessorError::production(destination.clone(), other.to_string()),
        })?;

        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            destination = %destination,
            cause = %cause,
            "Rerouted failed record"
        );
        Ok(routing)
    }
}
