//! Producer for the retry and dead-letter topics

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use relay_config::RelayConfig;
use relay_types::Envelope;
use std::time::Duration;
use tracing::debug;

use super::base_client_config;
use crate::error::{ProcessorError, Result};
use crate::router::RecordProducer;

/// Default time to wait for a delivery acknowledgement
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KafkaRecordProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaRecordProducer {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let producer: FutureProducer = base_client_config(config)
            .set("message.timeout.ms", DEFAULT_SEND_TIMEOUT.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self {
            producer,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }
}

#[async_trait]
impl RecordProducer for KafkaRecordProducer {
    async fn produce(&self, envelope: Envelope) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &envelope.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(&envelope.topic).headers(headers);
        if let Some(key) = &envelope.key {
            record = record.key(key.as_slice());
        }
        if let Some(value) = &envelope.value {
            record = record.payload(value.as_slice());
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| ProcessorError::production(envelope.topic.clone(), e.to_string()))?;

        debug!(
            topic = %envelope.topic,
            destination = envelope.destination.as_str(),
            partition,
            offset,
            "Produced rerouted record"
        );
        Ok(())
    }
}
