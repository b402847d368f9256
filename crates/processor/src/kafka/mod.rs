//! Kafka adapters
//!
//! [`KafkaBroker`] drives one consumer-group member for one consumer loop.
//! [`KafkaRecordProducer`] writes rerouted records to the retry and
//! dead-letter topics and is shared by all loops.

mod sink;
mod source;

pub use sink::KafkaRecordProducer;
pub use source::KafkaBroker;

use rdkafka::config::ClientConfig;
use relay_config::RelayConfig;

/// Settings shared by consumers and producers
fn base_client_config(config: &RelayConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.kafka_broker);

    for (key, value) in config.security_settings() {
        client_config.set(key, value);
    }

    client_config
}
