//! Integration tests against a real Kafka broker
//!
//! These tests start Kafka with testcontainers and need a docker daemon:
//!
//! ```bash
//! cargo test -p relay-processor --test kafka_integration -- --ignored --nocapture
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use relay_config::RelayConfig;
use relay_processor::{Broker, KafkaBroker, KafkaRecordProducer, RecordProducer};
use relay_types::{CommitCheckpoint, Envelope, Record, ORIGINAL_TOPIC_HEADER};
use serde_json::json;
use std::time::Duration;
use testcontainers::{clients::Cli, RunnableImage};
use testcontainers_modules::kafka::Kafka;

fn relay_config(bootstrap_servers: &str, topic: &str, group_id: &str) -> RelayConfig {
    serde_json::from_value(json!({
        "kafka_broker": bootstrap_servers,
        "topic": topic,
        "group_id": group_id,
        "sending_protocol": "http",
        "target": "http://localhost:8080/consume",
        "retry_topic": format!("{topic}-retry"),
    }))
    .expect("valid relay config")
}

async fn produce(bootstrap_servers: &str, topic: &str, records: &[(&str, &str)]) {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("message.timeout.ms", "10000")
        .create()
        .expect("Failed to create producer");

    for (key, value) in records {
        producer
            .send(
                FutureRecord::to(topic).key(*key).payload(*value),
                Timeout::After(Duration::from_secs(10)),
            )
            .await
            .expect("Failed to produce");
    }
}

async fn poll_until(broker: &mut KafkaBroker, wanted: usize) -> Vec<Record> {
    let mut records = Vec::new();
    for _ in 0..60 {
        let batch = broker
            .poll(Duration::from_millis(500), 50)
            .await
            .expect("poll failed");
        records.extend(batch);
        if records.len() >= wanted {
            break;
        }
    }
    records
}

#[tokio::test]
#[ignore] // Requires docker
async fn test_poll_and_commit_round_trip() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Kafka::default()));
    let bootstrap_servers = format!("127.0.0.1:{}", container.get_host_port_ipv4(9093));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let topic = "relay-round-trip";
    produce(&bootstrap_servers, topic, &[("a", "1"), ("b", "2"), ("a", "3")]).await;

    let config = relay_config(&bootstrap_servers, topic, "relay-it");
    let mut broker = KafkaBroker::new(&config, 0).expect("Failed to create broker");
    broker.subscribe(topic).await.expect("subscribe failed");

    let records = poll_until(&mut broker, 3).await;
    assert_eq!(records.len(), 3);
    assert!(broker.has_assignment());
    assert!(records.iter().all(|r| r.timestamp.is_some()));

    let checkpoint = CommitCheckpoint::for_batch(&records);
    broker.commit(&checkpoint).await.expect("commit failed");
    broker.close().await;

    // A new member of the same group resumes after the committed offsets
    produce(&bootstrap_servers, topic, &[("c", "4")]).await;
    let mut resumed = KafkaBroker::new(&config, 1).expect("Failed to create broker");
    resumed.subscribe(topic).await.expect("subscribe failed");
    let records = poll_until(&mut resumed, 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.as_deref(), Some(b"c".as_ref()));
    resumed.close().await;
}

#[tokio::test]
#[ignore] // Requires docker
async fn test_rerouted_record_keeps_original_topic() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Kafka::default()));
    let bootstrap_servers = format!("127.0.0.1:{}", container.get_host_port_ipv4(9093));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let config = relay_config(&bootstrap_servers, "orders", "relay-retry-it");
    let producer = KafkaRecordProducer::new(&config).expect("Failed to create producer");

    let failed = Record::new("orders", 0, 42).with_key("k").with_value("payload");
    producer
        .produce(Envelope::retry(&failed, "orders-retry", 1))
        .await
        .expect("retry write not acknowledged");

    let mut broker = KafkaBroker::new(&config, 0).expect("Failed to create broker");
    broker.subscribe("orders-retry").await.expect("subscribe failed");
    let records = poll_until(&mut broker, 1).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header_str(ORIGINAL_TOPIC_HEADER), Some("orders"));
    assert_eq!(records[0].original_topic(), "orders");
    assert_eq!(records[0].retry_attempt(), 1);
    assert_eq!(records[0].value.as_deref(), Some(b"payload".as_ref()));
    broker.close().await;
}
