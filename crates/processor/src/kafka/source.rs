//! Kafka consumer side of a consumer loop
//!
//! Offsets are never auto-committed; the loop commits a checkpoint only after
//! the batch it covers is terminal.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use relay_config::RelayConfig;
use relay_types::{Batch, CommitCheckpoint, Record};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::base_client_config;
use crate::broker::Broker;
use crate::error::{ProcessorError, Result};

/// Logs group membership changes for one loop
struct RelayConsumerContext {
    loop_id: usize,
}

impl ClientContext for RelayConsumerContext {}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(loop_id = self.loop_id, partitions = tpl.count(), "Partition revocation")
            }
            Rebalance::Assign(tpl) => {
                info!(loop_id = self.loop_id, partitions = tpl.count(), "Partition assignment")
            }
            Rebalance::Error(err) => error!(loop_id = self.loop_id, "Rebalance error: {}", err),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions: Vec<i32> =
                    tpl.elements().iter().map(|elem| elem.partition()).collect();
                info!(loop_id = self.loop_id, ?partitions, "Assigned partitions");
            }
            Rebalance::Revoke(_) => info!(loop_id = self.loop_id, "Partitions revoked"),
            Rebalance::Error(err) => {
                error!(loop_id = self.loop_id, "Post-rebalance error: {}", err)
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(loop_id = self.loop_id, "Offset commit callback error: {}", e);
        }
    }
}

type RelayStreamConsumer = StreamConsumer<RelayConsumerContext>;

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let mut record = Record::new(message.topic(), message.partition(), message.offset());
    record.key = message.key().map(<[u8]>::to_vec);
    record.value = message.payload().map(<[u8]>::to_vec);
    record.timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            record = record.with_header(header.key, header.value.unwrap_or_default());
        }
    }

    record
}

/// Turns a stream of receive results into poll-sized batches
///
/// Waits up to the poll timeout for the first record, then takes only what is
/// already buffered. An error that interrupts a non-empty batch is held back
/// and returned by the next collect, since the client reports it only once.
struct BatchCollector<E> {
    deferred: Option<E>,
}

impl<E> BatchCollector<E> {
    fn new() -> Self {
        Self { deferred: None }
    }

    fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    async fn collect<T, F, Fut>(
        &mut self,
        mut next: F,
        timeout: Duration,
        max_records: usize,
    ) -> std::result::Result<Vec<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let mut batch = Vec::new();
        if max_records == 0 {
            return Ok(batch);
        }

        match tokio::time::timeout(timeout, next()).await {
            Err(_) => return Ok(batch),
            Ok(Err(err)) => return Err(err),
            Ok(Ok(item)) => batch.push(item),
        }

        while batch.len() < max_records {
            match next().now_or_never() {
                None => break,
                Some(Ok(item)) => batch.push(item),
                Some(Err(err)) => {
                    self.deferred = Some(err);
                    break;
                }
            }
        }

        Ok(batch)
    }
}

pub struct KafkaBroker {
    consumer: Arc<RelayStreamConsumer>,
    collector: BatchCollector<KafkaError>,
    loop_id: usize,
}

impl KafkaBroker {
    pub fn new(config: &RelayConfig, loop_id: usize) -> Result<Self> {
        let consumer: RelayStreamConsumer = base_client_config(config)
            .set("group.id", &config.group_id)
            .set("client.id", format!("{}-{}", config.group_id, loop_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create_with_context(RelayConsumerContext { loop_id })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            collector: BatchCollector::new(),
            loop_id,
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.consumer.subscribe(&[topic])?;
        info!(loop_id = self.loop_id, topic, "Subscribed");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Batch> {
        let consumer = &*self.consumer;
        let batch = self
            .collector
            .collect(
                move || consumer.recv().map(|received| received.map(|message| to_record(&message))),
                timeout,
                max_records,
            )
            .await?;

        if self.collector.has_deferred() {
            warn!(
                loop_id = self.loop_id,
                records = batch.len(),
                "Poll interrupted, error reported on next poll"
            );
        }
        if !batch.is_empty() {
            debug!(loop_id = self.loop_id, records = batch.len(), "Polled batch");
        }
        Ok(batch)
    }

    fn has_assignment(&self) -> bool {
        self.consumer
            .assignment()
            .map(|tpl| tpl.count() > 0)
            .unwrap_or(false)
    }

    async fn commit(&mut self, checkpoint: &CommitCheckpoint) -> Result<()> {
        if checkpoint.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in checkpoint.offsets() {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))?;
        }

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(ProcessorError::from)??;

        debug!(loop_id = self.loop_id, partitions = checkpoint.len(), "Committed offsets");
        Ok(())
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(loop_id = self.loop_id, "Consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Answers from `ready` immediately, then never
    fn buffered(
        ready: Vec<std::result::Result<i64, String>>,
    ) -> impl FnMut() -> futures::future::BoxFuture<'static, std::result::Result<i64, String>> {
        let queue = Arc::new(Mutex::new(VecDeque::from(ready)));
        move || {
            let queue = queue.clone();
            async move {
                let next = queue.lock().pop_front();
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_buffered_records_without_waiting_out_timeout() {
        let mut collector = BatchCollector::new();
        let started = tokio::time::Instant::now();

        let batch = collector
            .collect(buffered(vec![Ok(1), Ok(2), Ok(3)]), Duration::from_secs(5), 50)
            .await
            .unwrap();

        assert_eq!(batch, vec![1, 2, 3]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_first_record() {
        let mut collector: BatchCollector<String> = BatchCollector::new();
        let mut calls = 0;
        let started = tokio::time::Instant::now();

        let batch = collector
            .collect(
                || {
                    calls += 1;
                    let first = calls == 1;
                    async move {
                        if first {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Ok(7)
                        } else {
                            std::future::pending().await
                        }
                    }
                },
                Duration::from_secs(5),
                50,
            )
            .await
            .unwrap();

        assert_eq!(batch, vec![7]);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_times_out() {
        let mut collector = BatchCollector::new();
        let started = tokio::time::Instant::now();

        let batch = collector
            .collect(buffered(vec![]), Duration::from_millis(100), 50)
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_capped_at_max_records() {
        let mut collector = BatchCollector::new();
        let batch = collector
            .collect(
                buffered(vec![Ok(1), Ok(2), Ok(3), Ok(4)]),
                Duration::from_secs(1),
                2,
            )
            .await
            .unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_records_is_reported_next_poll() {
        let mut collector = BatchCollector::new();
        let mut next = buffered(vec![Ok(1), Err("all brokers down".to_string()), Ok(2)]);

        let batch = collector
            .collect(&mut next, Duration::from_secs(1), 50)
            .await
            .unwrap();
        assert_eq!(batch, vec![1]);
        assert!(collector.has_deferred());

        let err = collector
            .collect(&mut next, Duration::from_secs(1), 50)
            .await
            .unwrap_err();
        assert_eq!(err, "all brokers down");

        let batch = collector
            .collect(&mut next, Duration::from_secs(1), 50)
            .await
            .unwrap();
        assert_eq!(batch, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_first_receive_is_returned() {
        let mut collector = BatchCollector::new();
        let err = collector
            .collect(buffered(vec![Err("poll".to_string())]), Duration::from_secs(1), 50)
            .await
            .unwrap_err();
        assert_eq!(err, "poll");
        assert!(!collector.has_deferred());
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let batch = rt
            .block_on(BatchCollector::new().collect(buffered(vec![Ok(1)]), Duration::MAX, 10))
            .unwrap();
        assert_eq!(batch, vec![1]);
    }
}
