//! Broker seam used by the consumer loop
//!
//! One [`Broker`] is owned by exactly one consumer loop. The Kafka
//! implementation lives in [`crate::kafka`]; tests use in-memory fakes.

use async_trait::async_trait;
use relay_types::{Batch, CommitCheckpoint};
use std::time::Duration;

use crate::error::Result;

#[async_trait]
pub trait Broker: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Wait up to `timeout` for at most `max_records` records
    ///
    /// An empty batch is not an error.
    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Batch>;

    /// Whether the group has assigned this consumer at least one partition
    fn has_assignment(&self) -> bool;

    /// Persist the checkpoint, waiting for the broker's acknowledgement
    async fn commit(&mut self, checkpoint: &CommitCheckpoint) -> Result<()>;

    /// Unsubscribe and release the connection
    async fn close(&mut self);
}
