//! Batches, key groups and commit checkpoints

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::{Record, TopicPartition};

/// Records returned by one poll, in poll order
pub type Batch = Vec<Record>;

/// Identity of a key group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    /// Records sharing a record key
    Keyed(Vec<u8>),
    /// Unkeyed records of one partition, kept in offset order
    UnkeyedPartition(TopicPartition),
    /// A single unkeyed record with no ordering relation to others
    Unkeyed { topic: String, partition: i32, offset: i64 },
}

impl GroupKey {
    pub fn is_keyed(&self) -> bool {
        matches!(self, GroupKey::Keyed(_))
    }
}

/// A subset of a batch sharing one key, ordered by ascending offset
///
/// No record in a group is dispatched before every record with a smaller
/// offset in the same group has reached a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    pub key: GroupKey,
    pub records: Vec<Record>,
}

impl KeyGroup {
    pub fn new(key: GroupKey, records: Vec<Record>) -> Self {
        Self { key, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Partition the group counts against for per-partition concurrency
    ///
    /// Keyed groups may span partitions when the producer changed its
    /// partitioning; the first record's partition is used.
    pub fn home_partition(&self) -> Option<TopicPartition> {
        self.records.first().map(Record::topic_partition)
    }
}

/// Offsets that are safe to resume from, per partition
///
/// Each entry is the next offset to read, i.e. one past the highest offset
/// that reached a terminal outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCheckpoint {
    offsets: BTreeMap<TopicPartition, i64>,
}

impl CommitCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint covering every record of a fully processed batch
    pub fn for_batch<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut checkpoint = Self::new();
        for record in records {
            checkpoint.advance(record);
        }
        checkpoint
    }

    /// Move the partition's resume point past `record` if it is further along
    pub fn advance(&mut self, record: &Record) {
        let next = record.offset + 1;
        self.offsets
            .entry(record.topic_partition())
            .and_modify(|current| {
                if next > *current {
                    *current = next;
                }
            })
            .or_insert(next);
    }

    pub fn offsets(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.offsets
    }

    pub fn offset_for(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}
