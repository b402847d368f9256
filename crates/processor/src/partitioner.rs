//! Key partitioner
//!
//! Reorganizes a polled batch into independent, offset-ordered key groups.
//! Groups come out in the order their first record appeared in the batch.

use relay_config::UnkeyedGrouping;
use relay_types::{Batch, GroupKey, KeyGroup, Record, TopicPartition};
use std::collections::HashMap;

/// Result of partitioning one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitioned {
    /// Groups to dispatch, each ordered by ascending offset
    pub groups: Vec<KeyGroup>,
    /// Records superseded by an earlier record with the same key
    ///
    /// Only populated when dedup is enabled. These are terminal without ever
    /// being dispatched, retried or dead-lettered.
    pub skipped: Vec<Record>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyPartitioner {
    dedup_by_key: bool,
    unkeyed_grouping: UnkeyedGrouping,
}

impl KeyPartitioner {
    pub fn new(dedup_by_key: bool, unkeyed_grouping: UnkeyedGrouping) -> Self {
        Self {
            dedup_by_key,
            unkeyed_grouping,
        }
    }

    pub fn partition(&self, batch: Batch) -> Partitioned {
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut groups: Vec<KeyGroup> = Vec::new();

        for record in batch {
            let key = self.group_key(&record);
            match index.get(&key) {
                Some(&position) => groups[position].records.push(record),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(KeyGroup::new(key, vec![record]));
                }
            }
        }

        let mut skipped = Vec::new();
        for group in &mut groups {
            // Poll order is not guaranteed sorted across fetches
            group.records.sort_by_key(|record| record.offset);

            if self.dedup_by_key && group.key.is_keyed() && group.records.len() > 1 {
                skipped.extend(group.records.drain(1..));
            }
        }

        Partitioned { groups, skipped }
    }

    fn group_key(&self, record: &Record) -> GroupKey {
        match (&record.key, self.unkeyed_grouping) {
            (Some(key), _) => GroupKey::Keyed(key.clone()),
            (None, UnkeyedGrouping::Partition) => {
                GroupKey::UnkeyedPartition(TopicPartition::new(record.topic.clone(), record.partition))
            }
            (None, UnkeyedGrouping::Singleton) => GroupKey::Unkeyed {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            },
        }
    }
}
