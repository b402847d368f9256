//! Broker records and rerouting envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Header carrying the topic a record was first consumed from
pub const ORIGINAL_TOPIC_HEADER: &str = "original-topic";

/// Header counting how many times a record has been sent to the retry topic
pub const RETRY_ATTEMPT_HEADER: &str = "retry-attempt";

/// A topic/partition pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record as returned by a broker poll
///
/// Records are never mutated after polling; rerouting builds a new
/// [`Envelope`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Opaque payload
    pub value: Option<Vec<u8>>,
    /// Record headers (first value wins on duplicates)
    pub headers: HashMap<String, Vec<u8>>,
    /// Broker timestamp, if available
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a record with no key, value, headers or timestamp
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            headers: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.entry(name.into()).or_insert_with(|| value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Header value decoded as UTF-8
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Topic the record was first consumed from, surviving any number of retry hops
    pub fn original_topic(&self) -> &str {
        self.header_str(ORIGINAL_TOPIC_HEADER)
            .unwrap_or(self.topic.as_str())
    }

    /// Number of retry hops this record has already taken
    pub fn retry_attempt(&self) -> u32 {
        self.header_str(RETRY_ATTEMPT_HEADER)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Key rendered for logs
    pub fn key_display(&self) -> String {
        match &self.key {
            Some(key) => String::from_utf8_lossy(key).into_owned(),
            None => "<none>".to_string(),
        }
    }
}

/// Where an [`Envelope`] is headed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Retry,
    DeadLetter,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Retry => "retry",
            Destination::DeadLetter => "dead_letter",
        }
    }
}

/// A failed record re-wrapped for the retry or dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: Destination,
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl Envelope {
    /// Wrap `record` for the retry topic, counting this hop as `attempt`
    pub fn retry(record: &Record, topic: impl Into<String>, attempt: u32) -> Self {
        let mut envelope = Self::wrap(record, Destination::Retry, topic.into());
        envelope.headers.insert(
            RETRY_ATTEMPT_HEADER.to_string(),
            attempt.to_string().into_bytes(),
        );
        envelope
    }

    /// Wrap `record` for the dead-letter topic
    pub fn dead_letter(record: &Record, topic: impl Into<String>) -> Self {
        Self::wrap(record, Destination::DeadLetter, topic.into())
    }

    fn wrap(record: &Record, destination: Destination, topic: String) -> Self {
        let mut headers = record.headers.clone();
        headers.insert(
            ORIGINAL_TOPIC_HEADER.to_string(),
            record.original_topic().as_bytes().to_vec(),
        );

        Self {
            destination,
            topic,
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}
