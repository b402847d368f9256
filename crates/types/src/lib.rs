//! Core types for the topic relay
//!
//! This crate provides the data model shared by the relay crates: polled
//! records, key groups, target call outcomes and commit checkpoints.

pub mod batch;
pub mod errors;
pub mod outcome;
pub mod record;

pub use batch::{Batch, CommitCheckpoint, GroupKey, KeyGroup};
pub use errors::TargetError;
pub use outcome::{CallOutcome, TargetResponse};
pub use record::{
    Destination, Envelope, Record, TopicPartition, ORIGINAL_TOPIC_HEADER, RETRY_ATTEMPT_HEADER,
};
