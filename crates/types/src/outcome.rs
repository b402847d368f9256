//! Outcome of forwarding one record to the target

use std::time::Duration;

use crate::errors::TargetError;
use crate::record::Record;

/// Successful response from a target transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetResponse {
    /// Time until the target answered
    pub call_latency: Option<Duration>,
    /// Time until the target produced a logically successful result
    pub result_latency: Option<Duration>,
}

impl TargetResponse {
    pub fn new(call_latency: Duration) -> Self {
        Self {
            call_latency: Some(call_latency),
            result_latency: None,
        }
    }

    pub fn with_result_latency(mut self, result_latency: Duration) -> Self {
        self.result_latency = Some(result_latency);
        self
    }
}

/// Result of one target call, produced exactly once per record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub record: Record,
    pub call_latency: Option<Duration>,
    pub result_latency: Option<Duration>,
    pub failure: Option<TargetError>,
}

impl CallOutcome {
    pub fn succeeded(record: Record, response: TargetResponse) -> Self {
        Self {
            record,
            call_latency: response.call_latency,
            result_latency: response.result_latency,
            failure: None,
        }
    }

    pub fn failed(record: Record, call_latency: Option<Duration>, failure: TargetError) -> Self {
        Self {
            record,
            call_latency,
            result_latency: None,
            failure: Some(failure),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Whether the target as a whole is down, which aborts the batch
    pub fn target_unreachable(&self) -> bool {
        self.failure
            .as_ref()
            .map(TargetError::is_unreachable)
            .unwrap_or(false)
    }
}
