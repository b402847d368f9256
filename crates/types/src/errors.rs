//! Error types for calls to the downstream target

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure cause of a single target call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TargetError {
    /// The target cannot be reached at all (e.g. connection refused)
    #[error("target unreachable: {0}")]
    Unreachable(String),

    /// The target answered with a non-success status
    #[error("target responded with status {0}")]
    Status(u16),

    /// The target did not answer in time
    #[error("target call timed out after {0}ms")]
    Timeout(u64),

    /// Any other transport failure
    #[error("target transport error: {0}")]
    Transport(String),
}

impl TargetError {
    /// Whether the failure means the whole target is down rather than this record failing
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TargetError::Unreachable(_))
    }

    /// Short label used for metrics and logs
    pub fn cause(&self) -> &'static str {
        match self {
            TargetError::Unreachable(_) => "unreachable",
            TargetError::Status(_) => "status",
            TargetError::Timeout(_) => "timeout",
            TargetError::Transport(_) => "transport",
        }
    }
}
