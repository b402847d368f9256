//! Error types for the record pipeline
//!
//! Per-record target failures never surface here; the processor turns them
//! into routing decisions. These errors describe what can go wrong with a
//! whole batch or a whole consumer loop.

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("broker connection error: {0}")]
    BrokerConnection(String),

    #[error("poll error: {0}")]
    Poll(String),

    #[error("commit conflict: {0}")]
    CommitConflict(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("failed to produce to {topic}: {message}")]
    Production { topic: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, ProcessorError>;

impl ProcessorError {
    pub fn production(topic: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessorError::Production {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Whether the loop may carry on with its next poll cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessorError::Poll(_) | ProcessorError::CommitConflict(_)
        )
    }

    pub fn is_commit_conflict(&self) -> bool {
        matches!(self, ProcessorError::CommitConflict(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProcessorError::Configuration(_) | ProcessorError::Unexpected(_) => {
                ErrorSeverity::Critical
            }
            ProcessorError::BrokerConnection(_)
            | ProcessorError::Commit(_)
            | ProcessorError::TargetUnavailable(_)
            | ProcessorError::Production { .. } => ErrorSeverity::Error,
            ProcessorError::Poll(_) | ProcessorError::CommitConflict(_) => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

fn is_conflict_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId
    )
}

fn is_connection_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::BrokerTransportFailure
    )
}

impl From<KafkaError> for ProcessorError {
    fn from(err: KafkaError) -> Self {
        let message = err.to_string();
        match &err {
            KafkaError::ConsumerCommit(code) if is_conflict_code(*code) => {
                ProcessorError::CommitConflict(message)
            }
            KafkaError::ConsumerCommit(_) => ProcessorError::Commit(message),
            KafkaError::MessageConsumption(code) if is_connection_code(*code) => {
                ProcessorError::BrokerConnection(message)
            }
            KafkaError::MessageConsumption(_) | KafkaError::PartitionEOF(_) => {
                ProcessorError::Poll(message)
            }
            KafkaError::Subscription(_) | KafkaError::ClientCreation(_) => {
                ProcessorError::BrokerConnection(message)
            }
            KafkaError::ClientConfig(..) => ProcessorError::Configuration(message),
            _ => match err.rdkafka_error_code() {
                Some(code) if is_connection_code(code) => {
                    ProcessorError::BrokerConnection(message)
                }
                _ => ProcessorError::Unexpected(message),
            },
        }
    }
}

impl From<tokio::task::JoinError> for ProcessorError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}
