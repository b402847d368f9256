//! Prometheus metrics for the relay
//!
//! Pipeline components report through a shared [`RelayMetrics`] handle. The
//! handle is always present; whether anything scrapes it is decided by the
//! health server configuration.

mod registry;
mod relay;

pub use registry::MetricsRegistry;
pub use relay::{OutcomeKind, RelayMetrics};

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
