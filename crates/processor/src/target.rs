//! Target gateway
//!
//! The gateway forwards one record to the downstream target through an
//! injected [`TargetTransport`] and measures the call. Every completed call is
//! reported to metrics, whatever its outcome.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use relay_types::{CallOutcome, Record, TargetError, TargetResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ProcessorError, Result};
use crate::metrics::RelayMetrics;

/// Concrete way of reaching the target
#[async_trait]
pub trait TargetTransport: Send + Sync {
    async fn send(&self, record: &Record) -> std::result::Result<TargetResponse, TargetError>;
}

/// Liveness probe for the target itself
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Time from the record's broker timestamp until now
fn result_latency(record: &Record) -> Option<Duration> {
    record
        .timestamp
        .and_then(|timestamp| (Utc::now() - timestamp).to_std().ok())
}

/// Record coordinates sent alongside the payload
///
/// Keys are opaque bytes: a key that is not a valid header value is sent
/// base64-encoded and flagged with `x-record-key-encoding`.
fn record_headers(record: &Record) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-record-partition", HeaderValue::from(record.partition));
    headers.insert("x-record-offset", HeaderValue::from(record.offset));
    if let Ok(topic) = HeaderValue::from_str(&record.topic) {
        headers.insert("x-record-topic", topic);
    }
    let original_topic = HeaderValue::from_str(record.original_topic())
        .or_else(|_| HeaderValue::from_str(&record.topic));
    if let Ok(original_topic) = original_topic {
        headers.insert("x-original-topic", original_topic);
    }

    if let Some(key) = &record.key {
        match HeaderValue::from_bytes(key) {
            Ok(value) => {
                headers.insert("x-record-key", value);
            }
            Err(_) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(key);
                // Base64 output is always a valid header value
                if let Ok(value) = HeaderValue::from_str(&encoded) {
                    headers.insert("x-record-key", value);
                    headers.insert("x-record-key-encoding", HeaderValue::from_static("base64"));
                }
            }
        }
    }

    headers
}

/// HTTP transport: `POST` the record value to the target URL
pub struct HttpTarget {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTarget {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    /// Build on an existing client so that all loops share one connection pool
    pub fn with_client(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    fn classify(&self, err: reqwest::Error) -> TargetError {
        if err.is_timeout() {
            TargetError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_connect() {
            TargetError::Unreachable(err.to_string())
        } else {
            TargetError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl TargetTransport for HttpTarget {
    async fn send(&self, record: &Record) -> std::result::Result<TargetResponse, TargetError> {
        let request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .headers(record_headers(record));

        let started = Instant::now();
        let response = request
            .body(record.value.clone().unwrap_or_default())
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let call_latency = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(TargetError::Status(status.as_u16()));
        }

        let mut outcome = TargetResponse::new(call_latency);
        if let Some(latency) = result_latency(record) {
            outcome = outcome.with_result_latency(latency);
        }
        Ok(outcome)
    }
}

/// Default bound on one liveness probe, independent of the target call timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP liveness probe: `GET` must answer 200
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TargetProbe for HttpProbe {
    async fn is_alive(&self) -> bool {
        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Target liveness probe failed");
                false
            }
        }
    }
}

/// Measured, metered access to the target
#[derive(Clone)]
pub struct TargetGateway {
    transport: Arc<dyn TargetTransport>,
    metrics: RelayMetrics,
    hide_payload: bool,
}

impl TargetGateway {
    pub fn new(transport: Arc<dyn TargetTransport>, metrics: RelayMetrics) -> Self {
        Self {
            transport,
            metrics,
            hide_payload: false,
        }
    }

    /// Keep record payloads out of debug logs
    pub fn hide_payload(mut self, hide: bool) -> Self {
        self.hide_payload = hide;
        self
    }

    /// Forward one record and produce its outcome
    pub async fn call(&self, record: Record) -> CallOutcome {
        if self.hide_payload {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Calling target"
            );
        } else {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                key = %record.key_display(),
                value = %String::from_utf8_lossy(record.value.as_deref().unwrap_or_default()),
                "Calling target"
            );
        }

        let started = Instant::now();
        match self.transport.send(&record).await {
            Ok(response) => {
                let response = TargetResponse {
                    call_latency: response.call_latency.or(Some(started.elapsed())),
                    result_latency: response.result_latency,
                };
                self.metrics
                    .observe_call(response.call_latency, response.result_latency, None);
                CallOutcome::succeeded(record, response)
            }
            Err(err) => {
                let elapsed = started.elapsed();
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Target call failed"
                );
                self.metrics
                    .observe_call(Some(elapsed), None, Some(err.cause()));
                CallOutcome::failed(record, Some(elapsed), err)
            }
        }
    }
}
