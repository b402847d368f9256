//! Configuration management for the topic relay
//!
//! Options are read from an optional YAML file, an optional JSON secrets file
//! and the process environment, in increasing order of precedence. Option
//! names are the environment variable names (`KAFKA_BROKER`, `TOPIC`, ...);
//! YAML and JSON files may use either that spelling or lowercase.

use figment::{
    providers::{Env, Format, Json, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the JSON secrets file
pub const SECRETS_FILE_ENV: &str = "SECRETS_FILE_LOCATION";

/// Upper bound for the poll and target timeouts (ms)
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Every option the relay recognizes, in environment spelling
pub const OPTION_NAMES: &[&str] = &[
    "KAFKA_BROKER",
    "TOPIC",
    "GROUP_ID",
    "SENDING_PROTOCOL",
    "TARGET",
    "RETRY_TOPIC",
    "DEAD_LETTER_TOPIC",
    "DEDUP_PARTITION_BY_KEY",
    "UNKEYED_GROUPING",
    "CONCURRENCY",
    "CONCURRENCY_PER_PARTITION",
    "PROCESSING_DELAY",
    "RETRY_PROCESSING_DELAY",
    "RETRY_BUDGET",
    "POLL_RECORDS",
    "CONSUMER_POLL_TIMEOUT",
    "CONSUMER_THREADS",
    "MANAGEMENT_SERVER_PORT",
    "TARGET_IS_ALIVE_HTTP_ENDPOINT",
    "TARGET_TIMEOUT_MS",
    "READINESS_QUORUM",
    "SHUTDOWN_GRACE_PERIOD_MS",
    "SECURITY_PROTOCOL",
    "SASL_USERNAME",
    "SASL_PASSWORD",
    "SSL_CA_LOCATION",
    "SSL_KEYSTORE_LOCATION",
    "SSL_KEYSTORE_PASSWORD",
    "USE_PROMETHEUS",
    "DEBUG",
    "JSON_LOGS",
    "HIDE_CONSUMED_MESSAGE",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    MissingOption(String),

    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("failed to load configuration: {0}")]
    LoadError(String),
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the offending option, when the error concerns one
    pub fn option_name(&self) -> Option<&str> {
        match self {
            ConfigError::MissingOption(name) | ConfigError::InvalidOption { name, .. } => {
                Some(name)
            }
            ConfigError::LoadError(_) => None,
        }
    }

    fn from_figment(err: figment::Error) -> Self {
        use figment::error::Kind;

        match &err.kind {
            Kind::MissingField(field) => ConfigError::MissingOption(field.to_uppercase()),
            kind if !err.path.is_empty() => ConfigError::InvalidOption {
                name: err.path.join(".").to_uppercase(),
                reason: kind.to_string(),
            },
            _ => ConfigError::LoadError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Transport used to reach the target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendingProtocol {
    Http,
}

/// How records without a key are grouped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnkeyedGrouping {
    /// Every unkeyed record is its own group
    #[default]
    Singleton,
    /// Unkeyed records of one partition form one ordered group
    Partition,
}

/// How many consumer loops must be ready for the relay to report healthy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessQuorum {
    #[default]
    Any,
    All,
}

/// Broker security protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SecurityProtocol {
    #[default]
    #[serde(rename = "PLAINTEXT", alias = "", alias = "plaintext")]
    Plaintext,
    #[serde(rename = "SSL", alias = "ssl")]
    Ssl,
    #[serde(rename = "SASL_SSL", alias = "sasl_ssl")]
    SaslSsl,
}

/// Complete relay configuration, immutable after startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Broker bootstrap address(es)
    #[serde(alias = "KAFKA_BROKER")]
    pub kafka_broker: String,

    /// Primary input topic
    #[serde(alias = "TOPIC")]
    pub topic: String,

    /// Consumer group id
    #[serde(alias = "GROUP_ID")]
    pub group_id: String,

    /// Transport used to reach the target
    #[serde(alias = "SENDING_PROTOCOL")]
    pub sending_protocol: SendingProtocol,

    /// Target endpoint
    #[serde(alias = "TARGET")]
    pub target: String,

    #[serde(default, alias = "RETRY_TOPIC")]
    pub retry_topic: Option<String>,

    #[serde(default, alias = "DEAD_LETTER_TOPIC")]
    pub dead_letter_topic: Option<String>,

    /// Keep only the earliest record per key in each batch
    #[serde(default, alias = "DEDUP_PARTITION_BY_KEY")]
    pub dedup_partition_by_key: bool,

    #[serde(default, alias = "UNKEYED_GROUPING")]
    pub unkeyed_grouping: UnkeyedGrouping,

    /// Maximum key groups in flight per loop
    #[serde(default = "default_concurrency", alias = "CONCURRENCY")]
    pub concurrency: usize,

    /// Maximum key groups in flight per partition
    #[serde(default = "default_concurrency", alias = "CONCURRENCY_PER_PARTITION")]
    pub concurrency_per_partition: usize,

    /// Minimum record age before dispatch on primary loops (ms)
    #[serde(default, alias = "PROCESSING_DELAY")]
    pub processing_delay: u64,

    /// Minimum record age before dispatch on the retry loop (ms)
    #[serde(default = "default_retry_processing_delay", alias = "RETRY_PROCESSING_DELAY")]
    pub retry_processing_delay: u64,

    /// Retry hops allowed before a record is dead-lettered
    #[serde(default = "default_retry_budget", alias = "RETRY_BUDGET")]
    pub retry_budget: u32,

    /// Maximum records per poll
    #[serde(default = "default_poll_records", alias = "POLL_RECORDS")]
    pub poll_records: usize,

    /// Poll timeout (ms)
    #[serde(default = "default_poll_timeout", alias = "CONSUMER_POLL_TIMEOUT")]
    pub consumer_poll_timeout: u64,

    /// Number of primary consumer loops
    #[serde(default = "default_consumer_threads", alias = "CONSUMER_THREADS")]
    pub consumer_threads: usize,

    /// Health server port, 0 disables the server
    #[serde(default, alias = "MANAGEMENT_SERVER_PORT")]
    pub management_server_port: u16,

    #[serde(default, alias = "TARGET_IS_ALIVE_HTTP_ENDPOINT")]
    pub target_is_alive_http_endpoint: Option<String>,

    /// Per-call target timeout (ms)
    #[serde(default = "default_target_timeout", alias = "TARGET_TIMEOUT_MS")]
    pub target_timeout_ms: u64,

    #[serde(default, alias = "READINESS_QUORUM")]
    pub readiness_quorum: ReadinessQuorum,

    /// Time allowed for in-flight batches to drain on shutdown (ms)
    #[serde(default = "default_shutdown_grace", alias = "SHUTDOWN_GRACE_PERIOD_MS")]
    pub shutdown_grace_period_ms: u64,

    #[serde(default, alias = "SECURITY_PROTOCOL")]
    pub security_protocol: SecurityProtocol,

    #[serde(default, alias = "SASL_USERNAME")]
    pub sasl_username: Option<String>,

    #[serde(default, alias = "SASL_PASSWORD", skip_serializing)]
    pub sasl_password: Option<String>,

    #[serde(default, alias = "SSL_CA_LOCATION")]
    pub ssl_ca_location: Option<String>,

    #[serde(default, alias = "SSL_KEYSTORE_LOCATION")]
    pub ssl_keystore_location: Option<String>,

    #[serde(default, alias = "SSL_KEYSTORE_PASSWORD", skip_serializing)]
    pub ssl_keystore_password: Option<String>,

    /// Serve Prometheus metrics on the health server
    #[serde(default, alias = "USE_PROMETHEUS")]
    pub use_prometheus: bool,

    #[serde(default, alias = "DEBUG")]
    pub debug: bool,

    #[serde(default, alias = "JSON_LOGS")]
    pub json_logs: bool,

    /// Keep record payloads out of the logs
    #[serde(default, alias = "HIDE_CONSUMED_MESSAGE")]
    pub hide_consumed_message: bool,
}

fn default_concurrency() -> usize {
    1
}

fn default_retry_processing_delay() -> u64 {
    60_000
}

fn default_retry_budget() -> u32 {
    1
}

fn default_poll_records() -> usize {
    50
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_consumer_threads() -> usize {
    4
}

fn default_target_timeout() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    10_000
}

impl RelayConfig {
    /// Load configuration from file, secrets file and environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        // The secrets file location may itself come from the file or the environment
        let secrets_file: Option<String> = figment
            .clone()
            .merge(Env::raw().only(&[SECRETS_FILE_ENV]))
            .extract_inner("secrets_file_location")
            .ok();
        if let Some(path) = secrets_file {
            figment = figment.merge(Json::file(path));
        }

        figment = figment.merge(Env::raw().only(OPTION_NAMES));

        let config: Self = figment.extract().map_err(ConfigError::from_figment)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("KAFKA_BROKER", &self.kafka_broker),
            ("TOPIC", &self.topic),
            ("GROUP_ID", &self.group_id),
            ("TARGET", &self.target),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingOption(name.to_string()));
            }
        }

        if !is_http_url(&self.target) {
            return Err(ConfigError::invalid("TARGET", "must be an http(s) URL"));
        }

        if let Some(probe) = &self.target_is_alive_http_endpoint {
            if !is_http_url(probe) {
                return Err(ConfigError::invalid(
                    "TARGET_IS_ALIVE_HTTP_ENDPOINT",
                    "must be an http(s) URL",
                ));
            }
        }

        for (name, value) in [
            ("CONCURRENCY", self.concurrency),
            ("CONCURRENCY_PER_PARTITION", self.concurrency_per_partition),
            ("POLL_RECORDS", self.poll_records),
            ("CONSUMER_THREADS", self.consumer_threads),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(name, "must be greater than 0"));
            }
        }

        for (name, value) in [
            ("CONSUMER_POLL_TIMEOUT", self.consumer_poll_timeout),
            ("TARGET_TIMEOUT_MS", self.target_timeout_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(ConfigError::invalid(
                    name,
                    format!("must be between 1 and {} ms", MAX_TIMEOUT_MS),
                ));
            }
        }

        for (name, value) in [
            ("RETRY_TOPIC", &self.retry_topic),
            ("DEAD_LETTER_TOPIC", &self.dead_letter_topic),
        ] {
            if value.as_deref() == Some(self.topic.as_str()) {
                return Err(ConfigError::invalid(name, "must differ from TOPIC"));
            }
        }

        if self.security_protocol == SecurityProtocol::SaslSsl {
            if self.sasl_username.is_none() {
                return Err(ConfigError::MissingOption("SASL_USERNAME".to_string()));
            }
            if self.sasl_password.is_none() {
                return Err(ConfigError::MissingOption("SASL_PASSWORD".to_string()));
            }
        }

        if self.security_protocol == SecurityProtocol::Ssl
            && self.ssl_keystore_location.is_some()
            && self.ssl_keystore_password.is_none()
        {
            return Err(ConfigError::MissingOption(
                "SSL_KEYSTORE_PASSWORD".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker client settings implied by the security options
    pub fn security_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = Vec::new();

        match self.security_protocol {
            SecurityProtocol::Plaintext => {}
            SecurityProtocol::Ssl => {
                settings.push(("security.protocol", "ssl".to_string()));
                if let Some(ca) = &self.ssl_ca_location {
                    settings.push(("ssl.ca.location", ca.clone()));
                }
                if let Some(keystore) = &self.ssl_keystore_location {
                    settings.push(("ssl.keystore.location", keystore.clone()));
                }
                if let Some(password) = &self.ssl_keystore_password {
                    settings.push(("ssl.keystore.password", password.clone()));
                }
            }
            SecurityProtocol::SaslSsl => {
                settings.push(("security.protocol", "sasl_ssl".to_string()));
                settings.push(("sasl.mechanisms", "PLAIN".to_string()));
                if let Some(username) = &self.sasl_username {
                    settings.push(("sasl.username", username.clone()));
                }
                if let Some(password) = &self.sasl_password {
                    settings.push(("sasl.password", password.clone()));
                }
                if let Some(ca) = &self.ssl_ca_location {
                    settings.push(("ssl.ca.location", ca.clone()));
                }
            }
        }

        settings
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay)
    }

    pub fn retry_processing_delay(&self) -> Duration {
        Duration::from_millis(self.retry_processing_delay)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout)
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_millis(self.target_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Default log filter when `RUST_LOG` is not set
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("http://") || value.starts_with("https://")
}
