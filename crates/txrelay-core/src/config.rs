//! Configuration structures for txrelay.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound brokers accept for `transaction.timeout.ms` by default
/// (`transaction.max.timeout.ms`).
pub const MAX_TRANSACTION_TIMEOUT_MS: u64 = 900_000;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,

    /// Relay loop configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka source and sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    pub source_topic: String,

    /// Topic to republish to
    pub destination_topic: String,

    /// Consumer group ID
    pub consumer_group: String,

    /// Transactional identity; unique per relay instance, stable across restarts
    pub transactional_id: String,

    /// Maximum records per batch (one transaction per batch)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch timeout in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Max poll interval in milliseconds (must exceed the longest transaction)
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Producer transaction timeout in milliseconds
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// Timeout for blocking client operations (seek, transactional calls)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,

    /// SSL client certificate location
    pub ssl_cert_location: Option<PathBuf>,

    /// SSL client key location
    pub ssl_key_location: Option<PathBuf>,
}

impl KafkaSecurityConfig {
    /// Copy the configured security settings onto a client configuration.
    pub fn apply(&self, client_config: &mut ClientConfig) {
        let string_settings = [
            ("security.protocol", &self.protocol),
            ("sasl.mechanism", &self.sasl_mechanism),
            ("sasl.username", &self.sasl_username),
            ("sasl.password", &self.sasl_password),
        ];
        for (key, value) in string_settings {
            if let Some(value) = value {
                client_config.set(key, value);
            }
        }

        let path_settings = [
            ("ssl.ca.location", &self.ssl_ca_location),
            ("ssl.certificate.location", &self.ssl_cert_location),
            ("ssl.key.location", &self.ssl_key_location),
        ];
        for (key, value) in path_settings {
            if let Some(path) = value {
                client_config.set(key, path.to_string_lossy());
            }
        }
    }
}

/// Relay loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Backoff before the first retry of a failed batch
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failed batches before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Add ±25% jitter to retry delays
    #[serde(default = "default_enabled")]
    pub retry_jitter: bool,

    /// Service name recorded on exported spans
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Grace period for the loop to finish an in-flight batch on shutdown
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_retries: default_max_retries(),
            retry_jitter: default_enabled(),
            service_name: default_service_name(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    1000
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_heartbeat_interval_ms() -> u32 {
    3000
}
fn default_max_poll_interval_ms() -> u32 {
    300000
}
fn default_transaction_timeout_ms() -> u64 {
    10000
}
fn default_operation_timeout_ms() -> u64 {
    30000
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    30000
}
fn default_max_retries() -> u32 {
    10
}
fn default_enabled() -> bool {
    true
}
fn default_service_name() -> String {
    "txrelay".to_string()
}
fn default_shutdown_timeout_seconds() -> u64 {
    30
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let config = Self::from_file_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration without validating it, so CLI overrides can be
    /// applied first.
    pub fn from_file_unvalidated(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let kafka = &self.kafka;

        if kafka.bootstrap_servers.is_empty()
            || kafka.bootstrap_servers.iter().any(|s| s.trim().is_empty())
        {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if kafka.source_topic.is_empty() {
            return Err(crate::Error::Config("Source topic is required".into()));
        }

        if kafka.destination_topic.is_empty() {
            return Err(crate::Error::Config("Destination topic is required".into()));
        }

        if kafka.source_topic == kafka.destination_topic {
            return Err(crate::Error::Config(format!(
                "Source and destination topic must differ (both are '{}')",
                kafka.source_topic
            )));
        }

        if kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if kafka.transactional_id.is_empty() {
            return Err(crate::Error::Config("Transactional id is required".into()));
        }

        if kafka.batch_size == 0 {
            return Err(crate::Error::Config("Batch size must be at least 1".into()));
        }

        if kafka.transaction_timeout_ms == 0
            || kafka.transaction_timeout_ms > MAX_TRANSACTION_TIMEOUT_MS
        {
            return Err(crate::Error::Config(format!(
                "Transaction timeout must be between 1 and {} ms, got {}",
                MAX_TRANSACTION_TIMEOUT_MS, kafka.transaction_timeout_ms
            )));
        }

        if kafka.batch_timeout_ms >= kafka.transaction_timeout_ms {
            return Err(crate::Error::Config(format!(
                "Batch timeout ({} ms) must be below the transaction timeout ({} ms)",
                kafka.batch_timeout_ms, kafka.transaction_timeout_ms
            )));
        }

        if self.relay.retry_base_delay_ms > self.relay.retry_max_delay_ms {
            return Err(crate::Error::Config(
                "retry_base_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }

        if u64::from(kafka.max_poll_interval_ms) <= kafka.transaction_timeout_ms {
            tracing::warn!(
                max_poll_interval_ms = kafka.max_poll_interval_ms,
                transaction_timeout_ms = kafka.transaction_timeout_ms,
                "Max poll interval does not exceed the transaction timeout; slow batches may trigger rebalances"
            );
        }

        Ok(())
    }
}
