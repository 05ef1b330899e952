//! Configuration for the MQTT exporter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use metricsmq_common::config::{LogFormat, LoggingConfig, ZenohConfig};

/// Largest remaining length the MQTT fixed header can encode.
pub const MAX_MQTT_PACKET_SIZE: usize = 268_435_455;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Upstream Zenoh bus the host binary reads samples from.
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Broker, topic and encoding settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Host-side batching and retry.
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Sample filtering.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl std::fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityOfService {
    /// QoS 0: fire once, acknowledged when written to the socket.
    #[default]
    AtMostOnce,
    /// QoS 1: acknowledged by PUBACK.
    AtLeastOnce,
    /// QoS 2: acknowledged by PUBCOMP.
    ExactlyOnce,
}

impl QualityOfService {
    /// Numeric MQTT level.
    pub fn level(&self) -> u8 {
        match self {
            QualityOfService::AtMostOnce => 0,
            QualityOfService::AtLeastOnce => 1,
            QualityOfService::ExactlyOnce => 2,
        }
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Settings consumed by the exporter core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    /// MQTT client identifier; must be unique per broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic every batch is published to.
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub qos: QualityOfService,

    /// Identifier of the encoding extension in the host registry.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Upper bound on waiting for CONNACK.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound on waiting for a publish acknowledgment.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    /// Grace period for flushing on disconnect, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Largest MQTT packet accepted or sent, in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_client_id() -> String {
    "metricsmq-exporter".to_string()
}

fn default_topic() -> String {
    "telemetry/metrics".to_string()
}

fn default_encoding() -> String {
    "otlp".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_publish_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    250
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            client_id: default_client_id(),
            topic: default_topic(),
            qos: QualityOfService::default(),
            encoding: default_encoding(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            publish_timeout_secs: default_publish_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check the fields the core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.broker.host cannot be empty".to_string(),
            ));
        }

        if self.broker.port == 0 {
            return Err(ConfigError::Validation(
                "mqtt.broker.port must be in 1..=65535".to_string(),
            ));
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.client_id cannot be empty".to_string(),
            ));
        }

        if self.topic.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.topic cannot be empty".to_string(),
            ));
        }

        if self.topic.contains(['+', '#']) {
            return Err(ConfigError::Validation(format!(
                "mqtt.topic '{}' must not contain wildcards",
                self.topic
            )));
        }

        if self.encoding.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.encoding cannot be empty".to_string(),
            ));
        }

        if self.keep_alive_secs < 5 {
            return Err(ConfigError::Validation(
                "mqtt.keep_alive_secs must be >= 5".to_string(),
            ));
        }

        if self.max_packet_size == 0 || self.max_packet_size > MAX_MQTT_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "mqtt.max_packet_size must be in 1..={}",
                MAX_MQTT_PACKET_SIZE
            )));
        }

        if self.connect_timeout_secs == 0 || self.publish_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "mqtt timeouts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// How the host binary groups samples into batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Zenoh key expression to subscribe to.
    #[serde(default = "default_key_expr")]
    pub key_expr: String,

    /// Flush interval in milliseconds.
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Flush early once this many samples are buffered.
    #[serde(default = "default_max_points")]
    pub max_points: usize,

    /// Extra attempts for a batch that failed with a transient error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between attempts, in milliseconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_key_expr() -> String {
    "metricsmq/**".to_string()
}

fn default_interval() -> u64 {
    1000
}

fn default_max_points() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    500
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            key_expr: default_key_expr(),
            interval_ms: default_interval(),
            max_points: default_max_points(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl BatchingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Sample filtering configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Only include these sources (empty = all).
    #[serde(default)]
    pub include_sources: Vec<String>,

    /// Exclude these sources.
    #[serde(default)]
    pub exclude_sources: Vec<String>,

    /// Only include metrics whose name starts with one of these prefixes (empty = all).
    #[serde(default)]
    pub include_metrics: Vec<String>,

    /// Exclude metrics whose name starts with one of these prefixes.
    #[serde(default)]
    pub exclude_metrics: Vec<String>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.zenoh
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.batching.key_expr.is_empty() {
            return Err(ConfigError::Validation(
                "batching.key_expr cannot be empty".to_string(),
            ));
        }

        if self.batching.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "batching.interval_ms must be > 0".to_string(),
            ));
        }

        if self.batching.max_points == 0 {
            return Err(ConfigError::Validation(
                "batching.max_points must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
