//! MQTT exporter for metrics batches.
//!
//! The exporter takes [`MetricsBatch`]es from a host pipeline, encodes each
//! one with an encoding chosen at runtime, and publishes it as a single MQTT
//! message, returning only once the broker has acknowledged it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ push  ┌─────────────────┐ encode ┌──────────────┐
//! │ Host pipeline│──────>│ MetricsPublisher│───────>│ EncoderHandle│
//! └──────────────┘       └────────┬────────┘        └──────────────┘
//!                                 │ publish + ack
//!                        ┌────────▼────────┐        ┌──────────────┐
//!                        │BrokerConnection │───────>│ MQTT broker  │
//!                        └─────────────────┘        └──────────────┘
//! ```
//!
//! [`MqttExporter`] owns the lifecycle: [`start`](MqttExporter::start)
//! resolves the encoder in the host's [`ExtensionRegistry`] and connects,
//! [`shutdown`](MqttExporter::shutdown) disconnects within a grace period.
//!
//! # Usage
//!
//! ```ignore
//! use metricsmq_exporter::{ExtensionRegistry, MqttConfig, MqttExporter};
//!
//! let exporter = MqttExporter::new(MqttConfig::default());
//! exporter.start(&ExtensionRegistry::with_builtin_encoders()).await?;
//! exporter.push(&batch).await?;
//! exporter.shutdown(Duration::from_millis(250)).await?;
//! ```
//!
//! The `metricsmq-exporter` binary wires this to a Zenoh subscriber; see
//! [`subscriber`] and [`config::ExporterConfig`].

pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod exporter;
pub mod publisher;
pub mod subscriber;

pub use config::{ExporterConfig, MqttConfig, QualityOfService};
pub use connection::{BrokerConnection, ConnectionState, MqttTransport, Transport};
pub use encoding::{EncoderHandle, Extension, ExtensionRegistry, MetricsEncoder};
pub use error::{
    ConnectError, DisconnectTimeout, EncodeError, ExporterError, PublishError, ResolutionError,
    Result,
};
pub use exporter::{LifecycleState, MqttExporter};
pub use metricsmq_common::{MetricPoint, MetricValue, MetricsBatch};
pub use publisher::MetricsPublisher;
pub use subscriber::{ExporterStats, TelemetrySubscriber};
