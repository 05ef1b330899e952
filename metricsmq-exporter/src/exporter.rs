//! Exporter lifecycle.
//!
//! ```text
//! Uninitialized ──start──> Starting ──ok──> Running ──shutdown──> ShuttingDown ──> Stopped
//!                             │                                                    ▲
//!                             └──────────────────── error ─────────────────────────┘
//! ```
//!
//! `Stopped` is terminal; an exporter is never restarted.

use std::sync::Arc;
use std::time::Duration;

use metricsmq_common::MetricsBatch;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::MqttConfig;
use crate::connection::{BrokerConnection, ConnectionState, MqttTransport, Transport};
use crate::encoding::{self, ExtensionRegistry};
use crate::error::{ExporterError, Result};
use crate::publisher::MetricsPublisher;

/// Where an exporter is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
        }
    }

    fn not_ready_reason(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "exporter has not been started",
            LifecycleState::Starting => "exporter is still starting",
            LifecycleState::Running => "exporter has no publisher",
            LifecycleState::ShuttingDown => "exporter is shutting down",
            LifecycleState::Stopped => "exporter is stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: LifecycleState,
    publisher: Option<Arc<MetricsPublisher>>,
}

/// Publishes metrics batches to an MQTT topic.
///
/// Construct with [`MqttExporter::new`], call [`start`](Self::start) once
/// with the host's extension registry, [`push`](Self::push) batches, and
/// finish with [`shutdown`](Self::shutdown). All methods take `&self`, so
/// the exporter can be shared behind an `Arc` and pushed to concurrently.
pub struct MqttExporter {
    config: Arc<MqttConfig>,
    connection: Arc<BrokerConnection>,
    lifecycle: RwLock<Lifecycle>,
}

impl MqttExporter {
    /// Exporter talking MQTT to the configured broker.
    pub fn new(config: MqttConfig) -> Self {
        let transport = MqttTransport::new(&config);
        Self::with_transport(config, transport)
    }

    /// Exporter over a caller-supplied transport.
    pub fn with_transport(config: MqttConfig, transport: impl Transport + 'static) -> Self {
        let connection = BrokerConnection::new(
            transport,
            config.connect_timeout(),
            config.publish_timeout(),
        );

        Self {
            config: Arc::new(config),
            connection: Arc::new(connection),
            lifecycle: RwLock::new(Lifecycle {
                state: LifecycleState::Uninitialized,
                publisher: None,
            }),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.read().state
    }

    /// State of the underlying broker session.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Resolve the configured encoding in `registry` and connect to the broker.
    ///
    /// Only valid once. On failure the exporter is `Stopped` and every later
    /// push fails with [`ExporterError::NotReady`].
    pub async fn start(&self, registry: &ExtensionRegistry) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state != LifecycleState::Uninitialized {
                return Err(ExporterError::AlreadyStarted);
            }
            lifecycle.state = LifecycleState::Starting;
        }

        debug!(
            broker = %self.config.broker,
            topic = %self.config.topic,
            encoding = %self.config.encoding,
            "Starting exporter"
        );

        let publisher = match self.open(registry).await {
            Ok(publisher) => Arc::new(publisher),
            Err(e) => {
                self.lifecycle.write().state = LifecycleState::Stopped;
                debug!(error = %e, "Exporter failed to start");
                return Err(e);
            }
        };

        let installed = {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state == LifecycleState::Starting {
                lifecycle.state = LifecycleState::Running;
                lifecycle.publisher = Some(publisher);
                true
            } else {
                false
            }
        };

        if !installed {
            // shutdown ran while we were connecting; it may have found nothing to close
            let _ = self.connection.disconnect(self.config.shutdown_grace()).await;
            return Err(ExporterError::NotReady("exporter was shut down while starting"));
        }

        debug!("Exporter running");
        Ok(())
    }

    async fn open(&self, registry: &ExtensionRegistry) -> Result<MetricsPublisher> {
        let encoder = encoding::resolve(&self.config.encoding, registry)?;

        self.connection
            .connect(&self.config.broker, &self.config.client_id)
            .await?;

        Ok(MetricsPublisher::new(
            self.config.topic.clone(),
            self.config.qos,
            encoder,
            Arc::clone(&self.connection),
        ))
    }

    /// Encode and publish one batch, returning once the broker acknowledged it.
    pub async fn push(&self, batch: &MetricsBatch) -> Result<()> {
        let publisher = {
            let lifecycle = self.lifecycle.read();
            match (lifecycle.state, &lifecycle.publisher) {
                (LifecycleState::Running, Some(publisher)) => Arc::clone(publisher),
                (state, _) => return Err(ExporterError::NotReady(state.not_ready_reason())),
            }
        };

        publisher.push(batch).await
    }

    /// Stop accepting pushes and disconnect, allowing `grace` for in-flight work.
    ///
    /// Idempotent. The exporter is `Stopped` afterwards even when the
    /// disconnect timed out.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let previous = {
            let mut lifecycle = self.lifecycle.write();
            let previous = lifecycle.state;
            match previous {
                LifecycleState::Starting | LifecycleState::Running => {
                    lifecycle.state = LifecycleState::ShuttingDown;
                    lifecycle.publisher = None;
                }
                LifecycleState::Uninitialized => lifecycle.state = LifecycleState::Stopped,
                LifecycleState::ShuttingDown | LifecycleState::Stopped => {}
            }
            previous
        };

        if !matches!(previous, LifecycleState::Starting | LifecycleState::Running) {
            debug!(state = %previous, "Shutdown requested with nothing to close");
            return Ok(());
        }

        debug!(grace_ms = grace.as_millis() as u64, "Shutting down exporter");

        let result = self.connection.disconnect(grace).await;
        self.lifecycle.write().state = LifecycleState::Stopped;

        debug!(clean = result.is_ok(), "Exporter stopped");
        result.map_err(ExporterError::from)
    }
}

impl std::fmt::Debug for MqttExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttExporter")
            .field("state", &self.state())
            .field("connection", &self.connection)
            .field("topic", &self.config.topic)
            .finish_non_exhaustive()
    }
}
