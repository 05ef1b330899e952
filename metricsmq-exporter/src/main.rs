//! MQTT metrics exporter for metricsmq telemetry.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use metricsmq_common::init_tracing;
use metricsmq_exporter::{ExporterConfig, ExtensionRegistry, MqttExporter, TelemetrySubscriber};

/// Publish metricsmq telemetry to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "metricsmq-exporter")]
#[command(about = "Publish metricsmq telemetry batches to an MQTT broker")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Broker host (overrides config).
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port (overrides config).
    #[arg(long)]
    broker_port: Option<u16>,

    /// Topic to publish to (overrides config).
    #[arg(long)]
    topic: Option<String>,

    /// Payload encoding: otlp, json or cbor (overrides config).
    #[arg(long)]
    encoding: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(host) = self.broker_host {
            config.mqtt.broker.host = host;
        }
        if let Some(port) = self.broker_port {
            config.mqtt.broker.port = port;
        }
        if let Some(topic) = self.topic {
            config.mqtt.topic = topic;
        }
        if let Some(encoding) = self.encoding {
            config.mqtt.encoding = encoding;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ExporterConfig::load_from_file(path)?,
        None => ExporterConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting metricsmq MQTT exporter");
    info!(
        broker = %config.mqtt.broker,
        topic = %config.mqtt.topic,
        qos = config.mqtt.qos.level(),
        encoding = %config.mqtt.encoding,
        key_expr = %config.batching.key_expr,
        "Configuration loaded"
    );

    let registry = ExtensionRegistry::with_builtin_encoders();
    let exporter = Arc::new(MqttExporter::new(config.mqtt.clone()));

    if let Err(e) = exporter.start(&registry).await {
        error!(error = %e, available = ?registry.ids(), "Failed to start exporter");
        return Err(e.into());
    }
    info!(broker = %config.mqtt.broker, "Connected to broker");

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let subscriber = TelemetrySubscriber::new(
        exporter.clone(),
        config.zenoh.clone(),
        config.batching.clone(),
        &config.filters,
    );
    let subscriber_task = tokio::spawn(subscriber.run(shutdown_rx));

    shutdown_signal().await;

    // The subscriber may already be gone after an error
    let _ = shutdown_tx.send(true);

    // Room for the final flush, including its retries
    let drain_timeout = Duration::from_secs(5)
        + config.mqtt.publish_timeout() * (config.batching.max_retries + 1)
        + config.batching.retry_backoff() * config.batching.max_retries;

    let stats = match tokio::time::timeout(drain_timeout, subscriber_task).await {
        Ok(Ok(Ok(stats))) => Some(stats),
        Ok(Ok(Err(e))) => {
            error!("Subscriber error: {}", e);
            None
        }
        Ok(Err(e)) => {
            error!("Subscriber task failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Subscriber did not stop within {:?}", drain_timeout);
            None
        }
    };

    if let Err(e) = exporter.shutdown(config.mqtt.shutdown_grace()).await {
        warn!(error = %e, "Broker session was not closed cleanly");
    }

    if let Some(stats) = stats {
        info!(
            points_received = stats.points_received,
            points_filtered = stats.points_filtered,
            decode_errors = stats.decode_errors,
            batches_published = stats.batches_published,
            points_published = stats.points_published,
            publish_retries = stats.publish_retries,
            batches_dropped = stats.batches_dropped,
            points_dropped = stats.points_dropped,
            "Final statistics"
        );
    }

    info!("Exporter stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
