//! Zenoh subscriber feeding batches to the exporter.
//!
//! Samples published under `batching.key_expr` are decoded as
//! [`MetricPoint`]s (JSON or CBOR), filtered, and accumulated. The pending
//! batch is pushed every `interval_ms`, or as soon as it holds `max_points`.

use std::sync::Arc;

use metricsmq_common::{MetricPoint, MetricsBatch, ZenohConfig, decode_auto};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use zenoh::sample::{Sample, SampleKind};

use crate::config::{BatchingConfig, FilterConfig};
use crate::error::ExporterError;
use crate::exporter::MqttExporter;

/// Decides which samples are exported.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFilter {
    include_sources: Vec<String>,
    exclude_sources: Vec<String>,
    include_metrics: Vec<String>,
    exclude_metrics: Vec<String>,
}

impl TelemetryFilter {
    /// Create a new filter from configuration.
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            include_sources: config.include_sources.clone(),
            exclude_sources: config.exclude_sources.clone(),
            include_metrics: config.include_metrics.clone(),
            exclude_metrics: config.exclude_metrics.clone(),
        }
    }

    /// Check if a point should be exported.
    pub fn should_include(&self, point: &MetricPoint) -> bool {
        if !self.include_sources.is_empty()
            && !self.include_sources.iter().any(|s| s == &point.source)
        {
            return false;
        }
        if self.exclude_sources.iter().any(|s| s == &point.source) {
            return false;
        }

        let name = point.name.as_str();
        if !self.include_metrics.is_empty()
            && !self.include_metrics.iter().any(|p| name.starts_with(p.as_str()))
        {
            return false;
        }
        if self
            .exclude_metrics
            .iter()
            .any(|p| name.starts_with(p.as_str()))
        {
            return false;
        }

        true
    }
}

/// Counters reported when the subscriber stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub points_received: u64,
    pub points_filtered: u64,
    pub decode_errors: u64,
    pub batches_published: u64,
    pub points_published: u64,
    pub publish_retries: u64,
    pub batches_dropped: u64,
    pub points_dropped: u64,
}

/// Filters points into the pending batch.
#[derive(Debug)]
pub struct BatchAccumulator {
    filter: TelemetryFilter,
    max_points: usize,
    pending: MetricsBatch,
}

impl BatchAccumulator {
    pub fn new(filter: TelemetryFilter, max_points: usize) -> Self {
        Self {
            filter,
            max_points: max_points.max(1),
            pending: MetricsBatch::with_capacity(max_points.min(4096)),
        }
    }

    /// Offer a point. Returns a full batch once `max_points` is reached.
    pub fn offer(
        &mut self,
        point: MetricPoint,
        stats: &mut ExporterStats,
    ) -> Option<MetricsBatch> {
        stats.points_received += 1;

        if !self.filter.should_include(&point) {
            stats.points_filtered += 1;
            trace!(source = %point.source, metric = %point.name, "Point filtered");
            return None;
        }

        self.pending.push(point);
        (self.pending.len() >= self.max_points).then(|| self.pending.take())
    }

    /// Take whatever is pending, if anything.
    pub fn drain(&mut self) -> Option<MetricsBatch> {
        (!self.pending.is_empty()).then(|| self.pending.take())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Push `batch`, retrying transient failures.
///
/// Makes at most `1 + max_retries` attempts, sleeping `retry_backoff`
/// between them. Non-retryable errors end the attempt immediately.
pub async fn deliver(
    exporter: &MqttExporter,
    batch: &MetricsBatch,
    batching: &BatchingConfig,
    stats: &mut ExporterStats,
) -> Result<(), ExporterError> {
    let mut attempt = 0;

    loop {
        match exporter.push(batch).await {
            Ok(()) => {
                stats.batches_published += 1;
                stats.points_published += batch.len() as u64;
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < batching.max_retries => {
                attempt += 1;
                stats.publish_retries += 1;
                debug!(attempt, error = %e, "Retrying batch");
                tokio::time::sleep(batching.retry_backoff()).await;
            }
            Err(e) => {
                stats.batches_dropped += 1;
                stats.points_dropped += batch.len() as u64;
                return Err(e);
            }
        }
    }
}

/// Zenoh subscriber that feeds telemetry to the exporter.
pub struct TelemetrySubscriber {
    exporter: Arc<MqttExporter>,
    zenoh_config: ZenohConfig,
    batching: BatchingConfig,
    accumulator: BatchAccumulator,
    stats: ExporterStats,
}

impl TelemetrySubscriber {
    pub fn new(
        exporter: Arc<MqttExporter>,
        zenoh_config: ZenohConfig,
        batching: BatchingConfig,
        filters: &FilterConfig,
    ) -> Self {
        let accumulator = BatchAccumulator::new(TelemetryFilter::new(filters), batching.max_points);
        Self {
            exporter,
            zenoh_config,
            batching,
            accumulator,
            stats: ExporterStats::default(),
        }
    }

    /// Run until the shutdown signal, then flush and return the final statistics.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<ExporterStats> {
        let session = metricsmq_common::connect(&self.zenoh_config).await?;

        info!(key_expr = %self.batching.key_expr, "Subscribing to telemetry");
        let subscriber = session
            .declare_subscriber(self.batching.key_expr.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create subscriber: {}", e))?;

        let mut ticker = tokio::time::interval(self.batching.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Subscriber started, waiting for telemetry...");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping subscriber");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Some(batch) = self.accumulator.drain() {
                        self.flush(batch).await;
                    }
                }

                sample = subscriber.recv_async() => {
                    match sample {
                        Ok(sample) => {
                            if let Some(batch) = self.handle_sample(&sample) {
                                self.flush(batch).await;
                            }
                        }
                        Err(e) => {
                            warn!("Error receiving sample: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(batch) = self.accumulator.drain() {
            debug!(points = batch.len(), "Final flush");
            self.flush(batch).await;
        }

        subscriber
            .undeclare()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to undeclare subscriber: {}", e))?;
        session
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close session: {}", e))?;

        info!("Subscriber stopped");
        Ok(self.stats)
    }

    fn handle_sample(&mut self, sample: &Sample) -> Option<MetricsBatch> {
        if sample.kind() == SampleKind::Delete {
            trace!(key = %sample.key_expr(), "Ignoring delete sample");
            return None;
        }

        let payload = sample.payload().to_bytes();
        match decode_auto::<MetricPoint>(&payload) {
            Ok(point) => {
                trace!(
                    source = %point.source,
                    metric = %point.name,
                    "Received metric point"
                );
                self.accumulator.offer(point, &mut self.stats)
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!(
                    key = %sample.key_expr(),
                    payload_len = payload.len(),
                    error = %e,
                    "Failed to decode metric point"
                );
                None
            }
        }
    }

    async fn flush(&mut self, batch: MetricsBatch) {
        let points = batch.len();
        if let Err(e) = deliver(&self.exporter, &batch, &self.batching, &mut self.stats).await {
            warn!(points, error = %e, "Dropping batch");
        }
    }
}
