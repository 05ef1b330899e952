//! The push pipeline: encode, publish, report.

use std::sync::Arc;

use metricsmq_common::MetricsBatch;
use tracing::trace;

use crate::config::QualityOfService;
use crate::connection::BrokerConnection;
use crate::encoding::EncoderHandle;
use crate::error::{ExporterError, Result};

/// Publishes every pushed batch as one message on a fixed topic.
///
/// Holds no buffer and never retries; each `push` maps to at most one
/// publish and its outcome is returned as-is.
#[derive(Debug)]
pub struct MetricsPublisher {
    topic: String,
    qos: QualityOfService,
    encoder: EncoderHandle,
    connection: Arc<BrokerConnection>,
}

impl MetricsPublisher {
    pub fn new(
        topic: impl Into<String>,
        qos: QualityOfService,
        encoder: EncoderHandle,
        connection: Arc<BrokerConnection>,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            encoder,
            connection,
        }
    }

    /// Encode `batch` and publish it, waiting for the broker's acknowledgment.
    pub async fn push(&self, batch: &MetricsBatch) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(ExporterError::NotReady("broker connection is not established"));
        }

        let payload = self.encoder.encode(batch)?;
        let bytes = payload.len();

        self.connection
            .publish(&self.topic, payload, self.qos)
            .await?;

        trace!(
            topic = %self.topic,
            encoding = %self.encoder.id(),
            points = batch.len(),
            bytes,
            "Batch delivered"
        );

        Ok(())
    }
}
