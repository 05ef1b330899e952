//! Self-describing encodings (`json`, `cbor`).
//!
//! The payload is the batch exactly as it travels on the upstream bus, so a
//! subscriber can decode it with `metricsmq_common::decode_auto`.

use metricsmq_common::{Format, MetricsBatch};

use super::MetricsEncoder;
use crate::error::EncodeError;

/// Encodes batches with one of the shared serialization formats.
#[derive(Debug, Clone, Copy)]
pub struct FormatEncoder {
    format: Format,
}

impl FormatEncoder {
    pub fn new(format: Format) -> Self {
        Self { format }
    }
}

impl MetricsEncoder for FormatEncoder {
    fn encode(&self, batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError> {
        // serde_json writes NaN and infinities as null, which would not decode back
        if self.format == Format::Json {
            let non_finite = batch
                .points()
                .iter()
                .find(|p| p.value.as_f64().is_some_and(|v| !v.is_finite()));
            if let Some(point) = non_finite {
                return Err(EncodeError::Unsupported(format!(
                    "non-finite gauge {}/{} cannot be represented in JSON",
                    point.source, point.name
                )));
            }
        }

        metricsmq_common::encode(batch, self.format)
            .map_err(|e| EncodeError::Serialization(e.to_string()))
    }
}
