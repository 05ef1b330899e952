//! OTLP protobuf encoding.
//!
//! A batch becomes one `ExportMetricsServiceRequest`. Points are grouped by
//! source into one resource each, identified by `host.name`:
//!
//! | MetricValue | OTLP data                          |
//! |-------------|------------------------------------|
//! | Counter     | Sum, monotonic, cumulative, AsInt  |
//! |             | (AsDouble above `i64::MAX`)        |
//! | Gauge       | Gauge, AsDouble                    |
//! | Boolean     | Gauge, AsInt (0/1)                 |
//! | Text        | skipped                            |

use std::collections::BTreeMap;

use metricsmq_common::{MetricPoint, MetricValue, MetricsBatch};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
    metric::Data, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;
use tracing::trace;

use super::MetricsEncoder;
use crate::error::EncodeError;

/// Encodes batches as OTLP `ExportMetricsServiceRequest` protobuf.
#[derive(Debug, Clone)]
pub struct OtlpEncoder {
    scope_name: String,
    scope_version: String,
}

impl Default for OtlpEncoder {
    fn default() -> Self {
        Self {
            scope_name: env!("CARGO_PKG_NAME").to_string(),
            scope_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl OtlpEncoder {
    /// Encoder reporting a custom instrumentation scope.
    pub fn with_scope(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            scope_name: name.into(),
            scope_version: version.into(),
        }
    }

    /// Build the request without serializing it.
    pub fn build_request(
        &self,
        batch: &MetricsBatch,
    ) -> Result<ExportMetricsServiceRequest, EncodeError> {
        let mut by_source: BTreeMap<&str, Vec<Metric>> = BTreeMap::new();
        let mut skipped = 0usize;

        for point in batch.points() {
            let Some(metric) = to_metric(point) else {
                skipped += 1;
                continue;
            };
            by_source
                .entry(point.source.as_str())
                .or_default()
                .push(metric);
        }

        if by_source.is_empty() {
            return Err(EncodeError::Unsupported(format!(
                "batch of {} points has no numeric values",
                batch.len()
            )));
        }

        if skipped > 0 {
            trace!(skipped, "Skipped non-numeric points");
        }

        let resource_metrics = by_source
            .into_iter()
            .map(|(source, metrics)| ResourceMetrics {
                resource: Some(Resource {
                    attributes: vec![string_attribute("host.name", source)],
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(InstrumentationScope {
                        name: self.scope_name.clone(),
                        version: self.scope_version.clone(),
                        ..Default::default()
                    }),
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect();

        Ok(ExportMetricsServiceRequest { resource_metrics })
    }
}

impl MetricsEncoder for OtlpEncoder {
    fn encode(&self, batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError> {
        Ok(self.build_request(batch)?.encode_to_vec())
    }
}

fn string_attribute(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn to_metric(point: &MetricPoint) -> Option<Metric> {
    let value = match &point.value {
        MetricValue::Counter(v) => match i64::try_from(*v) {
            Ok(v) => number_data_point::Value::AsInt(v),
            // past i64::MAX only a double can hold the value
            Err(_) => number_data_point::Value::AsDouble(*v as f64),
        },
        MetricValue::Gauge(v) => number_data_point::Value::AsDouble(*v),
        MetricValue::Boolean(v) => number_data_point::Value::AsInt(i64::from(*v)),
        MetricValue::Text(_) => return None,
    };

    let data_point = NumberDataPoint {
        attributes: point
            .labels
            .iter()
            .map(|(k, v)| string_attribute(k, v))
            .collect(),
        time_unix_nano: u64::try_from(point.timestamp)
            .unwrap_or(0)
            .saturating_mul(1_000_000),
        value: Some(value),
        ..Default::default()
    };

    let data = match point.value {
        MetricValue::Counter(_) => Data::Sum(Sum {
            data_points: vec![data_point],
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
        }),
        _ => Data::Gauge(Gauge {
            data_points: vec![data_point],
        }),
    };

    Some(Metric {
        name: point.name.replace('/', "."),
        unit: point.unit.clone().unwrap_or_default(),
        data: Some(data),
        ..Default::default()
    })
}
