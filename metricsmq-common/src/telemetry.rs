use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single metric sample produced upstream of the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Unix epoch milliseconds when the sample was taken.
    pub timestamp: i64,

    /// Host or device that produced the sample (e.g., "edge-node-3").
    pub source: String,

    /// Metric name (e.g., "cpu/usage", "net/eth0/rx_bytes").
    pub name: String,

    /// The sampled value.
    pub value: MetricValue,

    /// Unit of measurement, UCUM style ("By", "%", "s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Extra dimensions attached to the sample.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricPoint {
    /// Create a new sample stamped with the current time.
    pub fn new(source: impl Into<String>, name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            source: source.into(),
            name: name.into(),
            value,
            unit: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set the unit of measurement.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Typed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Monotonically increasing counter.
    Counter(u64),

    /// Point-in-time measurement.
    Gauge(f64),

    /// On/off state.
    Boolean(bool),

    /// Free-form text (status strings, versions).
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Counter(v) => Some(*v as f64),
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Counter(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Gauge(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Boolean(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// A batch of samples handed to the exporter in one push.
///
/// The exporter never looks inside a batch; only encoders do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    points: Vec<MetricPoint>,
}

impl MetricsBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: MetricPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Move the accumulated points out, leaving this batch empty.
    pub fn take(&mut self) -> MetricsBatch {
        MetricsBatch {
            points: std::mem::take(&mut self.points),
        }
    }
}

impl From<Vec<MetricPoint>> for MetricsBatch {
    fn from(points: Vec<MetricPoint>) -> Self {
        Self { points }
    }
}

impl FromIterator<MetricPoint> for MetricsBatch {
    fn from_iter<I: IntoIterator<Item = MetricPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl Extend<MetricPoint> for MetricsBatch {
    fn extend<I: IntoIterator<Item = MetricPoint>>(&mut self, iter: I) {
        self.points.extend(iter);
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
