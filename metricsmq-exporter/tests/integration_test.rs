//! Integration tests for the MQTT exporter.
//!
//! A recording in-memory transport stands in for the broker, so these run
//! without network access.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use metricsmq_exporter::config::{BatchingConfig, BrokerConfig, ConfigError};
use metricsmq_exporter::subscriber::{ExporterStats, deliver};
use metricsmq_exporter::{
    ConnectError, ConnectionState, DisconnectTimeout, EncodeError, Extension, ExporterConfig,
    ExporterError, ExtensionRegistry, LifecycleState, MetricPoint, MetricValue, MetricsBatch,
    MetricsEncoder, MqttConfig, MqttExporter, PublishError, QualityOfService, ResolutionError,
    Transport,
};

const GRACE: Duration = Duration::from_millis(250);

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Connect { broker: String, client_id: String },
    PublishBegin { topic: String, payload: Vec<u8>, qos: QualityOfService },
    PublishEnd,
    Disconnect,
    Close,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    fn record(&self, call: Call) {
        self.0.lock().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    fn publishes(&self) -> Vec<(String, Vec<u8>, QualityOfService)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PublishBegin {
                    topic,
                    payload,
                    qos,
                } => Some((topic, payload, qos)),
                _ => None,
            })
            .collect()
    }

    fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Connect { .. }))
            .count()
    }
}

#[derive(Default)]
struct FakeTransport {
    recorder: Recorder,
    connect_error: Option<ConnectError>,
    publish_failures: VecDeque<PublishError>,
    always_fail: Option<PublishError>,
    publish_delay: Duration,
    publish_started: Option<Arc<Notify>>,
    stall_disconnect: bool,
}

impl FakeTransport {
    fn new(recorder: &Recorder) -> Self {
        Self {
            recorder: recorder.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &mut self,
        broker: &BrokerConfig,
        client_id: &str,
    ) -> Result<(), ConnectError> {
        self.recorder.record(Call::Connect {
            broker: broker.to_string(),
            client_id: client_id.to_string(),
        });
        match self.connect_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError> {
        self.recorder.record(Call::PublishBegin {
            topic: topic.to_string(),
            payload,
            qos,
        });
        if let Some(started) = &self.publish_started {
            started.notify_one();
        }
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
        self.recorder.record(Call::PublishEnd);

        if let Some(e) = self.publish_failures.pop_front() {
            return Err(e);
        }
        match self.always_fail.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&mut self) {
        self.recorder.record(Call::Disconnect);
        if self.stall_disconnect {
            std::future::pending::<()>().await;
        }
    }

    fn close(&mut self) {
        self.recorder.record(Call::Close);
    }
}

/// Encoder returning the same bytes for every batch.
struct FixedEncoder(Vec<u8>);

impl MetricsEncoder for FixedEncoder {
    fn encode(&self, _batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError> {
        Ok(self.0.clone())
    }
}

struct FailingEncoder;

impl MetricsEncoder for FailingEncoder {
    fn encode(&self, _batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::Serialization("value out of range".to_string()))
    }
}

/// Extension without the encoder capability.
struct Authenticator;

impl Extension for Authenticator {
    fn kind(&self) -> &'static str {
        "authenticator"
    }
}

fn config() -> MqttConfig {
    MqttConfig {
        topic: "telemetry/metrics".to_string(),
        qos: QualityOfService::AtMostOnce,
        encoding: "otlp".to_string(),
        ..Default::default()
    }
}

fn stub_registry() -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    registry.register_encoder("otlp", FixedEncoder(vec![1, 2, 3]));
    registry
}

fn batch() -> MetricsBatch {
    vec![
        MetricPoint::new("edge-1", "cpu/usage", MetricValue::Gauge(12.5)),
        MetricPoint::new("edge-1", "net/rx_bytes", MetricValue::Counter(4096)),
    ]
    .into()
}

async fn running_exporter(transport: FakeTransport) -> MqttExporter {
    let exporter = MqttExporter::with_transport(config(), transport);
    exporter.start(&stub_registry()).await.unwrap();
    exporter
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_then_shutdown_without_push() {
    let recorder = Recorder::default();
    let exporter = running_exporter(FakeTransport::new(&recorder)).await;

    exporter.shutdown(GRACE).await.unwrap();

    assert_eq!(exporter.state(), LifecycleState::Stopped);
    assert_eq!(exporter.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.calls(),
        vec![
            Call::Connect {
                broker: "127.0.0.1:1883".to_string(),
                client_id: "metricsmq-exporter".to_string(),
            },
            Call::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_push_before_start_is_not_ready() {
    let recorder = Recorder::default();
    let exporter = MqttExporter::with_transport(config(), FakeTransport::new(&recorder));

    let err = exporter.push(&batch()).await.unwrap_err();

    assert!(matches!(err, ExporterError::NotReady(_)), "{err:?}");
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_twice() {
    let recorder = Recorder::default();
    let exporter = running_exporter(FakeTransport::new(&recorder)).await;

    exporter.shutdown(GRACE).await.unwrap();
    let calls = recorder.calls();

    exporter.shutdown(GRACE).await.unwrap();

    assert_eq!(recorder.calls(), calls);
    assert_eq!(exporter.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_shutdown_before_start_does_no_io() {
    let recorder = Recorder::default();
    let exporter = MqttExporter::with_transport(config(), FakeTransport::new(&recorder));

    exporter.shutdown(GRACE).await.unwrap();

    assert_eq!(exporter.state(), LifecycleState::Stopped);
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn test_push_after_shutdown_is_not_ready() {
    let recorder = Recorder::default();
    let exporter = running_exporter(FakeTransport::new(&recorder)).await;
    exporter.shutdown(GRACE).await.unwrap();

    let err = exporter.push(&batch()).await.unwrap_err();

    assert!(matches!(err, ExporterError::NotReady(_)), "{err:?}");
    assert!(recorder.publishes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_timeout_still_stops() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        stall_disconnect: true,
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;

    let err = exporter.shutdown(GRACE).await.unwrap_err();

    assert_eq!(
        err,
        ExporterError::DisconnectTimeout(DisconnectTimeout { grace: GRACE })
    );
    assert_eq!(exporter.state(), LifecycleState::Stopped);
    assert_eq!(exporter.connection_state(), ConnectionState::Disconnected);
    assert_eq!(recorder.calls().last(), Some(&Call::Close));

    // already stopped: no further transport calls
    exporter.shutdown(GRACE).await.unwrap();
    assert_eq!(recorder.calls().last(), Some(&Call::Close));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_push() {
    let recorder = Recorder::default();
    let started = Arc::new(Notify::new());
    let transport = FakeTransport {
        publish_delay: Duration::from_millis(100),
        publish_started: Some(started.clone()),
        ..FakeTransport::new(&recorder)
    };
    let exporter = Arc::new(running_exporter(transport).await);

    let pushing = {
        let exporter = exporter.clone();
        tokio::spawn(async move { exporter.push(&batch()).await })
    };
    started.notified().await;

    exporter.shutdown(GRACE).await.unwrap();

    assert!(pushing.await.unwrap().is_ok());
    let calls = recorder.calls();
    let end = calls.iter().position(|c| *c == Call::PublishEnd).unwrap();
    let disconnect = calls.iter().position(|c| *c == Call::Disconnect).unwrap();
    assert!(end < disconnect, "{calls:?}");
}

// =============================================================================
// Start failures
// =============================================================================

#[tokio::test]
async fn test_unknown_encoding() {
    let recorder = Recorder::default();
    let exporter = MqttExporter::with_transport(
        MqttConfig {
            encoding: "unknown".to_string(),
            ..config()
        },
        FakeTransport::new(&recorder),
    );

    let err = exporter.start(&stub_registry()).await.unwrap_err();

    assert_eq!(
        err,
        ExporterError::Resolution(ResolutionError::NotFound {
            id: "unknown".to_string()
        })
    );
    assert_eq!(exporter.state(), LifecycleState::Stopped);

    let err = exporter.push(&batch()).await.unwrap_err();
    assert!(matches!(err, ExporterError::NotReady(_)), "{err:?}");

    // resolution happens before any network activity
    assert_eq!(recorder.connects(), 0);
    assert!(exporter.shutdown(GRACE).await.is_ok());
}

#[tokio::test]
async fn test_extension_without_encoder_capability() {
    let mut registry = ExtensionRegistry::new();
    registry.register("otlp", Arc::new(Authenticator));
    let exporter = MqttExporter::with_transport(config(), FakeTransport::default());

    let err = exporter.start(&registry).await.unwrap_err();

    assert_eq!(
        err,
        ExporterError::Resolution(ResolutionError::NotAnEncoder {
            id: "otlp".to_string()
        })
    );
}

#[tokio::test]
async fn test_broker_rejects_session() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        connect_error: Some(ConnectError::Rejected {
            reason: "NotAuthorized".to_string(),
        }),
        ..FakeTransport::new(&recorder)
    };
    let exporter = MqttExporter::with_transport(config(), transport);

    let err = exporter.start(&stub_registry()).await.unwrap_err();

    assert!(matches!(err, ExporterError::Connect(ConnectError::Rejected { .. })));
    assert_eq!(exporter.state(), LifecycleState::Stopped);
    assert_eq!(exporter.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        exporter.push(&batch()).await,
        Err(ExporterError::NotReady(_))
    ));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let recorder = Recorder::default();
    let exporter = running_exporter(FakeTransport::new(&recorder)).await;

    let err = exporter.start(&stub_registry()).await.unwrap_err();

    assert_eq!(err, ExporterError::AlreadyStarted);
    assert_eq!(recorder.connects(), 1);
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn test_push_publishes_encoder_output() {
    let recorder = Recorder::default();
    let exporter = running_exporter(FakeTransport::new(&recorder)).await;

    exporter.push(&batch()).await.unwrap();

    assert_eq!(
        recorder.publishes(),
        vec![(
            "telemetry/metrics".to_string(),
            vec![1, 2, 3],
            QualityOfService::AtMostOnce
        )]
    );
}

#[tokio::test]
async fn test_failing_encoder_skips_publish() {
    let recorder = Recorder::default();
    let mut registry = ExtensionRegistry::new();
    registry.register_encoder("otlp", FailingEncoder);
    let exporter = MqttExporter::with_transport(config(), FakeTransport::new(&recorder));
    exporter.start(&registry).await.unwrap();

    let err = exporter.push(&batch()).await.unwrap_err();

    assert_eq!(
        err,
        ExporterError::Encode(EncodeError::Serialization(
            "value out of range".to_string()
        ))
    );
    assert!(recorder.publishes().is_empty());
    assert_eq!(exporter.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_failing_publish_keeps_connection() {
    let recorder = Recorder::default();
    let failure = PublishError::Transport("request queue closed".to_string());
    let transport = FakeTransport {
        always_fail: Some(failure.clone()),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;

    for _ in 0..3 {
        let err = exporter.push(&batch()).await.unwrap_err();
        assert_eq!(err, ExporterError::Publish(failure.clone()));
        assert!(err.is_retryable());
    }

    assert_eq!(recorder.publishes().len(), 3);
    assert_eq!(exporter.connection_state(), ConnectionState::Connected);
    assert_eq!(exporter.state(), LifecycleState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        publish_delay: Duration::from_secs(60),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;

    let err = exporter.push(&batch()).await.unwrap_err();

    assert_eq!(
        err,
        ExporterError::Publish(PublishError::Timeout(config().publish_timeout()))
    );
    assert_eq!(exporter.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connection_lost_needs_new_exporter() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        publish_failures: VecDeque::from([PublishError::ConnectionLost("eof".to_string())]),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;

    let err = exporter.push(&batch()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(exporter.connection_state(), ConnectionState::Disconnected);

    // no automatic reconnect
    let err = exporter.push(&batch()).await.unwrap_err();
    assert!(matches!(err, ExporterError::NotReady(_)), "{err:?}");
    assert_eq!(recorder.publishes().len(), 1);
    assert_eq!(recorder.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_pushes_do_not_interleave() {
    const PUSHES: usize = 8;

    let recorder = Recorder::default();
    let transport = FakeTransport {
        publish_delay: Duration::from_millis(10),
        ..FakeTransport::new(&recorder)
    };
    let exporter = Arc::new(MqttExporter::with_transport(
        MqttConfig {
            encoding: "json".to_string(),
            ..config()
        },
        transport,
    ));
    exporter
        .start(&ExtensionRegistry::with_builtin_encoders())
        .await
        .unwrap();

    let mut pushes = JoinSet::new();
    for i in 0..PUSHES {
        let exporter = exporter.clone();
        pushes.spawn(async move {
            let batch: MetricsBatch =
                vec![MetricPoint::new("edge-1", "seq", MetricValue::Counter(i as u64))].into();
            exporter.push(&batch).await
        });
    }
    while let Some(result) = pushes.join_next().await {
        result.unwrap().unwrap();
    }

    let wire: Vec<Call> = recorder
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::PublishBegin { .. } | Call::PublishEnd))
        .collect();
    assert_eq!(wire.len(), PUSHES * 2);
    for pair in wire.chunks(2) {
        assert!(matches!(pair[0], Call::PublishBegin { .. }), "{pair:?}");
        assert_eq!(pair[1], Call::PublishEnd);
    }

    let mut payloads: Vec<Vec<u8>> = recorder.publishes().into_iter().map(|p| p.1).collect();
    payloads.sort();
    payloads.dedup();
    assert_eq!(payloads.len(), PUSHES);
}

#[tokio::test]
async fn test_builtin_otlp_payload() {
    use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
    use prost::Message;

    let recorder = Recorder::default();
    let exporter = MqttExporter::with_transport(config(), FakeTransport::new(&recorder));
    exporter
        .start(&ExtensionRegistry::with_builtin_encoders())
        .await
        .unwrap();

    exporter.push(&batch()).await.unwrap();

    let (_, payload, _) = recorder.publishes().remove(0);
    let request = ExportMetricsServiceRequest::decode(payload.as_slice()).unwrap();
    assert_eq!(request.resource_metrics.len(), 1);
    assert_eq!(request.resource_metrics[0].scope_metrics[0].metrics.len(), 2);
}

// =============================================================================
// Host delivery
// =============================================================================

#[tokio::test]
async fn test_deliver_retries_transient_failures() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        publish_failures: VecDeque::from([
            PublishError::Timeout(Duration::from_secs(5)),
            PublishError::Transport("busy".to_string()),
        ]),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;
    let batching = BatchingConfig {
        max_retries: 2,
        retry_backoff_ms: 0,
        ..Default::default()
    };
    let mut stats = ExporterStats::default();

    deliver(&exporter, &batch(), &batching, &mut stats)
        .await
        .unwrap();

    assert_eq!(recorder.publishes().len(), 3);
    assert_eq!(stats.publish_retries, 2);
    assert_eq!(stats.batches_published, 1);
    assert_eq!(stats.points_published, 2);
}

#[tokio::test]
async fn test_deliver_gives_up() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        always_fail: Some(PublishError::Transport("busy".to_string())),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;
    let batching = BatchingConfig {
        max_retries: 1,
        retry_backoff_ms: 0,
        ..Default::default()
    };
    let mut stats = ExporterStats::default();

    let err = deliver(&exporter, &batch(), &batching, &mut stats)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(recorder.publishes().len(), 2);
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.points_dropped, 2);
}

#[tokio::test]
async fn test_deliver_does_not_retry_rejections() {
    let recorder = Recorder::default();
    let transport = FakeTransport {
        always_fail: Some(PublishError::Rejected("quota exceeded".to_string())),
        ..FakeTransport::new(&recorder)
    };
    let exporter = running_exporter(transport).await;
    let mut stats = ExporterStats::default();

    let err = deliver(&exporter, &batch(), &BatchingConfig::default(), &mut stats)
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(recorder.publishes().len(), 1);
    assert_eq!(stats.publish_retries, 0);
}

// =============================================================================
// Configuration files
// =============================================================================

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            // broker on the edge gateway
            mqtt: {{
                broker: {{ host: "gateway.local", port: 8883 }},
                topic: "site/7/metrics",
                qos: "at-least-once",
                encoding: "cbor",
            }},
            batching: {{ interval_ms: 250 }},
            logging: {{ level: "debug", format: "json" }},
        }}"#
    )
    .unwrap();

    let config = ExporterConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.mqtt.broker.to_string(), "gateway.local:8883");
    assert_eq!(config.mqtt.topic, "site/7/metrics");
    assert_eq!(config.mqtt.qos, QualityOfService::AtLeastOnce);
    assert_eq!(config.mqtt.encoding, "cbor");
    assert_eq!(config.batching.interval(), Duration::from_millis(250));
    assert_eq!(config.batching.max_points, 1000);
}

#[test]
fn test_load_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = ExporterConfig::load_from_file(dir.path().join("absent.json5")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)), "{err:?}");
}

#[test]
fn test_config_file_with_wildcard_topic() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ mqtt: {{ topic: "telemetry/+" }} }}"#).unwrap();

    let err = ExporterConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)), "{err:?}");
}

#[test]
fn test_malformed_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ mqtt: ").unwrap();

    let err = ExporterConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");
}
