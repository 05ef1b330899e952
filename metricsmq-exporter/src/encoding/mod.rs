//! Late-bound payload encodings.
//!
//! The exporter does not know at construction time how batches are
//! serialized. The host hands [`start`](crate::MqttExporter::start) an
//! [`ExtensionRegistry`], and the configured encoding identifier is looked up
//! in it exactly once via [`resolve`].
//!
//! Registries may hold extensions that are not encoders (health checks,
//! authenticators, ...); asking for one of those as an encoding is a
//! [`ResolutionError::NotAnEncoder`].

mod format;
mod otlp;

pub use format::FormatEncoder;
pub use otlp::OtlpEncoder;

use std::collections::HashMap;
use std::sync::Arc;

use metricsmq_common::{Format, MetricsBatch};
use tracing::debug;

use crate::error::{EncodeError, ResolutionError};

/// Turns a batch into wire bytes.
pub trait MetricsEncoder: Send + Sync {
    fn encode(&self, batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError>;
}

/// A component the host can register by identifier.
pub trait Extension: Send + Sync {
    /// Short description used in diagnostics.
    fn kind(&self) -> &'static str;

    /// The metrics encoder capability, if this extension has it.
    fn as_metrics_encoder(self: Arc<Self>) -> Option<Arc<dyn MetricsEncoder>> {
        None
    }
}

/// Adapter registering a bare encoder as an extension.
struct EncoderExtension(Arc<dyn MetricsEncoder>);

impl Extension for EncoderExtension {
    fn kind(&self) -> &'static str {
        "metrics-encoder"
    }

    fn as_metrics_encoder(self: Arc<Self>) -> Option<Arc<dyn MetricsEncoder>> {
        Some(self.0.clone())
    }
}

/// Identifier to extension map supplied by the host.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the encodings shipped in this crate:
    /// `otlp`, `json` and `cbor`.
    pub fn with_builtin_encoders() -> Self {
        let mut registry = Self::new();
        registry.register_encoder("otlp", OtlpEncoder::default());
        registry.register_encoder("json", FormatEncoder::new(Format::Json));
        registry.register_encoder("cbor", FormatEncoder::new(Format::Cbor));
        registry
    }

    /// Register an extension, returning the one it replaced.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        extension: Arc<dyn Extension>,
    ) -> Option<Arc<dyn Extension>> {
        self.extensions.insert(id.into(), extension)
    }

    /// Register an encoder under `id`.
    pub fn register_encoder(
        &mut self,
        id: impl Into<String>,
        encoder: impl MetricsEncoder + 'static,
    ) -> Option<Arc<dyn Extension>> {
        self.register(id, Arc::new(EncoderExtension(Arc::new(encoder))))
    }

    /// Look up an extension by identifier.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.extensions.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.extensions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.ids().into_iter().map(|id| (id, self.extensions[id].kind())))
            .finish()
    }
}

/// A resolved encoder, usable for the rest of the exporter's life.
#[derive(Clone)]
pub struct EncoderHandle {
    id: String,
    encoder: Arc<dyn MetricsEncoder>,
}

impl EncoderHandle {
    /// Identifier the encoder was resolved from.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encode(&self, batch: &MetricsBatch) -> Result<Vec<u8>, EncodeError> {
        self.encoder.encode(batch)
    }
}

impl std::fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderHandle").field("id", &self.id).finish()
    }
}

/// Look up `encoding_id` in `registry` and return its encoder capability.
pub fn resolve(
    encoding_id: &str,
    registry: &ExtensionRegistry,
) -> Result<EncoderHandle, ResolutionError> {
    let extension = registry
        .get(encoding_id)
        .ok_or_else(|| ResolutionError::NotFound {
            id: encoding_id.to_string(),
        })?;

    let encoder = Arc::clone(extension)
        .as_metrics_encoder()
        .ok_or_else(|| ResolutionError::NotAnEncoder {
            id: encoding_id.to_string(),
        })?;

    debug!(encoding = %encoding_id, kind = extension.kind(), "Resolved encoder");

    Ok(EncoderHandle {
        id: encoding_id.to_string(),
        encoder,
    })
}
