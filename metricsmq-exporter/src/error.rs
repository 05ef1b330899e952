//! Error types for the exporter.
//!
//! Every component returns its own error enum; [`ExporterError`] is what the
//! host sees from `start`, `push` and `shutdown`.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Failure to establish the broker session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Broker could not be reached (DNS, TCP refused, TLS, I/O).
    #[error("broker {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// Broker answered the handshake with a non-success code
    /// (bad credentials, identifier rejected, server unavailable).
    #[error("broker rejected session: {reason}")]
    Rejected { reason: String },

    /// No CONNACK within the connect timeout.
    #[error("no connection acknowledgment within {0:?}")]
    Timeout(Duration),

    /// `connect` called on a connection that is not disconnected.
    #[error("connection already established")]
    AlreadyConnected,
}

/// Failure to resolve the configured encoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("encoding extension '{id}' is not registered")]
    NotFound { id: String },

    #[error("extension '{id}' is not a metrics encoder")]
    NotAnEncoder { id: String },
}

/// The encoder refused a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("unsupported batch: {0}")]
    Unsupported(String),
}

/// Failure to deliver one payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Publish attempted while the connection is not `Connected`.
    #[error("not connected to broker")]
    NotConnected,

    /// The client could not hand the message to the network.
    #[error("transport error: {0}")]
    Transport(String),

    /// The message was refused, either by the broker or locally for
    /// exceeding the maximum packet size.
    #[error("broker rejected publish: {0}")]
    Rejected(String),

    /// No acknowledgment within the publish timeout.
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    /// The session dropped while waiting for the acknowledgment.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Grace period elapsed before the session closed cleanly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("disconnect did not complete within {grace:?}, session force-closed")]
pub struct DisconnectTimeout {
    pub grace: Duration,
}

/// Errors surfaced to the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExporterError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("encoding resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("exporter not ready: {0}")]
    NotReady(&'static str),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    DisconnectTimeout(#[from] DisconnectTimeout),

    #[error("exporter already started")]
    AlreadyStarted,
}

impl ExporterError {
    /// Whether re-pushing the same batch may succeed.
    ///
    /// Only delivery failures qualify; encode and configuration failures
    /// will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExporterError::Publish(
                PublishError::Transport(_)
                    | PublishError::Timeout(_)
                    | PublishError::ConnectionLost(_)
            )
        )
    }
}
