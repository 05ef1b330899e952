//! Broker connection lifecycle.
//!
//! [`BrokerConnection`] owns exactly one [`Transport`] and is the only place
//! the network session is touched. Every transport call happens under one
//! async mutex, so concurrent publishers are serialized and a disconnect never
//! overlaps a publish on the wire.
//!
//! ```text
//!  Disconnected ──connect──> Connecting ──CONNACK──> Connected
//!       ^                         │                      │
//!       └────────── error ────────┘                 disconnect
//!       ^                                                │
//!       └──────────────────── Disconnecting <────────────┘
//! ```

mod mqtt;

pub use mqtt::MqttTransport;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::{BrokerConfig, QualityOfService};
use crate::error::{ConnectError, DisconnectTimeout, PublishError};

/// State of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network session to a message broker.
///
/// Implementations do not need internal locking: [`BrokerConnection`] never
/// calls into a transport concurrently. Timeouts are also applied by the
/// caller, so every method may wait as long as the network takes, but must
/// leave the transport reusable for [`Transport::close`] if dropped mid-way.
#[async_trait]
pub trait Transport: Send {
    /// Open the session and wait for the broker to accept it.
    async fn connect(&mut self, broker: &BrokerConfig, client_id: &str)
    -> Result<(), ConnectError>;

    /// Send one message and wait for the acknowledgment its QoS requires.
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError>;

    /// Flush in-flight work and close the session politely.
    async fn disconnect(&mut self);

    /// Drop the session immediately.
    fn close(&mut self);
}

/// The exporter's single connection to the broker.
pub struct BrokerConnection {
    transport: Mutex<Box<dyn Transport>>,
    state: RwLock<ConnectionState>,
    connect_timeout: Duration,
    publish_timeout: Duration,
}

impl BrokerConnection {
    /// Wrap a transport. No I/O happens until [`connect`](Self::connect).
    pub fn new(
        transport: impl Transport + 'static,
        connect_timeout: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport: Mutex::new(Box::new(transport)),
            state: RwLock::new(ConnectionState::Disconnected),
            connect_timeout,
            publish_timeout,
        }
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            trace!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Open the session, waiting at most the connect timeout for the broker.
    pub async fn connect(
        &self,
        broker: &BrokerConfig,
        client_id: &str,
    ) -> Result<(), ConnectError> {
        let mut transport = self.transport.lock().await;

        if self.state() != ConnectionState::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }

        self.set_state(ConnectionState::Connecting);
        debug!(broker = %broker, client_id = %client_id, "Connecting to broker");

        let outcome =
            tokio::time::timeout(self.connect_timeout, transport.connect(broker, client_id)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                transport.close();
                Err(ConnectError::Timeout(self.connect_timeout))
            }
        };

        match &result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                debug!(broker = %broker, "Connected to broker");
            }
            Err(_) => self.set_state(ConnectionState::Disconnected),
        }

        result
    }

    /// Publish one payload and wait for its acknowledgment.
    ///
    /// Fails with [`PublishError::NotConnected`] without touching the
    /// transport unless the session is `Connected`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError> {
        let mut transport = self.transport.lock().await;

        if self.state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }

        let len = payload.len();
        let outcome =
            tokio::time::timeout(self.publish_timeout, transport.publish(topic, payload, qos)).await;
        let result = outcome.unwrap_or(Err(PublishError::Timeout(self.publish_timeout)));

        match &result {
            Ok(()) => {
                trace!(topic = %topic, bytes = len, qos = qos.level(), "Publish acknowledged")
            }
            Err(PublishError::ConnectionLost(reason)) => {
                // the session is gone; nothing can be published on it again
                debug!(reason = %reason, "Broker session lost");
                transport.close();
                self.set_state(ConnectionState::Disconnected);
            }
            Err(_) => {}
        }

        result
    }

    /// Close the session, allowing `grace` for in-flight work to drain.
    ///
    /// Always ends `Disconnected`. Returns [`DisconnectTimeout`] when the
    /// session had to be force-closed. A no-op when already disconnected.
    pub async fn disconnect(&self, grace: Duration) -> Result<(), DisconnectTimeout> {
        let mut transport = self.transport.lock().await;

        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);

        let outcome = tokio::time::timeout(grace, transport.disconnect()).await;
        let result = match outcome {
            Ok(()) => Ok(()),
            Err(_) => {
                transport.close();
                Err(DisconnectTimeout { grace })
            }
        };

        self.set_state(ConnectionState::Disconnected);
        debug!(forced = result.is_err(), "Disconnected from broker");

        result
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("state", &self.state())
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}
