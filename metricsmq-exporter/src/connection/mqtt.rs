//! MQTT transport over `rumqttc`.
//!
//! `rumqttc` splits a session into an [`AsyncClient`] that queues requests
//! and an [`EventLoop`] that performs the network I/O. After the CONNACK the
//! event loop is handed to a driver task, which keeps the session alive
//! (pings) and reports the delivery events `publish` waits on.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Transport;
use crate::config::{BrokerConfig, MqttConfig, QualityOfService};
use crate::error::{ConnectError, PublishError};

/// Capacity of the client-to-event-loop request queue.
const REQUEST_CAPACITY: usize = 16;

/// What the driver task saw on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeliveryEvent {
    /// A PUBLISH left the socket with this packet id (0 for QoS 0).
    Sent(u16),
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) for this packet id.
    Acked(u16),
    /// Our DISCONNECT was written; the driver has stopped.
    Closed,
    /// The session failed; the driver has stopped.
    Lost(String),
}

struct Session {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<DeliveryEvent>,
    driver: JoinHandle<()>,
    /// PUBLISH requests queued on the client whose `Sent` is not yet seen.
    /// The event loop writes requests in order, so the next `Sent` belongs
    /// to the oldest of them.
    unsent: usize,
}

impl Session {
    /// Account for a `Sent` event, returning whether it was the last one
    /// still outstanding.
    fn mark_sent(&mut self) -> bool {
        self.unsent = self.unsent.saturating_sub(1);
        self.unsent == 0
    }
}

/// Encoded size of a PUBLISH as rumqttc measures it against the maximum
/// outgoing packet size (before a packet id is assigned).
fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    let remaining = 2 + topic.len() + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// [`Transport`] speaking MQTT 3.1.1 to a single broker.
pub struct MqttTransport {
    keep_alive: Duration,
    max_packet_size: usize,
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            max_packet_size: config.max_packet_size,
            session: None,
        }
    }

    fn options(&self, broker: &BrokerConfig, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_size, self.max_packet_size);
        options
    }
}

/// Poll until the broker answers the CONNECT.
async fn await_connack(
    eventloop: &mut EventLoop,
    broker: &BrokerConfig,
) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ConnectError::Rejected {
                        reason: format!("{:?}", code),
                    }),
                };
            }
            Ok(event) => trace!(?event, "Event before CONNACK"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Rejected {
                    reason: format!("{:?}", code),
                });
            }
            Err(e) => {
                return Err(ConnectError::Unreachable {
                    endpoint: broker.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Drive the event loop until the session ends, forwarding delivery events.
async fn drive(mut eventloop: EventLoop, events: mpsc::UnboundedSender<DeliveryEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => DeliveryEvent::Sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => DeliveryEvent::Acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => DeliveryEvent::Acked(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(DeliveryEvent::Closed);
                return;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(DeliveryEvent::Lost("broker sent DISCONNECT".to_string()));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                // rumqttc reconnects on the next poll; stop here instead
                let _ = events.send(DeliveryEvent::Lost(e.to_string()));
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &mut self,
        broker: &BrokerConfig,
        client_id: &str,
    ) -> Result<(), ConnectError> {
        if self.session.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }

        let (client, mut eventloop) =
            AsyncClient::new(self.options(broker, client_id), REQUEST_CAPACITY);

        await_connack(&mut eventloop, broker).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, tx));

        self.session = Some(Session {
            client,
            events: rx,
            driver,
            unsent: 0,
        });

        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError> {
        let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;

        // rumqttc fails the whole event loop on an oversize packet
        let size = publish_packet_size(topic, payload.len());
        if size > self.max_packet_size {
            return Err(PublishError::Rejected(format!(
                "packet of {} bytes exceeds max_packet_size {}",
                size, self.max_packet_size
            )));
        }

        // events left over from publishes that timed out
        while let Ok(event) = session.events.try_recv() {
            match event {
                DeliveryEvent::Sent(_) => {
                    session.mark_sent();
                }
                DeliveryEvent::Lost(reason) => return Err(PublishError::ConnectionLost(reason)),
                DeliveryEvent::Closed => {
                    return Err(PublishError::ConnectionLost("session closed".to_string()));
                }
                stale => trace!(?stale, "Discarding stale delivery event"),
            }
        }

        session
            .client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        session.unsent += 1;

        let mut pkid = None;
        while let Some(event) = session.events.recv().await {
            match event {
                DeliveryEvent::Sent(id) if pkid.is_none() => {
                    if !session.mark_sent() {
                        trace!(pkid = id, "Skipping earlier publish");
                        continue;
                    }
                    if qos == QualityOfService::AtMostOnce {
                        return Ok(());
                    }
                    pkid = Some(id);
                }
                DeliveryEvent::Acked(id) if pkid == Some(id) => return Ok(()),
                DeliveryEvent::Lost(reason) => return Err(PublishError::ConnectionLost(reason)),
                DeliveryEvent::Closed => {
                    return Err(PublishError::ConnectionLost("session closed".to_string()));
                }
                other => trace!(?other, "Ignoring unrelated delivery event"),
            }
        }

        Err(PublishError::ConnectionLost("event loop stopped".to_string()))
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        // DISCONNECT is queued behind any pending publishes, so they go out first
        if session.client.disconnect().await.is_ok() {
            let _ = (&mut session.driver).await;
        }

        self.close();
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.driver.abort();
            debug!("MQTT session closed");
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.close();
    }
}
