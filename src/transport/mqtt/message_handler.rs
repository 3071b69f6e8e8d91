//! Pure routing of rumqttc events plus forwarding to the console
//!
//! The supervisor loop turns every polled event into an [`EventRoute`] and
//! only then decides what to do with it, which keeps the decision testable
//! without a broker.

use crate::transport::TransportEvent;
use bytes::Bytes;
use rumqttc::Outgoing;
use rumqttc::v5::Event;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the matching handling branch
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: Self::count_failed_subscriptions(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Number of rejected filters in a SubAck
    pub fn count_failed_subscriptions(codes: &[SubscribeReasonCode]) -> usize {
        codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .count()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// Our own DISCONNECT packet went out
    DisconnectSent,
    /// SubAck with the number of rejected filters
    SubscriptionConfirmed { packet_id: u16, failed: usize },
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands transport events to the console's dispatcher
///
/// The channel is unbounded so the event loop never waits on the consumer;
/// the consumer may itself be waiting on the event loop to flush a subscribe.
#[derive(Clone)]
pub struct MessageForwarder {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl MessageForwarder {
    pub fn new(sender: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { sender }
    }

    /// Forward an event; returns false once the consumer is gone
    pub fn forward(&self, event: TransportEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                warn!("Transport event dropped, no consumer: {:?}", event);
                false
            }
        }
    }

    pub fn forward_message(&self, topic: String, payload: Bytes, retain: bool) -> bool {
        debug!(topic = %topic, bytes = payload.len(), retain, "Inbound MQTT message");
        self.forward(TransportEvent::Message {
            topic,
            payload,
            retain,
        })
    }
}
