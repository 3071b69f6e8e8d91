//! Routes transport events to the component that owns them
//!
//! Runs as a single task reading the transport's event stream, so inbound
//! messages are handled in broker order.

use crate::correlation::{Correlator, ResponseDisposition, SubscriptionCoordinator};
use crate::observability::MetricsCollector;
use crate::presence::PresenceTracker;
use crate::presence_span;
use crate::protocol::{HeartbeatMessage, InboundTopic, StatusMessage, TopicLayout};
use crate::transport::TransportEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Dispatcher {
    topics: TopicLayout,
    presence: Arc<PresenceTracker>,
    correlator: Arc<Correlator>,
    subscriptions: Arc<SubscriptionCoordinator>,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        topics: TopicLayout,
        presence: Arc<PresenceTracker>,
        correlator: Arc<Correlator>,
        subscriptions: Arc<SubscriptionCoordinator>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            topics,
            presence,
            correlator,
            subscriptions,
            metrics,
        }
    }

    /// Consume events until the stream closes or shutdown is signalled
    pub async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Event dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("Transport event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("Event dispatcher stopped");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.metrics.connection_established();
                let live_agents = self.correlator.live_agents();
                let live = live_agents.len();
                let subscribed = self.subscriptions.resubscribe(live_agents).await;
                info!(topics = subscribed, live_agents = live, "Session established");
            }
            TransportEvent::Disconnected { reason } => {
                self.metrics.connection_lost();
                self.subscriptions.invalidate().await;
                warn!(
                    reason = %reason,
                    pending = self.correlator.pending_count(),
                    "Session lost; pending requests keep their deadlines"
                );
            }
            TransportEvent::Message {
                topic,
                payload,
                retain,
            } => self.handle_message(&topic, &payload, retain),
        }
    }

    fn handle_message(&self, topic: &str, payload: &[u8], retain: bool) {
        if payload.is_empty() {
            // Cleared retained message
            debug!(topic = %topic, retain, "Ignoring empty payload");
            return;
        }

        match self.topics.classify(topic) {
            InboundTopic::Heartbeat => match HeartbeatMessage::from_slice(payload) {
                Ok(heartbeat) => {
                    let _span = presence_span!(agent_id = %heartbeat.uuid).entered();
                    self.metrics.heartbeat_received();
                    self.presence.record_heartbeat(heartbeat);
                }
                Err(e) => self.malformed(topic, &e),
            },
            InboundTopic::Status => match StatusMessage::from_slice(payload) {
                Ok(status) => {
                    let _span = presence_span!(agent_id = %status.uuid).entered();
                    self.metrics.status_received();
                    self.presence.record_status(status);
                }
                Err(e) => self.malformed(topic, &e),
            },
            InboundTopic::Response { agent_id } => {
                let disposition = self.correlator.handle_response(&agent_id, payload);
                if disposition != ResponseDisposition::Settled {
                    debug!(topic = %topic, ?disposition, "Response not settled");
                }
            }
            InboundTopic::Unknown => {
                debug!(topic = %topic, "Ignoring message on unexpected topic");
            }
        }
    }

    fn malformed(&self, topic: &str, error: &dyn std::fmt::Display) {
        warn!(topic = %topic, "Dropping malformed message: {}", error);
        self.metrics.malformed_message();
    }
}
