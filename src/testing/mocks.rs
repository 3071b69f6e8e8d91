//! In-memory transport for tests
//!
//! Records everything published and subscribed, and lets a test play the
//! broker's part by injecting connection changes and inbound messages.

use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    client_id: String,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    reconnect_count: AtomicU32,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// New disconnected transport plus the receiving end of its event stream
    pub fn new(client_id: &str) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let transport = Self {
            client_id: client_id.to_string(),
            connected: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            events_tx,
            state_tx,
        };
        (transport, events_rx)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        locked(&self.published).clone()
    }

    /// Publishes on `topic`, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        locked(&self.published)
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Every SUBSCRIBE issued, in order, duplicates included
    pub fn subscriptions(&self) -> Vec<String> {
        locked(&self.subscriptions).clone()
    }

    pub fn clear_recorded(&self) {
        locked(&self.published).clear();
        locked(&self.subscriptions).clear();
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Flip the link state without emitting an event
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.state_tx.send_replace(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("mock".to_string())
        });
    }

    /// Broker accepted a (re)connection
    pub fn simulate_connected(&self) {
        self.reconnect_count.store(0, Ordering::SeqCst);
        self.set_connected(true);
        self.emit(TransportEvent::Connected);
    }

    /// Broker connection dropped
    pub fn simulate_disconnect(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
        self.state_tx
            .send_replace(ConnectionState::Disconnected(reason.to_string()));
        self.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Inbound publish from the broker
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
            retain: false,
        });
    }

    pub fn deliver_json(&self, topic: &str, payload: &Value) {
        self.deliver(topic, payload.to_string().into_bytes());
    }

    fn emit(&self, event: TransportEvent) {
        // Tests may have dropped the receiver
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), MqttError> {
        if !self.is_connected() {
            self.simulate_connected();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state_tx
                .send_replace(ConnectionState::Disconnected("Client disconnect".to_string()));
            self.emit(TransportEvent::Disconnected {
                reason: "Client disconnect".to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.state_tx.borrow().clone(),
            });
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Mock publish failure".to_string(),
            ));
        }

        locked(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.state_tx.borrow().clone(),
            });
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Mock subscribe failure".to_string(),
            ));
        }

        locked(&self.subscriptions).push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn status(&self) -> ConnectionStatus {
        let error = match &*self.state_tx.borrow() {
            ConnectionState::Disconnected(reason) => Some(reason.clone()),
            _ => None,
        };
        ConnectionStatus {
            connected: self.is_connected(),
            error,
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
        }
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
