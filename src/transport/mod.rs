//! Transport layer between the console and the broker
//!
//! The [`Transport`] trait is the seam the correlation core is built against;
//! [`mqtt::MqttClient`] is the production implementation and
//! [`crate::testing::mocks::MockTransport`] the in-memory one. Everything a
//! transport receives flows out through a single [`TransportEvent`] stream.

use crate::transport::mqtt::{ConnectionState, MqttError};
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

pub mod mqtt;

/// Events emitted by a transport, in broker order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A session was established (initial connect or reconnect)
    Connected,
    /// The session was lost or closed
    Disconnected { reason: String },
    /// Inbound publish on a subscribed topic
    Message {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
}

/// Snapshot of the link health reported to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts since the last successful connection
    pub reconnect_count: u32,
}

/// Broker link used by the correlation core
///
/// All methods take `&self`; implementations use interior mutability so a
/// transport can be shared as `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting; returns without waiting for the broker.
    /// Calling it while connected or connecting is a no-op.
    async fn connect(&self) -> Result<(), MqttError>;

    /// Announce offline, close the session and stop reconnecting
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Publish at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), MqttError>;

    /// Subscribe at QoS 1
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;

    fn status(&self) -> ConnectionStatus;

    fn client_id(&self) -> &str;

    /// Watch the connection state
    fn state_changes(&self) -> watch::Receiver<ConnectionState>;
}

/// Wait until the watched state reports `Connected`
///
/// Disconnected states along the way are tolerated since the transport keeps
/// retrying; only the timeout ends the wait.
pub async fn wait_for_connection(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), MqttError> {
    let waited = tokio::time::timeout(timeout, async {
        loop {
            if matches!(*state_rx.borrow_and_update(), ConnectionState::Connected) {
                return Ok(());
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailedStr(
                    "State channel closed".to_string(),
                ));
            }
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => Err(MqttError::ConnectionFailedStr(format!(
            "ConnAck timeout after {}ms - last state: {:?}",
            timeout.as_millis(),
            *state_rx.borrow()
        ))),
    }
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttClient;
