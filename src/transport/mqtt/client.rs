//! Impure I/O side of the MQTT transport
//!
//! [`MqttClient`] owns a supervisor task that polls the rumqttc event loop,
//! turns events into [`TransportEvent`]s and reconnects with backoff until it
//! is told to stop. A second task publishes the console's own heartbeat.

use super::connection::{
    configure_mqtt_options, console_status_payload, ConnectionState, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::mqtt_span;
use crate::protocol::{PresenceStatus, TopicLayout};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Upper bound for the goodbye publish and for the supervisor to wind down
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type SharedClient = Arc<RwLock<Option<AsyncClient>>>;

/// MQTT transport for the console
pub struct MqttClient {
    client_id: String,
    config: MqttSection,
    topics: TopicLayout,
    reconnect_config: ReconnectConfig,
    client: SharedClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    /// Also serializes connect/disconnect
    supervisor: Mutex<Option<JoinHandle<()>>>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
    forwarder: MessageForwarder,
    reconnect_attempts: Arc<AtomicU32>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl MqttClient {
    /// Create a client; nothing touches the network until [`connect`](Self::connect)
    ///
    /// Broker options are validated eagerly so a bad URL fails here.
    pub fn new(
        client_id: &str,
        config: MqttSection,
        topics: TopicLayout,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, MqttError> {
        configure_mqtt_options(client_id, &config, &topics)?;

        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let reconnect_config = ReconnectConfig::from(&config.reconnect);

        Ok(MqttClient {
            client_id: client_id.to_string(),
            config,
            topics,
            reconnect_config,
            client: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            supervisor: Mutex::new(None),
            heartbeat: std::sync::Mutex::new(None),
            forwarder: MessageForwarder::new(events),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            last_error: Arc::new(RwLock::new(None)),
        })
    }

    /// Fresh client and event loop for a connection attempt
    fn create_connection(
        client_id: &str,
        config: &MqttSection,
        topics: &TopicLayout,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, config, topics)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the supervisor; returns once it is spawned
    pub async fn connect(&self) -> Result<(), MqttError> {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                debug!("connect() ignored: supervisor already running");
                return Ok(());
            }
        }

        let (client, event_loop) =
            Self::create_connection(&self.client_id, &self.config, &self.topics)?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);

        self.shutdown_tx.send_replace(false);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.state_tx.send_replace(ConnectionState::Connecting);

        let context = Supervisor {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            topics: self.topics.clone(),
            reconnect_config: self.reconnect_config.clone(),
            shared_client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            forwarder: self.forwarder.clone(),
            reconnect_attempts: self.reconnect_attempts.clone(),
            last_error: self.last_error.clone(),
        };
        let span = mqtt_span!(operation = "supervisor", client_id = %self.client_id);
        *supervisor = Some(tokio::spawn(context.run(event_loop).instrument(span)));

        let heartbeat = self.spawn_heartbeat();
        if let Some(previous) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(heartbeat)
        {
            previous.abort();
        }

        info!(
            client_id = %self.client_id,
            broker = %self.config.broker_url,
            "MQTT connection supervisor started"
        );
        Ok(())
    }

    /// Periodic retained `online` announcement while connected
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.heartbeat_interval_secs);
        let shared_client = self.client.clone();
        let state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let topic = self.topics.console_status.clone();
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The supervisor announces online on ConnAck
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !HealthMonitor::can_publish(&state_rx.borrow()) {
                            continue;
                        }
                        let client = shared_client
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        let Some(client) = client else { continue };

                        match console_status_payload(&client_id, PresenceStatus::Online) {
                            Ok(payload) => {
                                if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, payload).await {
                                    warn!("Failed to publish console heartbeat: {}", e);
                                } else {
                                    debug!(topic = %topic, "Published console heartbeat");
                                }
                            }
                            Err(e) => error!("Failed to encode console heartbeat: {}", e),
                        }
                    }
                }
            }
            debug!("Console heartbeat stopped");
        })
    }

    /// Announce offline, send DISCONNECT and stop the supervisor
    ///
    /// Always leaves the client in `Disconnected`, even when the goodbye
    /// publish could not be delivered.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let mut supervisor = self.supervisor.lock().await;
        let was_connected = self.is_connected();

        if was_connected {
            if let Some(client) = self.current_client() {
                Self::say_goodbye(&client, &self.client_id, &self.topics.console_status).await;
            }
        } else {
            self.shutdown_tx.send_replace(true);
        }

        if let Some(mut handle) = supervisor.take() {
            // Once DISCONNECT is flushed the supervisor stops by itself
            match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT supervisor ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT supervisor didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }

        self.shutdown_tx.send_replace(true);
        if let Some(heartbeat) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            heartbeat.abort();
        }
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = None;

        let closed = HealthMonitor::determine_next_state(ConnectionEvent::ClosedByClient);
        let previous = self.state_tx.send_replace(closed.clone());
        if previous != ConnectionState::Idle {
            if let ConnectionState::Disconnected(reason) = closed {
                self.forwarder.forward(TransportEvent::Disconnected { reason });
            }
        }

        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    /// Best-effort retained offline status followed by DISCONNECT
    async fn say_goodbye(client: &AsyncClient, client_id: &str, topic: &str) {
        match console_status_payload(client_id, PresenceStatus::Offline) {
            Ok(payload) => {
                let publish = client.publish(topic, QoS::AtLeastOnce, true, payload);
                match tokio::time::timeout(DISCONNECT_TIMEOUT, publish).await {
                    Ok(Ok(())) => debug!("Queued offline status"),
                    Ok(Err(e)) => warn!("Failed to publish offline status: {}", e),
                    Err(_) => warn!("Timed out publishing offline status"),
                }
            }
            Err(e) => warn!("Failed to encode offline status: {}", e),
        }

        match tokio::time::timeout(DISCONNECT_TIMEOUT, client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to queue DISCONNECT: {}", e),
            Err(_) => warn!("Timed out queueing DISCONNECT"),
        }
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<AsyncClient, MqttError> {
        let current_state = self.connection_state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        self.current_client().ok_or(MqttError::NotConnected {
            state: current_state,
        })
    }
}

/// Everything the supervisor task owns
struct Supervisor {
    client_id: String,
    config: MqttSection,
    topics: TopicLayout,
    reconnect_config: ReconnectConfig,
    shared_client: SharedClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    forwarder: MessageForwarder,
    reconnect_attempts: Arc<AtomicU32>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl Supervisor {
    async fn run(mut self, event_loop: EventLoop) {
        info!(client_id = %self.client_id, "Starting MQTT event loop");
        let mut current_event_loop = event_loop;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }

                event_result = current_event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut current_event_loop).await
                        }
                        Err(e) => self.handle_event_loop_error(e, &mut current_event_loop).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
        previous
    }

    fn record_error(&self, reason: &str) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ConnAckReceived,
                ));
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                self.announce_online();
                self.forwarder.forward(TransportEvent::Connected)
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => self.forwarder.forward_message(topic, payload, retain),
            EventRoute::Disconnected => {
                let next = HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker);
                self.connection_lost(next, current_event_loop).await
            }
            EventRoute::DisconnectSent => {
                info!("DISCONNECT sent, stopping MQTT supervisor");
                false
            }
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if failed > 0 {
                    warn!(packet_id, failed, "Broker rejected subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &mut self,
        error: rumqttc::v5::ConnectionError,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        let next = HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
            error.to_string(),
        ));
        self.connection_lost(next, current_event_loop).await
    }

    async fn connection_lost(
        &mut self,
        next: ConnectionState,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        if let ConnectionState::Disconnected(reason) = &next {
            self.record_error(reason);
            let previous = self.set_state(next.clone());
            // Repeated failed attempts are not new disconnects
            if previous == ConnectionState::Connected {
                self.forwarder.forward(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });
            }
        }
        self.attempt_reconnection(current_event_loop).await
    }

    /// Retained online status, queued without waiting on the event loop
    fn announce_online(&self) {
        let client = self
            .shared_client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(client) = client else { return };

        match console_status_payload(&self.client_id, PresenceStatus::Online) {
            Ok(payload) => {
                if let Err(e) = client.try_publish_with_properties(
                    &self.topics.console_status,
                    QoS::AtLeastOnce,
                    true,
                    payload,
                    PublishProperties::default(),
                ) {
                    warn!("Failed to queue online status: {}", e);
                }
            }
            Err(e) => error!("Failed to encode online status: {}", e),
        }
    }

    async fn attempt_reconnection(&mut self, current_event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts.load(Ordering::SeqCst),
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                info!("Attempting reconnection {} after {}ms delay", attempt, delay_ms);

                if !interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                self.apply_new_connection(current_event_loop);
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
        }
    }

    /// Swap in a new client and event loop; the client id stays the same
    fn apply_new_connection(&self, current_event_loop: &mut EventLoop) {
        match MqttClient::create_connection(&self.client_id, &self.config, &self.topics) {
            Ok((new_client, new_event_loop)) => {
                *current_event_loop = new_event_loop;
                *self
                    .shared_client
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(new_client);
                debug!("Created new connection for reconnection attempt");
            }
            // The old event loop retries the same broker on its next poll
            Err(e) => error!("Failed to create new connection: {}", e),
        }
    }
}

/// Sleep that ends early on shutdown
/// Returns true if the sleep completed, false if shutdown was requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<(), MqttError> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        MqttClient::disconnect(self).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        let span = mqtt_span!(operation = "publish", topic = %topic, retain);
        async move {
            client
                .publish_with_properties(
                    topic,
                    QoS::AtLeastOnce,
                    retain,
                    payload,
                    PublishProperties::default(),
                )
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

            debug!(target: "mqtt_transport", "Published message");
            Ok::<(), MqttError>(())
        }
        .instrument(span)
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        client.subscribe(topic, QoS::AtLeastOnce).await.map_err(|e| {
            MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
        })?;

        debug!(target: "mqtt_transport", topic = %topic, "Subscribe queued");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.is_connected(),
            error: self
                .last_error
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            reconnect_count: self.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No async in Drop; callers should disconnect() for a clean goodbye
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::transport::wait_for_connection;

    fn test_client(broker_url: &str) -> (MqttClient, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut config = ConsoleConfig::with_broker(broker_url);
        config.mqtt.reconnect.backoff_ms = vec![20, 20];
        config.mqtt.reconnect.sustained_delay_ms = 50;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = MqttClient::new("console-test", config.mqtt, TopicLayout::default(), tx)
            .expect("valid options");
        (client, rx)
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        // Arrange
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Act
        let result = interruptible_sleep(shutdown_rx, 10).await;

        // Assert
        assert!(result, "Sleep should complete without interruption");
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        // Arrange
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        // Act
        let result = interruptible_sleep(shutdown_rx, 10_000).await;

        // Assert
        assert!(!result, "Sleep should be interrupted by shutdown signal");
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ConsoleConfig::with_broker("not a url").mqtt;
        let result = MqttClient::new("console-test", config, TopicLayout::default(), tx);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let (client, _rx) = test_client("mqtt://localhost:1883");

        assert_eq!(client.connection_state(), ConnectionState::Idle);
        assert_eq!(
            Transport::status(&client),
            ConnectionStatus {
                connected: false,
                error: None,
                reconnect_count: 0
            }
        );
        assert_eq!(Transport::client_id(&client), "console-test");
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let (client, _rx) = test_client("mqtt://localhost:1883");

        let publish = Transport::publish(&client, "command/a", b"{}".to_vec(), false).await;
        assert!(matches!(publish, Err(MqttError::NotConnected { .. })));

        let subscribe = Transport::subscribe(&client, "response/a").await;
        assert!(matches!(subscribe, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let (client, mut rx) = test_client("mqtt://localhost:1883");

        let result = client.disconnect().await;

        assert!(result.is_ok(), "Disconnect should not fail if never connected");
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Disconnected(_)
        ));
        assert!(rx.try_recv().is_err(), "No event for a link that never existed");
    }

    #[tokio::test]
    async fn test_unreachable_broker_keeps_retrying() {
        // Arrange: nothing listens on port 1
        let (client, _rx) = test_client("mqtt://127.0.0.1:1");

        // Act
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        let result = wait_for_connection(client.state_changes(), Duration::from_millis(300)).await;

        // Assert
        assert!(result.is_err());
        let status = Transport::status(&client);
        assert!(!status.connected);
        assert!(status.error.is_some(), "Last error should be reported");
        assert!(status.reconnect_count >= 1);
        assert!(client.connection_state().is_active() || matches!(
            client.connection_state(),
            ConnectionState::Disconnected(_)
        ));

        client.disconnect().await.unwrap();
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }
}
