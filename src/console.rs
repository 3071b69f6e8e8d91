//! Console facade
//!
//! Wires the transport, presence tracker, correlator and background tasks
//! together and owns their lifecycle. Each [`Console`] holds its own state,
//! so several can run side by side in one process.

use crate::config::ConsoleConfig;
use crate::correlation::{Correlator, ExpirySweeper, PendingCommand, SubscriptionCoordinator};
use crate::dispatch::Dispatcher;
use crate::error::{CommandResult, ConsoleError, ConsoleResult};
use crate::lifecycle_span;
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::presence::{AgentPresence, PresenceChange, PresenceTracker};
use crate::protocol::CommandResponse;
use crate::transport::mqtt::MqttClient;
use crate::transport::{wait_for_connection, ConnectionStatus, Transport, TransportEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// How long shutdown waits for each background task
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Console {
    config: ConsoleConfig,
    transport: Arc<dyn Transport>,
    presence: Arc<PresenceTracker>,
    subscriptions: Arc<SubscriptionCoordinator>,
    correlator: Arc<Correlator>,
    metrics: Arc<MetricsCollector>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Console {
    /// Console backed by an MQTT connection to `config.mqtt.broker_url`
    pub fn from_config(config: &ConsoleConfig) -> ConsoleResult<Self> {
        config.validate()?;
        config.require_credentials()?;

        let client_id = config.resolve_client_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = MqttClient::new(
            &client_id,
            config.mqtt.clone(),
            config.topics.clone(),
            events_tx,
        )?;

        Ok(Self::with_transport(Arc::new(client), events_rx, config))
    }

    /// Console over any transport; `events_rx` must be that transport's event stream
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        config: &ConsoleConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let presence = Arc::new(PresenceTracker::new(
            config.presence.liveness_window(),
            config.presence.notify_interval(),
        ));
        let subscriptions = Arc::new(SubscriptionCoordinator::new(
            Arc::clone(&transport),
            config.topics.clone(),
        ));
        let correlator = Arc::new(Correlator::new(
            Arc::clone(&transport),
            Arc::clone(&subscriptions),
            config.topics.clone(),
            config.commands.default_timeout(),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: config.clone(),
            transport,
            presence,
            subscriptions,
            correlator,
            metrics,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background tasks and start connecting
    ///
    /// Returns without waiting for the broker; see
    /// [`wait_connected`](Self::wait_connected). A second call is a no-op.
    pub async fn start(&self) -> ConsoleResult<()> {
        let span = lifecycle_span!(client_id = %self.transport.client_id());
        async {
            let events_rx = self
                .events_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(events_rx) = events_rx else {
                return Ok(());
            };

            let dispatcher = Dispatcher::new(
                self.config.topics.clone(),
                Arc::clone(&self.presence),
                Arc::clone(&self.correlator),
                Arc::clone(&self.subscriptions),
                Arc::clone(&self.metrics),
            );
            let sweep_interval = self.config.commands.sweep_interval();
            let handles = vec![
                tokio::spawn(dispatcher.run(events_rx, self.shutdown_tx.subscribe())),
                ExpirySweeper::new(Arc::clone(&self.correlator), sweep_interval)
                    .spawn(self.shutdown_tx.subscribe()),
                self.presence
                    .spawn_liveness_check(sweep_interval, self.shutdown_tx.subscribe()),
            ];
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(handles);

            info!(
                broker = %self.config.mqtt.broker_url,
                default_timeout_ms = self.config.commands.default_timeout_ms,
                "Console starting"
            );
            self.transport.connect().await?;
            Ok::<(), ConsoleError>(())
        }
        .instrument(span)
        .await
    }

    /// Disconnect cleanly, stop background tasks and drop pending requests
    ///
    /// Waiting callers observe [`CommandError::Dropped`](crate::error::CommandError::Dropped).
    pub async fn shutdown(&self) -> ConsoleResult<()> {
        info!("Console shutting down");
        let disconnected = self.transport.disconnect().await;
        if let Err(e) = &disconnected {
            warn!("Disconnect failed: {}", e);
        }

        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut handle in handles {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Background task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.correlator.cancel_all();
        info!("Console shut down");
        disconnected.map_err(ConsoleError::from)
    }

    /// Send a command and wait for the agent's answer
    ///
    /// `timeout` falls back to `commands.default_timeout_ms`.
    pub async fn send(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> CommandResult<CommandResponse> {
        self.correlator.send(agent_id, command, params, timeout).await
    }

    /// Send a command and return its pending handle
    pub async fn dispatch(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> CommandResult<PendingCommand> {
        self.correlator
            .dispatch(agent_id, command, params, timeout)
            .await
    }

    pub fn presence_snapshot(&self) -> HashMap<String, AgentPresence> {
        self.presence.snapshot()
    }

    pub fn presence_changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Wait for the broker to accept the connection
    pub async fn wait_connected(&self, timeout: Duration) -> ConsoleResult<()> {
        wait_for_connection(self.transport.state_changes(), timeout).await?;
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.correlator.pending_count(), self.presence.online_count())
    }

    pub fn client_id(&self) -> &str {
        self.transport.client_id()
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
