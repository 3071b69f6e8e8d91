//! Request/response correlation over MQTT
//!
//! A command is published to `command/{agent_id}` with a fresh request id and
//! parked in the pending table. It settles exactly once, by whichever comes
//! first:
//!
//! - a matching response on `response/{agent_id}`
//! - its own timer firing at the deadline
//! - the periodic [`sweeper`] finding it past the deadline
//!
//! Late responses for already-settled requests are dropped.

mod pending;
pub mod subscriptions;
pub mod sweeper;

pub use pending::PendingCommand;
pub use subscriptions::SubscriptionCoordinator;
pub use sweeper::ExpirySweeper;

use crate::command_span;
use crate::error::CommandError;
use crate::observability::MetricsCollector;
use crate::protocol::{validate_agent_id, CommandEnvelope, CommandResponse, TopicLayout};
use crate::transport::Transport;
use chrono::Utc;
use pending::{Claim, PendingRequest, PendingTable};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// What happened to an inbound response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Matched and settled a pending request
    Settled,
    /// No pending request with that id (late, duplicate or foreign)
    Unmatched,
    /// Request id is pending but was addressed to another agent
    AgentMismatch,
    /// Payload could not be parsed
    Malformed,
}

/// Correlates published commands with agent responses
pub struct Correlator {
    transport: Arc<dyn Transport>,
    subscriptions: Arc<SubscriptionCoordinator>,
    topics: TopicLayout,
    default_timeout: Duration,
    pending: Arc<PendingTable>,
    metrics: Arc<MetricsCollector>,
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn Transport>,
        subscriptions: Arc<SubscriptionCoordinator>,
        topics: TopicLayout,
        default_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            transport,
            subscriptions,
            topics,
            default_timeout,
            pending: Arc::new(PendingTable::default()),
            metrics,
        }
    }

    /// Publish a command and wait for its outcome
    ///
    /// `timeout` falls back to the configured default.
    pub async fn send(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, CommandError> {
        let span = command_span!(agent_id = %agent_id, command = %command);
        async {
            let pending = self.dispatch(agent_id, command, params, timeout).await?;
            pending.await
        }
        .instrument(span)
        .await
    }

    /// Publish a command and return a handle to its outcome
    ///
    /// Fails fast (nothing published, nothing registered) when the transport
    /// is down or the agent id is unusable.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCommand, CommandError> {
        if !self.transport.is_connected() {
            self.metrics.command_fast_failed();
            return Err(CommandError::NotConnected);
        }
        if let Err(e) = validate_agent_id(agent_id) {
            self.metrics.command_fast_failed();
            return Err(e.into());
        }

        let request_id = Uuid::new_v4().to_string();
        let envelope = CommandEnvelope {
            command: command.to_string(),
            params: normalize_params(params),
            request_id: request_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            client_id: self.transport.client_id().to_string(),
        };
        let payload = serde_json::to_vec(&envelope)?;

        // Subscribe before publishing so a fast response can't be missed
        if let Err(e) = self.subscriptions.ensure_subscribed(agent_id).await {
            self.metrics.publish_failed();
            warn!(agent_id = %agent_id, "Failed to subscribe to responses: {}", e);
            return Err(CommandError::Transport(e));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PendingRequest::new(agent_id, command, timeout, reply_tx);
        let deadline = request.deadline;
        self.pending.insert(request_id.clone(), request);
        let timer = self.spawn_timer(request_id.clone(), deadline);
        self.pending.attach_timer(&request_id, timer);

        let topic = self.topics.command_topic(agent_id);
        if let Err(e) = self.transport.publish(&topic, payload, false).await {
            if let Some(request) = self.pending.take(&request_id) {
                request.cancel();
            }
            self.metrics.publish_failed();
            warn!(request_id = %request_id, topic = %topic, "Failed to publish command: {}", e);
            return Err(CommandError::Transport(e));
        }

        self.metrics.command_sent();
        debug!(
            request_id = %request_id,
            topic = %topic,
            timeout_ms = timeout.as_millis() as u64,
            "Command published"
        );
        Ok(PendingCommand::new(request_id, reply_rx))
    }

    fn spawn_timer(&self, request_id: String, deadline: Instant) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(request) = pending.take(&request_id) {
                warn!(
                    request_id = %request_id,
                    agent_id = %request.agent_id,
                    command = %request.command,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "Command timed out"
                );
                metrics.command_timed_out();
                let error = request.timeout_error();
                request.settle(Err(error));
            }
        })
    }

    /// Route a payload received on `response/{agent_id}`
    pub fn handle_response(&self, agent_id: &str, payload: &[u8]) -> ResponseDisposition {
        let response = match CommandResponse::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(agent_id = %agent_id, "Dropping malformed response: {}", e);
                self.metrics.malformed_message();
                return ResponseDisposition::Malformed;
            }
        };

        match self.pending.claim(&response.request_id, agent_id) {
            Claim::Unknown => {
                debug!(
                    request_id = %response.request_id,
                    agent_id = %agent_id,
                    "Dropping response with no pending request"
                );
                self.metrics.response_unmatched();
                ResponseDisposition::Unmatched
            }
            Claim::AgentMismatch { expected } => {
                warn!(
                    request_id = %response.request_id,
                    expected = %expected,
                    received_from = %agent_id,
                    "Dropping response from unexpected agent"
                );
                self.metrics.response_agent_mismatch();
                ResponseDisposition::AgentMismatch
            }
            Claim::Claimed(request) => {
                let round_trip = request.issued_at.elapsed();
                let request_id = response.request_id.clone();
                let outcome = if response.success {
                    self.metrics.command_succeeded(round_trip);
                    Ok(response)
                } else {
                    self.metrics.command_rejected(round_trip);
                    Err(CommandError::Rejected {
                        message: response.failure_message(),
                    })
                };
                let succeeded = outcome.is_ok();

                if !request.settle(outcome) {
                    debug!(request_id = %request_id, "Caller stopped waiting before the response");
                }
                debug!(
                    request_id = %request_id,
                    agent_id = %agent_id,
                    success = succeeded,
                    round_trip_ms = round_trip.as_millis() as u64,
                    "Command settled"
                );
                ResponseDisposition::Settled
            }
        }
    }

    /// Time out every request whose deadline is at or before `now`
    ///
    /// Backstop for timers that were lost; returns how many were settled.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired = self.pending.take_expired(now);
        let count = expired.len();

        for (request_id, request) in expired {
            warn!(
                request_id = %request_id,
                agent_id = %request.agent_id,
                command = %request.command,
                "Command expired (sweep)"
            );
            self.metrics.command_swept();
            let error = request.timeout_error();
            request.settle(Err(error));
        }

        if count > 0 {
            info!(expired = count, remaining = self.pending.len(), "Swept expired requests");
        }
        count
    }

    /// Agents that still have requests in flight
    pub fn live_agents(&self) -> BTreeSet<String> {
        self.pending.agents()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains(request_id)
    }

    /// Abandon every pending request; waiting callers observe `Dropped`
    pub fn cancel_all(&self) -> usize {
        let drained = self.pending.drain();
        let count = drained.len();
        for request in drained {
            request.cancel();
        }
        if count > 0 {
            info!(cancelled = count, "Cancelled pending requests");
        }
        count
    }
}

/// Commands always carry an object; `null` becomes `{}`
fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}
