//! Per-agent response topic subscriptions
//!
//! A response topic is subscribed lazily the first time a command goes to
//! that agent and is kept for the life of the session. After a reconnect the
//! set is rebuilt from the broadcast topics plus agents that still have
//! requests in flight; everyone else is picked up again on their next send.
//!
//! The set belongs to one broker session. Any transport state change since
//! the set was last checked means the broker may have dropped it, so the set
//! is cleared before it is trusted again.

use crate::protocol::TopicLayout;
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Topics known to be subscribed, plus the state watch that ages them out
struct SessionTopics {
    state_rx: watch::Receiver<ConnectionState>,
    topics: BTreeSet<String>,
}

impl SessionTopics {
    /// Drop the set if the connection changed since it was last checked
    fn refresh(&mut self) {
        if matches!(self.state_rx.has_changed(), Ok(true)) {
            self.state_rx.borrow_and_update();
            if !self.topics.is_empty() {
                debug!(
                    dropped = self.topics.len(),
                    "Connection changed, forgetting session subscriptions"
                );
            }
            self.topics.clear();
        }
    }
}

/// Tracks which topics the current session is subscribed to
pub struct SubscriptionCoordinator {
    transport: Arc<dyn Transport>,
    topics: TopicLayout,
    subscribed: Mutex<SessionTopics>,
}

impl SubscriptionCoordinator {
    pub fn new(transport: Arc<dyn Transport>, topics: TopicLayout) -> Self {
        let state_rx = transport.state_changes();
        Self {
            transport,
            topics,
            subscribed: Mutex::new(SessionTopics {
                state_rx,
                topics: BTreeSet::new(),
            }),
        }
    }

    async fn current(&self) -> MutexGuard<'_, SessionTopics> {
        let mut session = self.subscribed.lock().await;
        session.refresh();
        session
    }

    /// Subscribe to `response/{agent_id}` unless already subscribed
    ///
    /// The lock is held across the subscribe call so two concurrent first
    /// sends to the same agent issue a single SUBSCRIBE. Completion means the
    /// request is queued ahead of any publish that follows, not that the
    /// broker has acknowledged it.
    pub async fn ensure_subscribed(&self, agent_id: &str) -> Result<(), MqttError> {
        let topic = self.topics.response_topic(agent_id);
        let mut session = self.current().await;
        if session.topics.contains(&topic) {
            return Ok(());
        }

        self.transport.subscribe(&topic).await?;
        debug!(topic = %topic, "Subscribed to agent responses");
        session.topics.insert(topic);
        Ok(())
    }

    /// Rebuild the subscription set for a fresh session
    ///
    /// Returns how many topics were subscribed. Failures are logged and the
    /// topic stays out of the set, so a later send retries it.
    pub async fn resubscribe<I>(&self, live_agents: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let wanted: BTreeSet<String> = self
            .topics
            .broadcast_topics()
            .into_iter()
            .chain(
                live_agents
                    .into_iter()
                    .map(|agent_id| self.topics.response_topic(&agent_id)),
            )
            .collect();

        let mut session = self.current().await;
        session.topics.clear();

        for topic in wanted {
            match self.transport.subscribe(&topic).await {
                Ok(()) => {
                    session.topics.insert(topic);
                }
                Err(e) => error!(topic = %topic, "Failed to subscribe: {}", e),
            }
        }

        info!(topics = session.topics.len(), "Subscriptions restored");
        session.topics.len()
    }

    /// Forget everything; the broker dropped them with the session
    pub async fn invalidate(&self) {
        self.subscribed.lock().await.topics.clear();
    }

    /// Sorted copy of the current subscription set
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.current().await.topics.iter().cloned().collect()
    }

    pub async fn is_subscribed(&self, agent_id: &str) -> bool {
        self.current()
            .await
            .topics
            .contains(&self.topics.response_topic(agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    async fn connected_coordinator() -> (Arc<MockTransport>, SubscriptionCoordinator) {
        let (transport, _events) = MockTransport::new("console-test");
        let transport = Arc::new(transport);
        transport.connect().await.unwrap();
        let coordinator = SubscriptionCoordinator::new(transport.clone(), TopicLayout::default());
        (transport, coordinator)
    }

    #[tokio::test]
    async fn test_ensure_subscribed_is_idempotent() {
        // Arrange
        let (transport, coordinator) = connected_coordinator().await;

        // Act
        coordinator.ensure_subscribed("a").await.unwrap();
        coordinator.ensure_subscribed("a").await.unwrap();
        coordinator.ensure_subscribed("b").await.unwrap();

        // Assert
        assert_eq!(transport.subscriptions(), vec!["response/a", "response/b"]);
        assert!(coordinator.is_subscribed("a").await);
        assert!(!coordinator.is_subscribed("c").await);
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_subscribe_once() {
        let (transport, coordinator) = connected_coordinator().await;
        let coordinator = Arc::new(coordinator);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.ensure_subscribed("a").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(transport.subscriptions(), vec!["response/a"]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_not_recorded() {
        let (transport, coordinator) = connected_coordinator().await;
        transport.set_fail_subscribe(true);

        assert!(coordinator.ensure_subscribed("a").await.is_err());
        assert!(!coordinator.is_subscribed("a").await);

        transport.set_fail_subscribe(false);
        coordinator.ensure_subscribed("a").await.unwrap();
        assert!(coordinator.is_subscribed("a").await);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_only_broadcast_and_live_agents() {
        // Arrange
        let (transport, coordinator) = connected_coordinator().await;
        coordinator.ensure_subscribed("idle").await.unwrap();
        coordinator.ensure_subscribed("busy").await.unwrap();
        transport.clear_recorded();

        // Act
        let count = coordinator.resubscribe(vec!["busy".to_string()]).await;

        // Assert
        assert_eq!(count, 3);
        assert_eq!(
            coordinator.subscribed_topics().await,
            vec!["heartbeat", "response/busy", "status"]
        );
        let mut issued = transport.subscriptions();
        issued.sort();
        assert_eq!(issued, vec!["heartbeat", "response/busy", "status"]);
    }

    #[tokio::test]
    async fn test_reconnect_forgets_topics_before_dispatcher_runs() {
        // Arrange
        let (transport, coordinator) = connected_coordinator().await;
        coordinator.ensure_subscribed("a").await.unwrap();

        // Act: new session, nobody has called invalidate or resubscribe
        transport.simulate_disconnect("connection reset");
        transport.simulate_connected();
        transport.clear_recorded();
        coordinator.ensure_subscribed("a").await.unwrap();
        coordinator.ensure_subscribed("a").await.unwrap();

        // Assert
        assert_eq!(transport.subscriptions(), vec!["response/a"]);
    }

    #[tokio::test]
    async fn test_invalidate_forgets_topics() {
        let (_transport, coordinator) = connected_coordinator().await;
        coordinator.ensure_subscribed("a").await.unwrap();

        coordinator.invalidate().await;

        assert!(coordinator.subscribed_topics().await.is_empty());
    }
}
