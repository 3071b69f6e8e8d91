//! Agent presence tracking
//!
//! Every agent seen on the `heartbeat` or `status` broadcast topics gets an
//! entry; entries are never removed, only flipped offline. Reads hand out
//! clones so callers can't mutate the table behind the tracker's back.

pub mod notifier;

pub use notifier::{ChangeNotifier, PresenceChange};

use crate::protocol::{HeartbeatMessage, PresenceStatus, StatusMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// What the console currently believes about one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub agent_id: String,
    pub online: bool,
    /// Time of the last heartbeat or explicit online notice
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Union of every heartbeat attribute seen; newer values win
    pub attributes: Map<String, Value>,
}

impl AgentPresence {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            online: false,
            last_heartbeat: None,
            attributes: Map::new(),
        }
    }

    /// Whether the last heartbeat is older than `window` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return false;
        };
        match self.last_heartbeat {
            Some(seen) => now.signed_duration_since(seen) > window,
            None => true,
        }
    }
}

/// In-memory presence table
#[derive(Debug)]
pub struct PresenceTracker {
    agents: RwLock<HashMap<String, AgentPresence>>,
    liveness_window: Duration,
    notifier: ChangeNotifier,
}

impl PresenceTracker {
    pub fn new(liveness_window: Duration, notify_interval: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            liveness_window,
            notifier: ChangeNotifier::new(notify_interval),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AgentPresence>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AgentPresence>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_heartbeat(&self, heartbeat: HeartbeatMessage) {
        self.record_heartbeat_at(heartbeat, Utc::now());
    }

    /// Merge attributes, mark online, refresh `last_heartbeat`
    pub fn record_heartbeat_at(&self, heartbeat: HeartbeatMessage, now: DateTime<Utc>) {
        let came_online = {
            let mut agents = self.write();
            let entry = agents
                .entry(heartbeat.uuid.clone())
                .or_insert_with(|| AgentPresence::new(&heartbeat.uuid));
            let came_online = !entry.online;
            entry.attributes.extend(heartbeat.attributes);
            entry.online = true;
            entry.last_heartbeat = Some(now);
            came_online
        };

        if came_online {
            info!(agent_id = %heartbeat.uuid, "Agent online (heartbeat)");
        } else {
            debug!(agent_id = %heartbeat.uuid, "Heartbeat");
        }
        self.notifier.mark_changed();
    }

    pub fn record_status(&self, status: StatusMessage) {
        self.record_status_at(status, Utc::now());
    }

    /// Explicit online/offline notice
    ///
    /// Offline takes effect immediately regardless of how recent the last
    /// heartbeat was. Online counts as a heartbeat for liveness purposes.
    pub fn record_status_at(&self, status: StatusMessage, now: DateTime<Utc>) {
        let online = status.status == PresenceStatus::Online;
        {
            let mut agents = self.write();
            let entry = agents
                .entry(status.uuid.clone())
                .or_insert_with(|| AgentPresence::new(&status.uuid));
            entry.online = online;
            if online {
                entry.last_heartbeat = Some(now);
            }
        }

        info!(agent_id = %status.uuid, status = ?status.status, "Agent status");
        self.notifier.mark_changed();
    }

    /// Flip agents whose heartbeat is older than the liveness window
    ///
    /// Returns the number of agents that went offline.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let mut agents = self.write();
            agents
                .values_mut()
                .filter(|agent| agent.online && agent.is_stale(now, self.liveness_window))
                .map(|agent| {
                    agent.online = false;
                    agent.agent_id.clone()
                })
                .collect()
        };

        for agent_id in &expired {
            info!(
                agent_id = %agent_id,
                window_secs = self.liveness_window.as_secs(),
                "Agent offline (heartbeat expired)"
            );
        }
        if !expired.is_empty() {
            self.notifier.mark_changed();
        }
        expired.len()
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> HashMap<String, AgentPresence> {
        self.read().clone()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentPresence> {
        self.read().get(agent_id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.read().values().filter(|agent| agent.online).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Coalesced change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.notifier.subscribe()
    }

    /// Periodically run [`expire_stale`](Self::expire_stale) until shutdown
    pub fn spawn_liveness_check(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        tracker.expire_stale(Utc::now());
                    }
                }
            }
            debug!("Presence liveness check stopped");
        })
    }
}
