//! Table of in-flight requests
//!
//! Removal from the table is the single serialization point between the
//! response path, the per-request timer and the periodic sweep: whoever
//! takes the entry out settles it, everyone else finds nothing.

use crate::error::CommandError;
use crate::protocol::CommandResponse;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) type Settlement = Result<CommandResponse, CommandError>;

/// One request awaiting its response
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub agent_id: String,
    pub command: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    reply: oneshot::Sender<Settlement>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    pub fn new(
        agent_id: &str,
        command: &str,
        timeout: Duration,
        reply: oneshot::Sender<Settlement>,
    ) -> Self {
        let issued_at = Instant::now();
        Self {
            agent_id: agent_id.to_string(),
            command: command.to_string(),
            issued_at,
            deadline: issued_at + timeout,
            timeout,
            reply,
            timer: None,
        }
    }

    pub fn timeout_error(&self) -> CommandError {
        CommandError::Timeout {
            agent_id: self.agent_id.clone(),
            command: self.command.clone(),
            timeout: self.timeout,
        }
    }

    /// Deliver the outcome; returns false if the caller stopped waiting
    ///
    /// Consumes the request, so a request settles at most once.
    pub fn settle(mut self, outcome: Settlement) -> bool {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.reply.send(outcome).is_ok()
    }

    /// Drop without an outcome; the caller observes `Dropped`
    pub fn cancel(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Outcome of looking up a response's request id
#[derive(Debug)]
pub(crate) enum Claim {
    Claimed(PendingRequest),
    /// Known request, but it was sent to a different agent
    AgentMismatch { expected: String },
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, request_id: String, request: PendingRequest) {
        self.entries().insert(request_id, request);
    }

    /// Hand the timer to its request, or stop it if the request already settled
    pub fn attach_timer(&self, request_id: &str, timer: JoinHandle<()>) {
        match self.entries().get_mut(request_id) {
            Some(request) => request.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub fn take(&self, request_id: &str) -> Option<PendingRequest> {
        self.entries().remove(request_id)
    }

    /// Take the request only if it was addressed to `agent_id`
    pub fn claim(&self, request_id: &str, agent_id: &str) -> Claim {
        let mut entries = self.entries();
        let Some(request) = entries.remove(request_id) else {
            return Claim::Unknown;
        };
        if request.agent_id != agent_id {
            // Still under the lock, so nobody observes the gap
            let expected = request.agent_id.clone();
            entries.insert(request_id.to_string(), request);
            return Claim::AgentMismatch { expected };
        }
        Claim::Claimed(request)
    }

    /// Remove every request whose deadline is at or before `now`
    pub fn take_expired(&self, now: Instant) -> Vec<(String, PendingRequest)> {
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(request_id, _)| request_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|request_id| {
                entries
                    .remove(&request_id)
                    .map(|request| (request_id, request))
            })
            .collect()
    }

    pub fn drain(&self) -> Vec<PendingRequest> {
        self.entries().drain().map(|(_, request)| request).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries().contains_key(request_id)
    }

    /// Agents with at least one request in flight
    pub fn agents(&self) -> BTreeSet<String> {
        self.entries()
            .values()
            .map(|request| request.agent_id.clone())
            .collect()
    }
}

/// Handle to a published command; resolves exactly once
///
/// Dropping it abandons the wait; the request still settles (and is removed)
/// by response or timeout.
#[derive(Debug)]
pub struct PendingCommand {
    request_id: String,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingCommand {
    pub(crate) fn new(request_id: String, receiver: oneshot::Receiver<Settlement>) -> Self {
        Self {
            request_id,
            receiver,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingCommand {
    type Output = Result<CommandResponse, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CommandError::Dropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(agent_id: &str, timeout_ms: u64) -> (PendingRequest, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest::new(agent_id, "reload_nginx", Duration::from_millis(timeout_ms), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_take_is_exclusive() {
        let table = PendingTable::default();
        let (req, _rx) = request("a", 1000);
        table.insert("r1".to_string(), req);

        assert!(table.take("r1").is_some());
        assert!(table.take("r1").is_none());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_claim_checks_agent() {
        let table = PendingTable::default();
        let (req, _rx) = request("a", 1000);
        table.insert("r1".to_string(), req);

        assert!(matches!(
            table.claim("r1", "b"),
            Claim::AgentMismatch { ref expected } if expected == "a"
        ));
        assert!(table.contains("r1"), "mismatch leaves the request pending");

        assert!(matches!(table.claim("r1", "a"), Claim::Claimed(_)));
        assert!(matches!(table.claim("r1", "a"), Claim::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_uses_deadline() {
        let table = PendingTable::default();
        let (short, _rx1) = request("a", 100);
        let (long, _rx2) = request("b", 10_000);
        table.insert("short".to_string(), short);
        table.insert("long".to_string(), long);

        let now = Instant::now();
        assert!(table.take_expired(now + Duration::from_millis(99)).is_empty());

        let expired = table.take_expired(now + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "short");
        assert_eq!(table.agents(), BTreeSet::from(["b".to_string()]));
    }

    #[tokio::test]
    async fn test_pending_command_resolves_dropped_when_sender_gone() {
        let (req, rx) = request("a", 1000);
        let pending = PendingCommand::new("r1".to_string(), rx);

        req.cancel();

        assert!(matches!(pending.await, Err(CommandError::Dropped)));
    }

    #[tokio::test]
    async fn test_settle_reports_abandoned_caller() {
        let (req, rx) = request("a", 1000);
        drop(rx);
        assert!(!req.settle(Err(CommandError::Dropped)));
    }
}
