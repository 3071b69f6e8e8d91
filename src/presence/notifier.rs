//! Trailing-edge coalescing of presence change notifications
//!
//! Heartbeats arrive in bursts (a whole fleet every 30s). Subscribers get one
//! notification per window instead of one per message: the first change
//! after a flush arms a timer, later changes ride along, and the timer fires
//! no sooner than `window` after that first change.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

/// One coalesced notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    /// Increments by one per notification
    pub generation: u64,
    /// Number of changes folded into this notification
    pub changes: u64,
}

#[derive(Debug, Default)]
struct NotifierState {
    armed: bool,
    pending: u64,
    generation: u64,
}

/// Rate-limited broadcast of "presence changed"
#[derive(Debug)]
pub struct ChangeNotifier {
    window: Duration,
    state: Arc<Mutex<NotifierState>>,
    tx: broadcast::Sender<PresenceChange>,
}

impl ChangeNotifier {
    pub fn new(window: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            window,
            state: Arc::new(Mutex::new(NotifierState::default())),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.tx.subscribe()
    }

    /// Record a change; schedules a flush if none is pending
    ///
    /// Outside a tokio runtime (or with a zero window) the flush happens
    /// immediately.
    pub fn mark_changed(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending += 1;
            if state.armed {
                return;
            }
            state.armed = true;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.window.is_zero() => handle,
            _ => {
                flush(&self.state, &self.tx);
                return;
            }
        };

        let state = Arc::clone(&self.state);
        let tx = self.tx.clone();
        let window = self.window;
        handle.spawn(async move {
            tokio::time::sleep(window).await;
            flush(&state, &tx);
        });
    }
}

fn flush(state: &Mutex<NotifierState>, tx: &broadcast::Sender<PresenceChange>) {
    let change = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.armed = false;
        state.generation += 1;
        PresenceChange {
            generation: state.generation,
            changes: std::mem::take(&mut state.pending),
        }
    };

    trace!(generation = change.generation, changes = change.changes, "Presence changed");
    // No subscribers is fine
    let _ = tx.send(change);
}
