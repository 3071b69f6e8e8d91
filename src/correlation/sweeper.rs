//! Periodic backstop for request timeouts
//!
//! Every request carries its own timer; the sweeper catches anything whose
//! timer was lost and guarantees the pending table can't grow without bound.

use super::Correlator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

pub struct ExpirySweeper {
    correlator: Arc<Correlator>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(correlator: Arc<Correlator>, interval: Duration) -> Self {
        Self {
            correlator,
            interval,
        }
    }

    /// Run until `shutdown_rx` turns true
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        debug!(interval_ms = self.interval.as_millis() as u64, "Expiry sweeper started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let swept = self.correlator.sweep_expired(Instant::now());
                    trace!(swept, pending = self.correlator.pending_count(), "Sweep pass");
                }
            }
        }
        debug!("Expiry sweeper stopped");
    }
}
