//! Thread-safe metrics for one console instance
//!
//! Atomic counters for the hot paths and a mutex-protected window of recent
//! round-trip times. Each console owns its own collector so parallel
//! instances (and tests) never share counters.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Round-trip samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Metrics collector using atomics and a mutex for latencies
pub struct MetricsCollector {
    commands_sent: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_rejected: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_swept: AtomicU64,
    publish_failures: AtomicU64,
    fast_failures: AtomicU64,

    responses_unmatched: AtomicU64,
    responses_agent_mismatch: AtomicU64,
    malformed_messages: AtomicU64,
    heartbeats_received: AtomicU64,
    status_messages_received: AtomicU64,

    connections_established: AtomicU64,
    connections_lost: AtomicU64,

    round_trip_times: Mutex<VecDeque<u64>>,
    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            commands_sent: AtomicU64::new(0),
            commands_succeeded: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            commands_swept: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            fast_failures: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            responses_agent_mismatch: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            status_messages_received: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            round_trip_times: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Command lifecycle
    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_succeeded(&self, round_trip: Duration) {
        self.commands_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_round_trip(round_trip);
    }

    pub fn command_rejected(&self, round_trip: Duration) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
        self.record_round_trip(round_trip);
    }

    pub fn command_timed_out(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Timed out by the periodic sweep rather than its own timer
    pub fn command_swept(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
        self.commands_swept.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Rejected before anything was published
    pub fn command_fast_failed(&self) {
        self.fast_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_round_trip(&self, round_trip: Duration) {
        if let Ok(mut times) = self.round_trip_times.lock() {
            if times.len() == MAX_LATENCY_SAMPLES {
                times.pop_front();
            }
            times.push_back(round_trip.as_millis() as u64);
        }
    }

    // Inbound traffic
    pub fn response_unmatched(&self) {
        self.responses_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_agent_mismatch(&self) {
        self.responses_agent_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status_received(&self) {
        self.status_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Connection
    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Round-trip statistics over the sample window: (avg, p50, p95, p99)
    fn calculate_round_trip_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.round_trip_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times: Vec<u64> = times.iter().copied().collect();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    /// Point-in-time copy of every counter
    ///
    /// `pending_requests` and `agents_online` live in other components, so
    /// the caller supplies them.
    pub fn snapshot(&self, pending_requests: usize, agents_online: usize) -> MetricsSnapshot {
        let (avg_round_trip_ms, p50, p95, p99) = self.calculate_round_trip_statistics();
        let now = current_timestamp();
        let reconnects = self
            .connections_established
            .load(Ordering::Relaxed)
            .saturating_sub(1);

        MetricsSnapshot {
            commands: CommandMetrics {
                sent: self.commands_sent.load(Ordering::Relaxed),
                succeeded: self.commands_succeeded.load(Ordering::Relaxed),
                rejected: self.commands_rejected.load(Ordering::Relaxed),
                timed_out: self.commands_timed_out.load(Ordering::Relaxed),
                swept: self.commands_swept.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                fast_failures: self.fast_failures.load(Ordering::Relaxed),
                pending: pending_requests as u64,
                avg_round_trip_ms,
                round_trip_p50_ms: p50,
                round_trip_p95_ms: p95,
                round_trip_p99_ms: p99,
            },
            inbound: InboundMetrics {
                heartbeats: self.heartbeats_received.load(Ordering::Relaxed),
                status_messages: self.status_messages_received.load(Ordering::Relaxed),
                unmatched_responses: self.responses_unmatched.load(Ordering::Relaxed),
                agent_mismatches: self.responses_agent_mismatch.load(Ordering::Relaxed),
                malformed: self.malformed_messages.load(Ordering::Relaxed),
            },
            connection: ConnectionMetrics {
                established: self.connections_established.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                reconnects,
            },
            agents_online: agents_online as u64,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub commands: CommandMetrics,
    pub inbound: InboundMetrics,
    pub connection: ConnectionMetrics,
    pub agents_online: u64,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub sent: u64,
    pub succeeded: u64,
    pub rejected: u64,
    /// Includes swept requests
    pub timed_out: u64,
    pub swept: u64,
    pub publish_failures: u64,
    pub fast_failures: u64,
    pub pending: u64,
    pub avg_round_trip_ms: f64,
    pub round_trip_p50_ms: f64,
    pub round_trip_p95_ms: f64,
    pub round_trip_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub heartbeats: u64,
    pub status_messages: u64,
    pub unmatched_responses: u64,
    pub agent_mismatches: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub established: u64,
    pub lost: u64,
    pub reconnects: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
