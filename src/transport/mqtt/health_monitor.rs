//! Pure reconnection decisions and state transitions for the MQTT client

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to try again after a failure
    ///
    /// Only an explicit shutdown stops the retries.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::ClosedByClient => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Publishing and subscribing require an acknowledged session
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "MQTT reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::Disconnected(reason)) => {
                error!(reason = %reason, "MQTT connection unavailable");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    ClosedByClient,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            backoff_pattern: vec![100, 200],
            sustained_delay: 500,
        }
    }

    #[test]
    fn test_reconnection_follows_backoff_pattern() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config(), false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(1, &config(), false),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay_ms: 200
            }
        );
    }

    #[test]
    fn test_reconnection_never_gives_up() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(10_000, &config(), false),
            ReconnectionDecision::Proceed {
                attempt: 10_001,
                delay_ms: 500
            }
        );
        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(u32::MAX, &config(), false),
            ReconnectionDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_shutdown_aborts_reconnection() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config(), true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "connection refused".to_string()
            )),
            ConnectionState::Disconnected("connection refused".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(4)),
            ConnectionState::Reconnecting(4)
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::ClosedByClient),
            ConnectionState::Disconnected(_)
        ));
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Idle));
    }
}
