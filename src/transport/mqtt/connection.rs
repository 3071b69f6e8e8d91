//! Pure connection state management for the MQTT client
//!
//! Connection states, reconnect backoff, transport errors and the broker
//! options builder. Nothing in here performs I/O.

use crate::config::{MqttSection, ReconnectSection};
use crate::protocol::{ConsoleStatus, PresenceStatus, TopicLayout};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the broker link
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    /// `connect()` has never been called
    Idle,
    /// First connection attempt in flight
    Connecting,
    /// ConnAck received
    Connected,
    /// Link lost (or closed) with reason
    Disconnected(String),
    /// Waiting to retry (attempt count)
    Reconnecting(u32),
}

impl ConnectionState {
    /// Whether a supervisor is driving this connection
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting(_)
        )
    }
}

/// Reconnection backoff; attempts are unlimited
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based attempt number
    ///
    /// Walks the pattern, then stays at the sustained delay forever.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Serialized retained presence payload for this console
pub fn console_status_payload(
    client_id: &str,
    status: PresenceStatus,
) -> Result<Vec<u8>, MqttError> {
    serde_json::to_vec(&ConsoleStatus::new(client_id, status)).map_err(MqttError::SerializationError)
}

/// Build broker options for a console connection
///
/// The client id is stable across reconnects so the broker can attribute
/// the last will to this console.
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
    topics: &TopicLayout,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let default_port = match url.scheme() {
        "mqtt" | "tcp" => 1883,
        "mqtts" | "ssl" => 8883,
        _ => return Err(MqttError::InvalidBrokerUrl(config.broker_url.clone())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url.port().unwrap_or(default_port);

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if default_port == 8883 {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    // Broker announces us offline if the link dies without a clean disconnect
    let lwt_payload = console_status_payload(client_id, PresenceStatus::Offline)?;
    let lwt = LastWill::new(
        &topics.console_status,
        lwt_payload,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        crate::config::ConsoleConfig::with_broker("mqtt://localhost:1883").mqtt
    }

    #[test]
    fn test_reconnect_config_from_section() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_pattern, vec![1000, 2000, 5000]);
        assert_eq!(config.sustained_delay, 5000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![100, 200, 400],
            sustained_delay: 1000,
        };

        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert_eq!(config.calculate_backoff_delay(2), 200);
        assert_eq!(config.calculate_backoff_delay(3), 400);
        assert_eq!(config.calculate_backoff_delay(4), 1000);
        assert_eq!(config.calculate_backoff_delay(500), 1000);
        // attempt 0 is treated as the first attempt
        assert_eq!(config.calculate_backoff_delay(0), 100);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 750,
        };
        assert_eq!(config.calculate_backoff_delay(1), 750);
    }

    #[test]
    fn test_connection_state_activity() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting(3).is_active());
        assert!(!ConnectionState::Disconnected("closed".to_string()).is_active());
    }

    #[test]
    fn test_connection_state_serializes_tagged() {
        let value = serde_json::to_value(ConnectionState::Reconnecting(2)).unwrap();
        assert_eq!(value["state"], "reconnecting");
        assert_eq!(value["detail"], 2);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options =
            configure_mqtt_options("console-1", &test_mqtt_config(), &TopicLayout::default())
                .unwrap();
        assert_eq!(options.client_id(), "console-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_mqtts_default_port() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://broker.example.com".to_string();
        let options =
            configure_mqtt_options("console-1", &config, &TopicLayout::default()).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();
        let result = configure_mqtt_options("console-1", &config, &TopicLayout::default());
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));

        config.broker_url = "http://localhost:1883".to_string();
        let result = configure_mqtt_options("console-1", &config, &TopicLayout::default());
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_console_status_payload() {
        let payload = console_status_payload("console-1", PresenceStatus::Online).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["clientId"], "console-1");
        assert_eq!(value["status"], "online");
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
