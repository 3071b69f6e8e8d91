//! Console configuration
//!
//! Loaded from a TOML file. Broker credentials are never stored in the file;
//! the file names the environment variables that hold them and they are
//! resolved when the connection is configured.

use crate::protocol::TopicLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main console configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub console: ConsoleSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub commands: CommandSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub topics: TopicLayout,
    #[serde(default)]
    pub health: HealthSection,
}

/// Identity of this console on the broker
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsoleSection {
    /// Client identifier; generated as `console-<uuid8>` when absent
    pub client_id: Option<String>,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Console self-heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

/// Reconnect backoff; retries never stop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Delays in milliseconds for the first attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 5000]
}

fn default_sustained_delay_ms() -> u64 {
    5000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

/// Command correlation timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSection {
    /// Timeout applied when `send()` is called without one
    #[serde(default = "default_command_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Period of the expired-request sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CommandSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// In-memory presence tracking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    /// An agent with no heartbeat for this long is considered offline
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Coalescing window for presence change notifications
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,
}

fn default_liveness_window_secs() -> u64 {
    90
}

fn default_notify_interval_ms() -> u64 {
    250
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window_secs(),
            notify_interval_ms: default_notify_interval_ms(),
        }
    }
}

impl PresenceSection {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }
}

/// Optional HTTP health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsoleConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration pointing at `broker_url` with every default applied
    pub fn with_broker(broker_url: &str) -> Self {
        Self {
            console: ConsoleSection::default(),
            mqtt: MqttSection {
                broker_url: broker_url.to_string(),
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive(),
                heartbeat_interval_secs: default_heartbeat_interval(),
                reconnect: ReconnectSection::default(),
            },
            commands: CommandSection::default(),
            presence: PresenceSection::default(),
            topics: TopicLayout::default(),
            health: HealthSection::default(),
        }
    }

    /// Cross-field validation that TOML parsing cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(client_id) = &self.console.client_id {
            crate::protocol::validate_agent_id(client_id).map_err(|e| {
                ConfigError::InvalidConfig(format!("console.client_id '{client_id}': {e}"))
            })?;
        }

        self.topics
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("topics: {e}")))?;

        if self.commands.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.default_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.commands.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.commands.sweep_interval_ms >= self.commands.default_timeout_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "commands.sweep_interval_ms ({}) must be shorter than commands.default_timeout_ms ({})",
                self.commands.sweep_interval_ms, self.commands.default_timeout_ms
            )));
        }

        if self.mqtt.reconnect.backoff_ms.iter().any(|&d| d == 0)
            || self.mqtt.reconnect.sustained_delay_ms == 0
        {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect delays must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.presence.liveness_window_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "presence.liveness_window_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Client id from the file, or a fresh `console-<uuid8>`
    pub fn resolve_client_id(&self) -> String {
        match &self.console.client_id {
            Some(id) => id.clone(),
            None => {
                let uuid = uuid::Uuid::new_v4().simple().to_string();
                format!("console-{}", &uuid[..8])
            }
        }
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Fail when a credentials variable is configured but missing
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.mqtt.username_env {
            if std::env::var(name).is_err() {
                return Err(ConfigError::EnvVarNotFound(name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[console]
client_id = "console-ops-1"

[mqtt]
broker_url = "mqtts://broker.internal:8883"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 15
heartbeat_interval_secs = 10

[mqtt.reconnect]
backoff_ms = [500, 1000]
sustained_delay_ms = 3000

[commands]
default_timeout_ms = 20000
sweep_interval_ms = 2000

[presence]
liveness_window_secs = 60
notify_interval_ms = 100

[topics]
heartbeat = "fleet/heartbeat"

[health]
enabled = true
port = 9100
"#;

        let config = ConsoleConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.console.client_id.as_deref(), Some("console-ops-1"));
        assert_eq!(config.mqtt.keep_alive_secs, 15);
        assert_eq!(config.mqtt.reconnect.backoff_ms, vec![500, 1000]);
        assert_eq!(config.commands.default_timeout(), Duration::from_secs(20));
        assert_eq!(config.presence.notify_interval(), Duration::from_millis(100));
        assert_eq!(config.topics.heartbeat, "fleet/heartbeat");
        assert_eq!(config.topics.status, "status");
        assert!(config.health.enabled);
        assert_eq!(config.health.port, 9100);
    }

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = ConsoleConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();

        assert_eq!(config, ConsoleConfig::with_broker("mqtt://localhost:1883"));
        assert_eq!(config.commands.default_timeout_ms, 30_000);
        assert_eq!(config.commands.sweep_interval_ms, 5_000);
        assert_eq!(config.mqtt.reconnect.sustained_delay_ms, 5_000);
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_sweep_must_be_shorter_than_timeout() {
        let result = ConsoleConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[commands]
default_timeout_ms = 5000
sweep_interval_ms = 5000
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_wildcard_client_id_rejected() {
        let mut config = ConsoleConfig::with_broker("mqtt://localhost:1883");
        config.console.client_id = Some("console/#".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let mut config = ConsoleConfig::with_broker("mqtt://localhost:1883");
        config.mqtt.reconnect.backoff_ms = vec![100, 0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_client_id() {
        let config = ConsoleConfig::with_broker("mqtt://localhost:1883");
        let first = config.resolve_client_id();
        let second = config.resolve_client_id();

        assert!(first.starts_with("console-"));
        assert_eq!(first.len(), "console-".len() + 8);
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_credentials_env() {
        let mut config = ConsoleConfig::with_broker("mqtt://localhost:1883");
        config.mqtt.username_env = Some("NGINX_CONSOLE_TEST_UNSET_USER".to_string());
        assert!(matches!(
            config.require_credentials(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
