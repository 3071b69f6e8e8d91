//! Error types for the console core
//!
//! [`CommandError`] is everything a `send()` caller can observe; it is the only
//! place command failures surface. [`ConsoleError`] covers lifecycle
//! operations (configuration, connecting, shutting down).

use crate::config::ConfigError;
use crate::protocol::ValidationError;
use crate::transport::mqtt::MqttError;
use std::time::Duration;
use thiserror::Error;

/// Settlement failure of a single command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("transport not connected")]
    NotConnected,

    #[error("agent id required")]
    AgentIdRequired,

    #[error("invalid agent id: {0}")]
    InvalidAgentId(ValidationError),

    #[error(
        "command '{command}' to agent '{agent_id}' timed out after {}ms",
        .timeout.as_millis()
    )]
    Timeout {
        agent_id: String,
        command: String,
        timeout: Duration,
    },

    /// The agent answered with `success: false`; message is the agent's own
    #[error("{message}")]
    Rejected { message: String },

    #[error("transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("failed to encode command: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request was dropped before a response arrived")]
    Dropped,
}

impl CommandError {
    /// Timeouts are the one failure higher layers may reasonably retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Whether the agent itself reported the failure
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandError::Rejected { .. })
    }

    /// Message suitable for showing to an operator: agent failures verbatim,
    /// timeouts as a generic no-response notice
    pub fn user_message(&self) -> String {
        match self {
            CommandError::Rejected { message } => message.clone(),
            CommandError::Timeout { .. } => "no response from agent (timed out)".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ValidationError> for CommandError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::EmptyAgentId => CommandError::AgentIdRequired,
            other => CommandError::InvalidAgentId(other),
        }
    }
}

/// Lifecycle errors of the console
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ConsoleError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for console lifecycle operations
pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Result of a single command
pub type CommandResult<T> = Result<T, CommandError>;
