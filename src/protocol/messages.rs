//! Wire payloads exchanged with agents
//!
//! All payloads are JSON. Field names follow the agents' camelCase convention,
//! so every struct here carries `rename_all = "camelCase"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Command published to `command/{agent_id}`
///
/// # Examples
/// ```
/// use nginx_console::protocol::CommandEnvelope;
/// use serde_json::json;
///
/// let envelope = CommandEnvelope {
///     command: "reload_nginx".to_string(),
///     params: json!({}),
///     request_id: "8d3c7a0e-4a55-4f43-9d33-0a4b2d7c6b11".to_string(),
///     timestamp: 1_700_000_000_000,
///     client_id: "console-1".to_string(),
/// };
/// let json = serde_json::to_value(&envelope).unwrap();
/// assert_eq!(json["requestId"], "8d3c7a0e-4a55-4f43-9d33-0a4b2d7c6b11");
/// assert_eq!(json["clientId"], "console-1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Command name understood by the agent (e.g. `reload_nginx`)
    pub command: String,
    /// Command parameters, always a JSON object
    pub params: Value,
    /// Correlation id echoed back in the response
    pub request_id: String,
    /// Milliseconds since the Unix epoch at publish time
    pub timestamp: i64,
    /// Identifier of the issuing console, for tracing on the agent side
    pub client_id: String,
}

/// Response published by an agent to `response/{agent_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub request_id: String,
    pub success: bool,
    /// Failure description; agents may also set it on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Any command-specific result fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Periodic heartbeat broadcast by every agent
///
/// Everything besides `uuid` is free-form metadata (hostname, version, ip...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub uuid: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Explicit availability notice from an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub uuid: String,
    pub status: PresenceStatus,
}

/// Availability values carried by status messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// This console's own presence announcement (also used as the last will)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleStatus {
    pub client_id: String,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleStatus {
    pub fn new(client_id: &str, status: PresenceStatus) -> Self {
        Self {
            client_id: client_id.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Reasons an inbound payload is rejected
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Payload is missing the agent identifier")]
    MissingAgentId,
    #[error("Response is missing the request identifier")]
    MissingRequestId,
}

impl HeartbeatMessage {
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(payload)?;
        if message.uuid.trim().is_empty() {
            return Err(ProtocolError::MissingAgentId);
        }
        Ok(message)
    }
}

impl StatusMessage {
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(payload)?;
        if message.uuid.trim().is_empty() {
            return Err(ProtocolError::MissingAgentId);
        }
        Ok(message)
    }
}

impl CommandResponse {
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(payload)?;
        if message.request_id.is_empty() {
            return Err(ProtocolError::MissingRequestId);
        }
        Ok(message)
    }

    /// Message reported to callers when the agent signalled failure
    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "command failed".to_string())
    }
}
