//! Topic layout and agent ID validation
//!
//! Agents broadcast on two fixed topics (`heartbeat` and `status`) and each
//! agent owns a `command/{agent_id}` / `response/{agent_id}` pair. Every topic
//! the console touches is built or classified here so the prefixes live in
//! exactly one place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names of the topics shared between the console and its agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicLayout {
    /// Broadcast topic carrying agent heartbeats
    #[serde(default = "default_heartbeat_topic")]
    pub heartbeat: String,
    /// Broadcast topic carrying explicit agent online/offline notices
    #[serde(default = "default_status_topic")]
    pub status: String,
    /// Topic on which this console announces its own presence
    #[serde(default = "default_console_status_topic")]
    pub console_status: String,
    /// Prefix of per-agent command topics
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Prefix of per-agent response topics
    #[serde(default = "default_response_prefix")]
    pub response_prefix: String,
}

fn default_heartbeat_topic() -> String {
    "heartbeat".to_string()
}

fn default_status_topic() -> String {
    "status".to_string()
}

fn default_console_status_topic() -> String {
    "console/status".to_string()
}

fn default_command_prefix() -> String {
    "command".to_string()
}

fn default_response_prefix() -> String {
    "response".to_string()
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat_topic(),
            status: default_status_topic(),
            console_status: default_console_status_topic(),
            command_prefix: default_command_prefix(),
            response_prefix: default_response_prefix(),
        }
    }
}

/// Classification of an inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    Heartbeat,
    Status,
    Response { agent_id: String },
    Unknown,
}

impl TopicLayout {
    /// Build `command/{agent_id}`
    pub fn command_topic(&self, agent_id: &str) -> String {
        format!("{}/{}", self.command_prefix, agent_id)
    }

    /// Build `response/{agent_id}`
    pub fn response_topic(&self, agent_id: &str) -> String {
        format!("{}/{}", self.response_prefix, agent_id)
    }

    /// Topics that must be subscribed on every connection regardless of
    /// outstanding requests
    pub fn broadcast_topics(&self) -> Vec<String> {
        vec![self.heartbeat.clone(), self.status.clone()]
    }

    /// Decide which component an inbound topic belongs to
    pub fn classify(&self, topic: &str) -> InboundTopic {
        if topic == self.heartbeat {
            return InboundTopic::Heartbeat;
        }
        if topic == self.status {
            return InboundTopic::Status;
        }

        let agent_id = topic
            .strip_prefix(self.response_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'));

        match agent_id {
            Some(id) if !id.is_empty() && !id.contains('/') => InboundTopic::Response {
                agent_id: id.to_string(),
            },
            _ => InboundTopic::Unknown,
        }
    }

    /// Reject layouts that would subscribe to wildcards or collide
    pub fn validate(&self) -> Result<(), ValidationError> {
        for name in [
            &self.heartbeat,
            &self.status,
            &self.console_status,
            &self.command_prefix,
            &self.response_prefix,
        ] {
            validate_topic_name(name)?;
        }

        if self.command_prefix == self.response_prefix {
            return Err(ValidationError::InvalidTopic(format!(
                "command and response prefixes must differ (both '{}')",
                self.command_prefix
            )));
        }

        Ok(())
    }
}

/// Agent IDs are embedded in topic names, so anything that would change the
/// topic structure is rejected.
pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if ch == '/' || ch == '+' || ch == '#' || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

fn validate_topic_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidTopic("topic name is empty".to_string()));
    }
    if name.contains('+') || name.contains('#') {
        return Err(ValidationError::InvalidTopic(format!(
            "topic '{name}' must not contain MQTT wildcards"
        )));
    }
    Ok(())
}

/// Validation errors for topics and identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}
