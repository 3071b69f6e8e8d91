//! MQTT transport for the console
//!
//! Pure decisions are kept apart from the I/O so they can be tested without
//! a broker:
//!
//! - [`connection`] - connection states, backoff, broker options
//! - [`message_handler`] - routing of rumqttc events
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the supervisor task and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use nginx_console::config::ConsoleConfig;
//! use nginx_console::transport::mqtt::MqttClient;
//! use nginx_console::transport::{wait_for_connection, Transport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = ConsoleConfig::with_broker("mqtt://localhost:1883");
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let client = MqttClient::new("console-1", config.mqtt, config.topics, events_tx)?;
//! client.connect().await?;
//! wait_for_connection(client.state_changes(), Duration::from_secs(5)).await?;
//! client.subscribe("heartbeat").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
