//! nginx-console - MQTT command/response core for an nginx agent fleet
//!
//! Turns the broker's fire-and-forget publish/subscribe model into
//! request/response calls with per-call timeouts, and keeps an in-memory
//! view of which agents are alive.
//!
//! # Overview
//!
//! - [`transport`] - the single broker connection, reconnecting forever
//! - [`presence`] - agent presence from `heartbeat` and `status` broadcasts
//! - [`correlation`] - commands on `command/{agent}`, answers on `response/{agent}`
//! - [`console`] - wiring and lifecycle of all of the above
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nginx_console::{Console, ConsoleConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = ConsoleConfig::with_broker("mqtt://localhost:1883");
//! let console = Console::from_config(&config)?;
//! console.start().await?;
//! console.wait_connected(Duration::from_secs(5)).await?;
//!
//! match console.send("agent-1", "reload_nginx", json!({}), None).await {
//!     Ok(response) => println!("reloaded: {:?}", response.message),
//!     Err(e) if e.is_timeout() => println!("agent did not answer"),
//!     Err(e) => println!("reload failed: {e}"),
//! }
//!
//! console.shutdown().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod console;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod presence;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConsoleConfig};
pub use console::Console;
pub use correlation::{Correlator, PendingCommand, ResponseDisposition};
pub use error::{CommandError, CommandResult, ConsoleError, ConsoleResult};
pub use presence::{AgentPresence, PresenceChange, PresenceTracker};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
pub use transport::{ConnectionStatus, Transport, TransportEvent};
