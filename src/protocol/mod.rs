//! Wire protocol between the console and its nginx agents
//!
//! Message payloads and the topic layout they travel on.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
