//! Testing utilities
//!
//! Lets the correlation core run against an in-memory broker stand-in.

pub mod mocks;

pub use mocks::{MockTransport, PublishedMessage};
