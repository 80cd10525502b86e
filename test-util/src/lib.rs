//! Utilities for integration tests.
//!
//! The `test-util` crate plays the remote end of an AMQP connection against
//! an [`amqp_engine::Engine`]: [`ScriptedPeer`] writes hand-built frames and
//! decodes whatever the engine answers, [`RecordingSink`] captures output
//! through the sink interface, [`Loopback`] wires two engines together and
//! [`Coordinated`] adds a transaction controller and manager on top.

pub mod coordinator;
pub mod frames;
pub mod loopback;
pub mod peer;
pub mod sink;

pub use coordinator::{Coordinated, EventLog};
pub use loopback::Loopback;
pub use peer::{Received, ScriptedPeer};
pub use sink::RecordingSink;

/// Error type returned by helpers.
pub type AnyError = anyhow::Error;
