//! Sans-I/O AMQP 1.0 protocol engine.
//!
//! The crate turns bytes read from a peer into endpoint state changes and
//! events, and turns local endpoint operations into frames. It never touches
//! a socket or a clock: callers feed input with [`Engine::ingest`], collect
//! output from an [`OutputSink`] or [`Engine::take_output`], and drive idle
//! timeouts with [`Engine::tick`] or a [`TickScheduler`].
//!
//! Connections, sessions, links, deliveries and transactions are all owned
//! by the [`Engine`] and addressed through copyable identifiers such as
//! [`SessionId`] and [`LinkId`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod idle;
pub mod link;
pub mod preamble;
pub mod sequence;
pub mod session;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use codec::{DeliveryState, ErrorCondition, Role, Symbol};
pub use config::{ConfigError, EngineConfig};
pub use endpoint::{
    ConnectionId,
    ControllerId,
    DeliveryKey,
    Endpoint,
    EndpointState,
    LinkId,
    LinkState,
    ManagerId,
    SessionId,
    TransactionId,
};
pub use engine::{
    Engine,
    EngineState,
    Event,
    EventKind,
    LOCAL_TRANSACTIONS,
    OutputSink,
    Pipeline,
    TickScheduler,
    WriteStatus,
    WriteToken,
};
pub use error::{EngineError, EngineFailure, Result};
pub use transaction::{DischargeState, TxnState};
