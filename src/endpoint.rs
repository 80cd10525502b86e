//! Identifiers and lifecycle states shared by every endpoint.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// The engine's single connection.
    ConnectionId,
    "connection"
);
id_type!(
    /// A session owned by the engine.
    SessionId,
    "session"
);
id_type!(
    /// A sender or receiver link.
    LinkId,
    "link"
);
id_type!(
    /// A delivery, local to this engine (not the wire delivery-id).
    DeliveryKey,
    "delivery"
);
id_type!(
    /// A transaction known to a controller or manager.
    TransactionId,
    "transaction"
);
id_type!(
    /// The client half of a coordinator link.
    ControllerId,
    "controller"
);
id_type!(
    /// The resource half of a coordinator link.
    ManagerId,
    "manager"
);

/// Open/close state of a connection or session end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointState {
    /// Not yet opened.
    #[default]
    Idle,
    /// Opened and not yet closed.
    Active,
    /// Closed; terminal.
    Closed,
}

/// State of one end of a link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet attached.
    #[default]
    Idle,
    /// Attached.
    Active,
    /// Detached without closing; terminal for this attachment.
    Detached,
    /// Closed; terminal.
    Closed,
}

impl LinkState {
    /// Closed or detached.
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Detached | Self::Closed) }
}

/// Anything events can be delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The engine itself.
    Engine,
    /// The connection.
    Connection,
    /// A session.
    Session(SessionId),
    /// A plain link.
    Link(LinkId),
    /// A transaction controller.
    Controller(ControllerId),
    /// A transaction manager.
    Manager(ManagerId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Connection => f.write_str("connection"),
            Self::Session(id) => id.fmt(f),
            Self::Link(id) => id.fmt(f),
            Self::Controller(id) => id.fmt(f),
            Self::Manager(id) => id.fmt(f),
        }
    }
}
