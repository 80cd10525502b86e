//! Events and handler dispatch.
//!
//! Every endpoint exposes one handler slot per [`EventKind`]. Events are
//! queued while an operation runs and delivered in order before the public
//! call returns. A handler may call back into the engine; events it raises
//! join the same queue instead of nesting.

use tracing::{trace, warn};

use super::Engine;
use crate::{
    endpoint::{ControllerId, DeliveryKey, Endpoint, LinkId, ManagerId, SessionId, TransactionId},
    error::{EngineFailure, Result},
    link::LinkOwner,
};

/// Something that happened to an endpoint.
#[derive(Clone, Debug)]
pub enum Event {
    /// The engine started.
    EngineStarted,
    /// The engine failed.
    EngineFailed(EngineFailure),
    /// The engine shut down.
    EngineShutdown,
    /// The endpoint was opened locally.
    LocalOpen(Endpoint),
    /// The endpoint was closed locally.
    LocalClose(Endpoint),
    /// The link was detached locally without closing.
    LocalDetach(Endpoint),
    /// The peer opened the endpoint.
    RemoteOpen(Endpoint),
    /// The peer closed the endpoint.
    RemoteClose(Endpoint),
    /// The peer detached the link without closing.
    RemoteDetach(Endpoint),
    /// The engine shut down while the endpoint was still open at either end.
    EndpointShutdown(Endpoint),
    /// The endpoint's session or connection closed locally underneath it.
    ParentEndpointClosed(Endpoint),
    /// The peer began a session this end did not initiate.
    RemoteSessionOpened(SessionId),
    /// The peer attached a receiver; a local sender was created to pair it.
    RemoteSenderOpened(SessionId, LinkId),
    /// The peer attached a sender; a local receiver was created to pair it.
    RemoteReceiverOpened(SessionId, LinkId),
    /// The peer attached a controller; a local manager was created for it.
    RemoteManagerOpened(SessionId, ManagerId),
    /// Link credit or drain state changed.
    CreditStateUpdated(Endpoint),
    /// Payload arrived for an incoming delivery.
    DeliveryRead(Endpoint, DeliveryKey),
    /// The peer aborted an incoming delivery.
    DeliveryAborted(Endpoint, DeliveryKey),
    /// The peer changed a delivery's state or settled it.
    DeliveryStateUpdated(Endpoint, DeliveryKey),
    /// The coordinator declared the transaction.
    Declared(ControllerId, TransactionId),
    /// The coordinator rejected the declare.
    DeclareFailed(ControllerId, TransactionId),
    /// The coordinator accepted the discharge.
    Discharged(ControllerId, TransactionId),
    /// The coordinator rejected the discharge.
    DischargeFailed(ControllerId, TransactionId),
    /// A controller asked this manager to declare a transaction.
    DeclareRequested(ManagerId, TransactionId),
    /// A controller asked this manager to discharge a transaction.
    DischargeRequested(ManagerId, TransactionId),
}

/// Handler slot an [`Event`] is delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::EngineStarted`].
    EngineStarted,
    /// [`Event::EngineFailed`].
    EngineFailed,
    /// [`Event::EngineShutdown`].
    EngineShutdown,
    /// [`Event::LocalOpen`].
    LocalOpen,
    /// [`Event::LocalClose`].
    LocalClose,
    /// [`Event::LocalDetach`]; falls back to [`EventKind::LocalClose`].
    LocalDetach,
    /// [`Event::RemoteOpen`].
    RemoteOpen,
    /// [`Event::RemoteClose`].
    RemoteClose,
    /// [`Event::RemoteDetach`]; falls back to [`EventKind::RemoteClose`].
    RemoteDetach,
    /// [`Event::EndpointShutdown`].
    EndpointShutdown,
    /// [`Event::ParentEndpointClosed`].
    ParentEndpointClosed,
    /// [`Event::RemoteSessionOpened`].
    RemoteSessionOpened,
    /// [`Event::RemoteSenderOpened`].
    RemoteSenderOpened,
    /// [`Event::RemoteReceiverOpened`].
    RemoteReceiverOpened,
    /// [`Event::RemoteManagerOpened`].
    RemoteManagerOpened,
    /// [`Event::CreditStateUpdated`].
    CreditStateUpdated,
    /// [`Event::DeliveryRead`].
    DeliveryRead,
    /// [`Event::DeliveryAborted`]; falls back to [`EventKind::DeliveryRead`].
    DeliveryAborted,
    /// [`Event::DeliveryStateUpdated`].
    DeliveryStateUpdated,
    /// [`Event::Declared`].
    Declared,
    /// [`Event::DeclareFailed`].
    DeclareFailed,
    /// [`Event::Discharged`].
    Discharged,
    /// [`Event::DischargeFailed`].
    DischargeFailed,
    /// [`Event::DeclareRequested`].
    DeclareRequested,
    /// [`Event::DischargeRequested`].
    DischargeRequested,
}

impl EventKind {
    /// Slot consulted when no handler is set for this kind.
    #[must_use]
    pub const fn fallback(self) -> Option<Self> {
        match self {
            Self::LocalDetach => Some(Self::LocalClose),
            Self::RemoteDetach => Some(Self::RemoteClose),
            Self::DeliveryAborted => Some(Self::DeliveryRead),
            _ => None,
        }
    }
}

impl Event {
    /// Slot the event is delivered to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::EngineStarted => EventKind::EngineStarted,
            Self::EngineFailed(_) => EventKind::EngineFailed,
            Self::EngineShutdown => EventKind::EngineShutdown,
            Self::LocalOpen(_) => EventKind::LocalOpen,
            Self::LocalClose(_) => EventKind::LocalClose,
            Self::LocalDetach(_) => EventKind::LocalDetach,
            Self::RemoteOpen(_) => EventKind::RemoteOpen,
            Self::RemoteClose(_) => EventKind::RemoteClose,
            Self::RemoteDetach(_) => EventKind::RemoteDetach,
            Self::EndpointShutdown(_) => EventKind::EndpointShutdown,
            Self::ParentEndpointClosed(_) => EventKind::ParentEndpointClosed,
            Self::RemoteSessionOpened(_) => EventKind::RemoteSessionOpened,
            Self::RemoteSenderOpened(..) => EventKind::RemoteSenderOpened,
            Self::RemoteReceiverOpened(..) => EventKind::RemoteReceiverOpened,
            Self::RemoteManagerOpened(..) => EventKind::RemoteManagerOpened,
            Self::CreditStateUpdated(_) => EventKind::CreditStateUpdated,
            Self::DeliveryRead(..) => EventKind::DeliveryRead,
            Self::DeliveryAborted(..) => EventKind::DeliveryAborted,
            Self::DeliveryStateUpdated(..) => EventKind::DeliveryStateUpdated,
            Self::Declared(..) => EventKind::Declared,
            Self::DeclareFailed(..) => EventKind::DeclareFailed,
            Self::Discharged(..) => EventKind::Discharged,
            Self::DischargeFailed(..) => EventKind::DischargeFailed,
            Self::DeclareRequested(..) => EventKind::DeclareRequested,
            Self::DischargeRequested(..) => EventKind::DischargeRequested,
        }
    }

    /// Endpoint whose handler receives the event.
    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        match self {
            Self::EngineStarted | Self::EngineFailed(_) | Self::EngineShutdown => Endpoint::Engine,
            Self::LocalOpen(ep)
            | Self::LocalClose(ep)
            | Self::LocalDetach(ep)
            | Self::RemoteOpen(ep)
            | Self::RemoteClose(ep)
            | Self::RemoteDetach(ep)
            | Self::EndpointShutdown(ep)
            | Self::ParentEndpointClosed(ep)
            | Self::CreditStateUpdated(ep)
            | Self::DeliveryRead(ep, _)
            | Self::DeliveryAborted(ep, _)
            | Self::DeliveryStateUpdated(ep, _) => *ep,
            Self::RemoteSessionOpened(_) => Endpoint::Connection,
            Self::RemoteSenderOpened(session, _)
            | Self::RemoteReceiverOpened(session, _)
            | Self::RemoteManagerOpened(session, _) => Endpoint::Session(*session),
            Self::Declared(controller, _)
            | Self::DeclareFailed(controller, _)
            | Self::Discharged(controller, _)
            | Self::DischargeFailed(controller, _) => Endpoint::Controller(*controller),
            Self::DeclareRequested(manager, _) | Self::DischargeRequested(manager, _) => {
                Endpoint::Manager(*manager)
            }
        }
    }

    /// Delivery the event concerns, if any.
    #[must_use]
    pub const fn delivery(&self) -> Option<DeliveryKey> {
        match self {
            Self::DeliveryRead(_, key)
            | Self::DeliveryAborted(_, key)
            | Self::DeliveryStateUpdated(_, key) => Some(*key),
            _ => None,
        }
    }

    /// Transaction the event concerns, if any.
    #[must_use]
    pub const fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::Declared(_, txn)
            | Self::DeclareFailed(_, txn)
            | Self::Discharged(_, txn)
            | Self::DischargeFailed(_, txn)
            | Self::DeclareRequested(_, txn)
            | Self::DischargeRequested(_, txn) => Some(*txn),
            _ => None,
        }
    }
}

/// Boxed event handler.
pub(crate) type Handler = Box<dyn FnMut(&mut Engine, &Event) -> Result<()>>;

/// Work waiting for the dispatcher.
pub(crate) enum Queued {
    /// Deliver an event to its handler.
    Event(Event),
    /// Session outgoing capacity reopened: notify credited senders in order.
    NotifySenders(SessionId),
    /// Run capacity callbacks while the controller's link has credit.
    ControllerCapacity(ControllerId),
}

impl Engine {
    /// Install `handler` for `kind` events on `endpoint`, replacing any
    /// previous one.
    ///
    /// Handler errors are logged and otherwise ignored.
    pub fn set_handler(
        &mut self,
        endpoint: Endpoint,
        kind: EventKind,
        handler: impl FnMut(&mut Self, &Event) -> Result<()> + 'static,
    ) {
        self.handlers.insert((endpoint, kind), Box::new(handler));
    }

    /// Remove the handler for `kind` events on `endpoint`.
    pub fn clear_handler(&mut self, endpoint: Endpoint, kind: EventKind) {
        self.handlers.remove(&(endpoint, kind));
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.queue.push_back(Queued::Event(event));
    }

    pub(crate) fn push_link_event(&mut self, link: LinkId, make: impl FnOnce(Endpoint) -> Event) {
        let endpoint = self.link_endpoint(link);
        self.push_event(make(endpoint));
    }

    /// Drain the queue. Re-entrant calls return immediately; the outermost
    /// call delivers everything, then drops deliveries settled at both ends.
    pub(crate) fn dispatch(&mut self) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some(item) = self.queue.pop_front() {
            match item {
                Queued::Event(event) => self.deliver(&event),
                Queued::NotifySenders(session) => self.notify_senders(session),
                Queued::ControllerCapacity(controller) => self.run_capacity_handlers(controller),
            }
        }
        self.dispatching = false;
        self.purge_settled();
    }

    /// Invoke the handler for `event`, honouring fallbacks.
    pub(crate) fn deliver(&mut self, event: &Event) {
        let endpoint = event.endpoint();
        let kind = event.kind();
        let chosen = if self.handlers.contains_key(&(endpoint, kind)) {
            Some(kind)
        } else {
            kind.fallback()
                .filter(|fallback| self.handlers.contains_key(&(endpoint, *fallback)))
        };
        let Some(slot) = chosen else {
            trace!(%endpoint, ?kind, "no handler for event");
            return;
        };
        let key = (endpoint, slot);
        let Some(mut handler) = self.handlers.remove(&key) else {
            return;
        };
        if let Err(error) = handler(self, event) {
            warn!(%endpoint, ?kind, %error, "event handler failed");
        }
        // A handler installed while this one ran takes precedence.
        self.handlers.entry(key).or_insert(handler);
    }

    /// Notify credited senders of `session`, in creation order, while the
    /// session still has outgoing capacity.
    fn notify_senders(&mut self, session: SessionId) {
        let Some(links) = self.sessions.get(&session).map(|s| s.links.clone()) else {
            return;
        };
        for link in links {
            let capacity_left = self
                .sessions
                .get(&session)
                .is_some_and(|s| s.outgoing.is_sendable());
            if !capacity_left {
                break;
            }
            let Some(state) = self.links.get(&link) else {
                continue;
            };
            if !state.is_sender() || !state.has_credit_to_send() {
                continue;
            }
            if let LinkOwner::Controller(controller) = state.owner {
                self.run_capacity_handlers(controller);
                continue;
            }
            let endpoint = self.link_endpoint(link);
            self.deliver(&Event::CreditStateUpdated(endpoint));
        }
    }

    /// Consume capacity callbacks in registration order while credit lasts.
    fn run_capacity_handlers(&mut self, controller: ControllerId) {
        loop {
            let Some(state) = self.controllers.get(&controller) else {
                return;
            };
            let has_credit = self
                .links
                .get(&state.link)
                .is_some_and(crate::link::Link::has_credit_to_send);
            if !has_credit {
                return;
            }
            let Some(handler) = self
                .controllers
                .get_mut(&controller)
                .and_then(|c| c.capacity_handlers.pop_front())
            else {
                return;
            };
            handler(self, controller);
        }
    }
}
