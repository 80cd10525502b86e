//! Client side of a coordinator link.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use crate::{
    endpoint::{ControllerId, DeliveryKey, LinkId, SessionId, TransactionId},
    engine::Engine,
};

/// Callback run once the controller's link has credit to declare or
/// discharge.
pub(crate) type CapacityHandler = Box<dyn FnOnce(&mut Engine, ControllerId)>;

/// Declares and discharges transactions through a coordinator target.
pub struct Controller {
    pub(crate) session: SessionId,
    pub(crate) link: LinkId,
    pub(crate) transactions: Vec<TransactionId>,
    pub(crate) outstanding: HashMap<DeliveryKey, TransactionId>,
    pub(crate) capacity_handlers: VecDeque<CapacityHandler>,
}

impl Controller {
    pub(crate) fn new(session: SessionId, link: LinkId) -> Self {
        Self {
            session,
            link,
            transactions: Vec::new(),
            outstanding: HashMap::new(),
            capacity_handlers: VecDeque::new(),
        }
    }

    /// Session the coordinator link lives on.
    #[must_use]
    pub const fn session(&self) -> SessionId { self.session }

    /// The sender link carrying declare and discharge messages.
    #[must_use]
    pub const fn link(&self) -> LinkId { self.link }

    /// Transactions created by this controller, oldest first.
    #[must_use]
    pub fn transactions(&self) -> &[TransactionId] { &self.transactions }

    /// Capacity callbacks still waiting for credit.
    #[must_use]
    pub fn pending_capacity_handlers(&self) -> usize { self.capacity_handlers.len() }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("session", &self.session)
            .field("link", &self.link)
            .field("transactions", &self.transactions)
            .field("outstanding", &self.outstanding)
            .field("capacity_handlers", &self.capacity_handlers.len())
            .finish()
    }
}
