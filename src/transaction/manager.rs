//! Resource side of a coordinator link.

use std::collections::HashMap;

use bytes::Bytes;

use crate::endpoint::{LinkId, SessionId, TransactionId};

/// Receives declare and discharge requests on a coordinator receiver.
#[derive(Debug)]
pub struct Manager {
    pub(crate) session: SessionId,
    pub(crate) link: LinkId,
    pub(crate) transactions: Vec<TransactionId>,
    pub(crate) by_txn_id: HashMap<Bytes, TransactionId>,
}

impl Manager {
    pub(crate) fn new(session: SessionId, link: LinkId) -> Self {
        Self {
            session,
            link,
            transactions: Vec::new(),
            by_txn_id: HashMap::new(),
        }
    }

    /// Session the coordinator link lives on.
    #[must_use]
    pub const fn session(&self) -> SessionId { self.session }

    /// The receiver link accepting control messages.
    #[must_use]
    pub const fn link(&self) -> LinkId { self.link }

    /// Transactions requested through this manager, oldest first.
    #[must_use]
    pub fn transactions(&self) -> &[TransactionId] { &self.transactions }

    /// Transaction declared under `txn_id`, if still active.
    #[must_use]
    pub fn lookup(&self, txn_id: &[u8]) -> Option<TransactionId> {
        self.by_txn_id.get(txn_id).copied()
    }
}
