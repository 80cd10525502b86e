//! Transactional resource protocol.
//!
//! A [`Controller`] drives transactions from the client side over a sender
//! link whose target is a coordinator; a [`Manager`] is the resource side,
//! wrapping the receiver that accepts those control messages. Both keep their
//! [`Transaction`]s in the engine's arena and refuse to act on transactions
//! owned by another instance.

mod controller;
mod manager;

use bytes::Bytes;

pub use controller::Controller;
pub(crate) use controller::CapacityHandler;
pub use manager::Manager;

use crate::{
    codec::ErrorCondition,
    endpoint::{ControllerId, DeliveryKey, ManagerId},
    error::{EngineError, Result},
};

/// Lifecycle of one transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxnState {
    /// Created, not yet declared.
    #[default]
    Idle,
    /// Declare sent (controller) or received (manager).
    Declaring,
    /// The coordinator assigned a transaction id.
    Declared,
    /// Discharge sent or received.
    Discharging,
    /// Discharge accepted; terminal.
    Discharged,
    /// Declare rejected; terminal.
    DeclareFailed,
    /// Discharge rejected; terminal.
    DischargeFailed,
}

impl TxnState {
    /// No further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Discharged | Self::DeclareFailed | Self::DischargeFailed
        )
    }

    /// The transaction ended in one of the failure states.
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::DeclareFailed | Self::DischargeFailed)
    }
}

/// Outcome a discharge asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DischargeState {
    /// `fail = false`: apply the transaction's work.
    Commit,
    /// `fail = true`: discard the transaction's work.
    Rollback,
}

impl DischargeState {
    pub(crate) const fn from_fail(fail: bool) -> Self {
        if fail { Self::Rollback } else { Self::Commit }
    }

    /// Value of the discharge `fail` field.
    #[must_use]
    pub const fn is_rollback(self) -> bool { matches!(self, Self::Rollback) }
}

/// Instance a transaction belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxnOwner {
    Controller(ControllerId),
    Manager(ManagerId),
}

/// One declared (or declaring) transaction.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) owner: TxnOwner,
    pub(crate) state: TxnState,
    pub(crate) txn_id: Option<Bytes>,
    pub(crate) discharge_state: Option<DischargeState>,
    pub(crate) error: Option<ErrorCondition>,
    pub(crate) delivery: Option<DeliveryKey>,
}

impl Transaction {
    pub(crate) const fn new(owner: TxnOwner) -> Self {
        Self {
            owner,
            state: TxnState::Idle,
            txn_id: None,
            discharge_state: None,
            error: None,
            delivery: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TxnState { self.state }

    /// Identifier assigned by the coordinator once declared.
    #[must_use]
    pub const fn txn_id(&self) -> Option<&Bytes> { self.txn_id.as_ref() }

    /// Commit or rollback, once a discharge has been requested.
    #[must_use]
    pub const fn discharge_state(&self) -> Option<DischargeState> { self.discharge_state }

    /// Error carried by a rejected declare or discharge.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorCondition> { self.error.as_ref() }

    /// The transaction ended in a failure state.
    #[must_use]
    pub const fn is_failed(&self) -> bool { self.state.is_failed() }

    /// Reject use of this transaction by a different controller or manager.
    pub(crate) fn ensure_owner(&self, owner: TxnOwner) -> Result<()> {
        if self.owner == owner {
            Ok(())
        } else {
            Err(EngineError::invalid_arg(
                "transaction belongs to a different controller or manager",
            ))
        }
    }

    pub(crate) fn ensure_state(&self, expected: TxnState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::invalid_op(format!(
                "cannot {action} a transaction in state {:?}",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TxnState::Idle, false, false)]
    #[case(TxnState::Declared, false, false)]
    #[case(TxnState::Discharged, true, false)]
    #[case(TxnState::DeclareFailed, true, true)]
    #[case(TxnState::DischargeFailed, true, true)]
    fn terminal_and_failed_states(
        #[case] state: TxnState,
        #[case] terminal: bool,
        #[case] failed: bool,
    ) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_failed(), failed);
    }

    #[test]
    fn foreign_owner_is_an_invalid_argument() {
        let txn = Transaction::new(TxnOwner::Controller(ControllerId(1)));
        assert!(txn.ensure_owner(TxnOwner::Controller(ControllerId(1))).is_ok());
        let other_controller = txn.ensure_owner(TxnOwner::Controller(ControllerId(2)));
        assert!(matches!(other_controller, Err(EngineError::InvalidArgument(_))));
        let manager = txn.ensure_owner(TxnOwner::Manager(ManagerId(1)));
        assert!(matches!(manager, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn discharge_state_follows_fail_flag() {
        assert_eq!(DischargeState::from_fail(false), DischargeState::Commit);
        assert!(DischargeState::from_fail(true).is_rollback());
    }
}
