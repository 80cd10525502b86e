//! Controller and manager operations over coordinator links.

use bytes::Bytes;
use tracing::debug;

use super::{Engine, Event, Queued};
use crate::{
    codec::{
        ControlMessage, Coordinator, Declare, DeliveryState, Discharge, ErrorCondition, Role,
        Source, Symbol, TargetKind, condition,
    },
    endpoint::{ControllerId, DeliveryKey, ManagerId, SessionId, TransactionId},
    error::{EngineError, Result},
    link::LinkOwner,
    transaction::{Controller, DischargeState, Manager, Transaction, TxnOwner, TxnState},
};

/// Capability advertised by coordinators supporting local transactions.
pub const LOCAL_TRANSACTIONS: &str = "amqp:local-transactions";

impl Engine {
    /// Create a transaction controller: a sender on `session` whose target is
    /// a coordinator.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn new_controller(
        &mut self,
        session: SessionId,
        name: impl Into<String>,
    ) -> Result<ControllerId> {
        self.ensure_usable()?;
        self.session_ref(session)?;
        let controller = ControllerId(self.alloc_id());
        let link = self.insert_link(
            session,
            name.into(),
            Role::Sender,
            LinkOwner::Controller(controller),
        );
        if let Some(sender) = self.links.get_mut(&link) {
            sender.source = Some(Source {
                outcomes: Some(vec![
                    Symbol::from("amqp:accepted:list"),
                    Symbol::from("amqp:rejected:list"),
                ]),
                ..Source::default()
            });
            sender.target = Some(TargetKind::Coordinator(Coordinator {
                capabilities: Some(vec![Symbol::from(LOCAL_TRANSACTIONS)]),
            }));
        }
        self.controllers.insert(controller, Controller::new(session, link));
        Ok(controller)
    }

    /// Attach the controller's link.
    ///
    /// # Errors
    /// As for [`Engine::open_link`].
    pub fn open_controller(&mut self, controller: ControllerId) -> Result<()> {
        let link = self.controller_ref(controller)?.link;
        self.open_link(link)
    }

    /// Close the controller's link.
    ///
    /// # Errors
    /// As for [`Engine::close_link`].
    pub fn close_controller(
        &mut self,
        controller: ControllerId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        let link = self.controller_ref(controller)?.link;
        self.close_link(link, error)
    }

    /// Create an undeclared transaction owned by `controller`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown controller.
    pub fn new_transaction(&mut self, controller: ControllerId) -> Result<TransactionId> {
        self.ensure_usable()?;
        self.controller_ref(controller)?;
        Ok(self.create_transaction(TxnOwner::Controller(controller)))
    }

    fn create_transaction(&mut self, owner: TxnOwner) -> TransactionId {
        let id = TransactionId(self.alloc_id());
        self.transactions.insert(id, Transaction::new(owner));
        match owner {
            TxnOwner::Controller(controller) => {
                if let Some(state) = self.controllers.get_mut(&controller) {
                    state.transactions.push(id);
                }
            }
            TxnOwner::Manager(manager) => {
                if let Some(state) = self.managers.get_mut(&manager) {
                    state.transactions.push(id);
                }
            }
        }
        id
    }

    /// Declare `txn`, or a new transaction when `None`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] when the coordinator link has
    /// no credit or the transaction was already declared, and
    /// [`EngineError::InvalidArgument`] when `txn` belongs to another
    /// controller.
    pub fn declare(
        &mut self,
        controller: ControllerId,
        txn: Option<TransactionId>,
    ) -> Result<TransactionId> {
        self.ensure_running()?;
        let link = self.controller_ref(controller)?.link;
        if let Some(id) = txn {
            let existing = self.transaction_ref(id)?;
            existing.ensure_owner(TxnOwner::Controller(controller))?;
            existing.ensure_state(TxnState::Idle, "declare")?;
        }
        if !self.link_ref(link)?.has_credit_to_send() {
            return Err(EngineError::invalid_op(
                "the coordinator link has no credit to declare a transaction",
            ));
        }
        self.run(|engine| {
            let id = match txn {
                Some(id) => id,
                None => engine.create_transaction(TxnOwner::Controller(controller)),
            };
            let message = ControlMessage::Declare(Declare::default());
            engine.send_control(controller, id, &message)?;
            if let Some(declaring) = engine.transactions.get_mut(&id) {
                declaring.state = TxnState::Declaring;
            }
            debug!(%controller, txn = %id, "declare sent");
            Ok(id)
        })
    }

    /// Ask the coordinator to commit (`failed == false`) or roll back `txn`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] unless `txn` is declared and
    /// the link has credit, and [`EngineError::InvalidArgument`] when `txn`
    /// belongs to another controller.
    pub fn discharge(
        &mut self,
        controller: ControllerId,
        txn: TransactionId,
        failed: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        let link = self.controller_ref(controller)?.link;
        let existing = self.transaction_ref(txn)?;
        existing.ensure_owner(TxnOwner::Controller(controller))?;
        existing.ensure_state(TxnState::Declared, "discharge")?;
        let txn_id = existing.txn_id.clone().unwrap_or_default();
        if !self.link_ref(link)?.has_credit_to_send() {
            return Err(EngineError::invalid_op(
                "the coordinator link has no credit to discharge a transaction",
            ));
        }
        self.run(|engine| {
            let message = ControlMessage::Discharge(Discharge {
                txn_id,
                fail: failed,
            });
            engine.send_control(controller, txn, &message)?;
            if let Some(discharging) = engine.transactions.get_mut(&txn) {
                discharging.state = TxnState::Discharging;
                discharging.discharge_state = Some(DischargeState::from_fail(failed));
            }
            debug!(%controller, %txn, failed, "discharge sent");
            Ok(())
        })
    }

    fn send_control(
        &mut self,
        controller: ControllerId,
        txn: TransactionId,
        message: &ControlMessage,
    ) -> Result<()> {
        let link = self.controller_ref(controller)?.link;
        let key = self.new_delivery(link)?;
        if let Some(state) = self.controllers.get_mut(&controller) {
            state.outstanding.insert(key, txn);
        }
        if let Some(state) = self.transactions.get_mut(&txn) {
            state.delivery = Some(key);
        }
        self.write_inner(key, message.encode(), true)
    }

    /// Queue `handler` to run once the controller's link has credit. Handlers
    /// run in registration order, one per available credit.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown controller.
    pub fn add_capacity_available_handler(
        &mut self,
        controller: ControllerId,
        handler: impl FnOnce(&mut Self, ControllerId) + 'static,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.controller_ref(controller)?;
        self.run(|engine| {
            if let Some(state) = engine.controllers.get_mut(&controller) {
                state.capacity_handlers.push_back(Box::new(handler));
            }
            engine.queue.push_back(Queued::ControllerCapacity(controller));
            Ok(())
        })
    }

    /// The coordinator answered a declare or discharge sent on `key`.
    pub(crate) fn controller_outcome(
        &mut self,
        controller: ControllerId,
        key: DeliveryKey,
    ) -> Result<()> {
        let Some(outcome) = self
            .deliveries
            .get(&key)
            .and_then(|d| d.remote_state.clone())
            .filter(DeliveryState::is_terminal)
        else {
            return Ok(());
        };
        let Some(txn) = self
            .controllers
            .get_mut(&controller)
            .and_then(|state| state.outstanding.remove(&key))
        else {
            return Ok(());
        };
        let Some(state) = self.transactions.get_mut(&txn) else {
            return Ok(());
        };
        state.delivery = None;
        let event = match (state.state, outcome) {
            (TxnState::Declaring, DeliveryState::Declared { txn_id }) => {
                state.txn_id = Some(txn_id);
                state.state = TxnState::Declared;
                Event::Declared(controller, txn)
            }
            (TxnState::Declaring, DeliveryState::Rejected(error)) => {
                state.error = error;
                state.state = TxnState::DeclareFailed;
                Event::DeclareFailed(controller, txn)
            }
            (TxnState::Declaring, _) => {
                state.state = TxnState::DeclareFailed;
                Event::DeclareFailed(controller, txn)
            }
            (TxnState::Discharging, DeliveryState::Accepted) => {
                state.state = TxnState::Discharged;
                Event::Discharged(controller, txn)
            }
            (TxnState::Discharging, DeliveryState::Rejected(error)) => {
                state.error = error;
                state.state = TxnState::DischargeFailed;
                Event::DischargeFailed(controller, txn)
            }
            (TxnState::Discharging, _) => {
                state.state = TxnState::DischargeFailed;
                Event::DischargeFailed(controller, txn)
            }
            _ => return Ok(()),
        };
        debug!(%controller, %txn, state = ?state.state, "coordinator answered");
        self.push_event(event);
        let settled = self.deliveries.get(&key).is_none_or(|d| d.local_settled);
        if settled {
            return Ok(());
        }
        self.apply_disposition(key, None, true)
    }

    /// Attach the manager's receiver link.
    ///
    /// # Errors
    /// As for [`Engine::open_link`].
    pub fn open_manager(&mut self, manager: ManagerId) -> Result<()> {
        let link = self.manager_ref(manager)?.link;
        self.open_link(link)
    }

    /// Close the manager's receiver link.
    ///
    /// # Errors
    /// As for [`Engine::close_link`].
    pub fn close_manager(
        &mut self,
        manager: ManagerId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        let link = self.manager_ref(manager)?.link;
        self.close_link(link, error)
    }

    /// A complete control message arrived on the manager's link.
    pub(crate) fn manager_received(&mut self, manager: ManagerId, key: DeliveryKey) -> Result<()> {
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        let body = delivery.buffer.split().freeze();
        let session = delivery.session;
        if let Some(owner) = self.sessions.get_mut(&session)
            && owner.incoming.bytes_released(body.len())
        {
            owner.flow_needed = true;
        }
        match ControlMessage::decode(body) {
            Err(err) => {
                debug!(%manager, error = %err, "undecodable control message");
                let error = ErrorCondition::new(condition::DECODE_ERROR, err.to_string());
                self.apply_disposition(key, Some(DeliveryState::Rejected(Some(error))), true)
            }
            Ok(ControlMessage::Declare(_)) => {
                let txn = self.create_transaction(TxnOwner::Manager(manager));
                if let Some(state) = self.transactions.get_mut(&txn) {
                    state.state = TxnState::Declaring;
                    state.delivery = Some(key);
                }
                self.push_event(Event::DeclareRequested(manager, txn));
                Ok(())
            }
            Ok(ControlMessage::Discharge(discharge)) => {
                let known = self
                    .managers
                    .get(&manager)
                    .and_then(|state| state.lookup(&discharge.txn_id));
                let declared = known.filter(|txn| {
                    self.transactions
                        .get(txn)
                        .is_some_and(|t| matches!(t.state, TxnState::Declared))
                });
                let Some(txn) = declared else {
                    let error = ErrorCondition::new(
                        condition::TRANSACTION_UNKNOWN_ID,
                        "no declared transaction has this id",
                    );
                    let rejected = DeliveryState::Rejected(Some(error));
                    return self.apply_disposition(key, Some(rejected), true);
                };
                if let Some(state) = self.transactions.get_mut(&txn) {
                    state.state = TxnState::Discharging;
                    state.discharge_state = Some(DischargeState::from_fail(discharge.fail));
                    state.delivery = Some(key);
                }
                self.push_event(Event::DischargeRequested(manager, txn));
                Ok(())
            }
        }
    }

    /// Accept the declare of `txn`, assigning it `txn_id`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] when `txn` was requested
    /// through a different manager and [`EngineError::InvalidOperation`]
    /// unless it is declaring.
    pub fn manager_declared(
        &mut self,
        manager: ManagerId,
        txn: TransactionId,
        txn_id: impl Into<Bytes>,
    ) -> Result<()> {
        self.ensure_manager_txn(manager, txn, TxnState::Declaring, "declare")?;
        let assigned = txn_id.into();
        self.run(|engine| {
            if let Some(state) = engine.managers.get_mut(&manager) {
                state.by_txn_id.insert(assigned.clone(), txn);
            }
            let outcome = DeliveryState::Declared {
                txn_id: assigned.clone(),
            };
            let key = engine.finish_transaction(txn, TxnState::Declared, None);
            if let Some(state) = engine.transactions.get_mut(&txn) {
                state.txn_id = Some(assigned);
            }
            engine.answer(key, outcome)
        })
    }

    /// Reject the declare of `txn`.
    ///
    /// # Errors
    /// As for [`Engine::manager_declared`].
    pub fn manager_declare_failed(
        &mut self,
        manager: ManagerId,
        txn: TransactionId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.ensure_manager_txn(manager, txn, TxnState::Declaring, "fail the declare of")?;
        self.run(|engine| {
            let key = engine.finish_transaction(txn, TxnState::DeclareFailed, error.clone());
            engine.answer(key, DeliveryState::Rejected(error))
        })
    }

    /// Accept the discharge of `txn`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] when `txn` was requested
    /// through a different manager and [`EngineError::InvalidOperation`]
    /// unless it is discharging.
    pub fn manager_discharged(&mut self, manager: ManagerId, txn: TransactionId) -> Result<()> {
        self.ensure_manager_txn(manager, txn, TxnState::Discharging, "discharge")?;
        self.run(|engine| {
            engine.forget_txn_id(manager, txn);
            let key = engine.finish_transaction(txn, TxnState::Discharged, None);
            engine.answer(key, DeliveryState::Accepted)
        })
    }

    /// Reject the discharge of `txn`.
    ///
    /// # Errors
    /// As for [`Engine::manager_discharged`].
    pub fn manager_discharge_failed(
        &mut self,
        manager: ManagerId,
        txn: TransactionId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.ensure_manager_txn(manager, txn, TxnState::Discharging, "fail the discharge of")?;
        self.run(|engine| {
            engine.forget_txn_id(manager, txn);
            let key = engine.finish_transaction(txn, TxnState::DischargeFailed, error.clone());
            engine.answer(key, DeliveryState::Rejected(error))
        })
    }

    fn ensure_manager_txn(
        &self,
        manager: ManagerId,
        txn: TransactionId,
        expected: TxnState,
        action: &str,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.manager_ref(manager)?;
        let existing = self.transaction_ref(txn)?;
        existing.ensure_owner(TxnOwner::Manager(manager))?;
        existing.ensure_state(expected, action)
    }

    /// Move `txn` to `state` and hand back the delivery awaiting an answer.
    fn finish_transaction(
        &mut self,
        txn: TransactionId,
        state: TxnState,
        error: Option<ErrorCondition>,
    ) -> Option<DeliveryKey> {
        let transaction = self.transactions.get_mut(&txn)?;
        transaction.state = state;
        transaction.error = error;
        transaction.delivery.take()
    }

    fn forget_txn_id(&mut self, manager: ManagerId, txn: TransactionId) {
        let Some(txn_id) = self.transactions.get(&txn).and_then(|t| t.txn_id.clone()) else {
            return;
        };
        if let Some(state) = self.managers.get_mut(&manager) {
            state.by_txn_id.remove(&txn_id);
        }
    }

    /// Settle the control delivery `key` with `outcome`.
    fn answer(&mut self, key: Option<DeliveryKey>, outcome: DeliveryState) -> Result<()> {
        match key {
            Some(delivery) => self.apply_disposition(delivery, Some(outcome), true),
            None => Ok(()),
        }
    }

    fn controller_ref(&self, id: ControllerId) -> Result<&Controller> {
        self.controllers
            .get(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    fn manager_ref(&self, id: ManagerId) -> Result<&Manager> {
        self.managers
            .get(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    fn transaction_ref(&self, id: TransactionId) -> Result<&Transaction> {
        self.transactions
            .get(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }
}
