//! A transaction controller on the client wired to a manager on the server.

use std::{cell::RefCell, rc::Rc};

use amqp_engine::{
    ControllerId,
    Endpoint,
    Engine,
    Event,
    EventKind,
    ManagerId,
    SessionId,
    TransactionId,
    TxnState,
};
use anyhow::Context as _;

use crate::{AnyError, Loopback};

/// Events captured by a recording handler.
pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// Record every `kinds` event raised on `endpoint`.
pub fn record(engine: &mut Engine, endpoint: Endpoint, kinds: &[EventKind]) -> EventLog {
    let log = EventLog::default();
    for kind in kinds {
        let sink = Rc::clone(&log);
        engine.set_handler(endpoint, *kind, move |_, event| {
            sink.borrow_mut().push(event.clone());
            Ok(())
        });
    }
    log
}

/// Loopback engines with an attached coordinator link.
///
/// The server answers the client's Begin and records the manager created
/// by the controller's attach; the manager is opened and granted the
/// requested credit before [`Coordinated::new`] returns.
#[derive(Debug)]
pub struct Coordinated {
    /// The connected engines.
    pub net: Loopback,
    /// Controller on the client.
    pub controller: ControllerId,
    /// Manager on the server.
    pub manager: ManagerId,
    /// Declared, DeclareFailed, Discharged and `DischargeFailed` on the client.
    pub outcomes: EventLog,
    /// `DeclareRequested` and `DischargeRequested` on the server.
    pub requests: EventLog,
    session: SessionId,
    managers: Rc<RefCell<Vec<ManagerId>>>,
}

impl Coordinated {
    /// Attach a controller named `txn-ctl` and grant it `credit`.
    ///
    /// # Errors
    /// Fails if either engine refuses a step or no manager appears.
    pub fn new(credit: u32) -> Result<Self, AnyError> {
        let mut net = Loopback::new()?;
        let managers = Rc::new(RefCell::new(Vec::new()));
        let found = Rc::clone(&managers);
        net.server.set_handler(
            Endpoint::Connection,
            EventKind::RemoteSessionOpened,
            move |engine, event| {
                let Event::RemoteSessionOpened(session) = event else {
                    return Ok(());
                };
                engine.open_connection()?;
                engine.open_session(*session)?;
                let sink = Rc::clone(&found);
                engine.set_handler(
                    Endpoint::Session(*session),
                    EventKind::RemoteManagerOpened,
                    move |_, opened| {
                        if let Event::RemoteManagerOpened(_, manager) = opened {
                            sink.borrow_mut().push(*manager);
                        }
                        Ok(())
                    },
                );
                Ok(())
            },
        );

        net.client.open_connection()?;
        let session = net.client.new_session()?;
        net.client.open_session(session)?;
        let controller = net.client.new_controller(session, "txn-ctl")?;
        net.client.open_controller(controller)?;
        net.pump()?;

        let manager = managers
            .borrow()
            .first()
            .copied()
            .context("the controller's attach created no manager")?;
        grant(&mut net, manager, credit)?;

        let outcomes = record(
            &mut net.client,
            Endpoint::Controller(controller),
            &[
                EventKind::Declared,
                EventKind::DeclareFailed,
                EventKind::Discharged,
                EventKind::DischargeFailed,
            ],
        );
        let requests = record(
            &mut net.server,
            Endpoint::Manager(manager),
            &[EventKind::DeclareRequested, EventKind::DischargeRequested],
        );
        Ok(Self {
            net,
            controller,
            manager,
            outcomes,
            requests,
            session,
            managers,
        })
    }

    /// Attach another controller named `name` on the same session and grant
    /// its manager `credit`.
    ///
    /// # Errors
    /// Fails if either engine refuses a step or no new manager appears.
    pub fn attach_controller(
        &mut self,
        name: &str,
        credit: u32,
    ) -> Result<(ControllerId, ManagerId), AnyError> {
        let known = self.managers.borrow().len();
        let controller = self.net.client.new_controller(self.session, name)?;
        self.net.client.open_controller(controller)?;
        self.net.pump()?;
        let manager = self
            .managers
            .borrow()
            .get(known)
            .copied()
            .with_context(|| format!("attaching {name} created no manager"))?;
        grant(&mut self.net, manager, credit)?;
        Ok((controller, manager))
    }

    /// The transaction named by the most recent manager request.
    ///
    /// # Errors
    /// Fails when the manager has seen no request.
    pub fn last_request(&self) -> Result<TransactionId, AnyError> {
        self.requests
            .borrow()
            .last()
            .and_then(Event::transaction)
            .context("the manager saw no request")
    }

    /// Send a declare and pump it to the manager. Returns the client's id.
    ///
    /// # Errors
    /// Returns whatever the declare or the transfer reports.
    pub fn declare(&mut self) -> Result<TransactionId, AnyError> {
        let txn = self.net.client.declare(self.controller, None)?;
        self.net.pump()?;
        Ok(txn)
    }

    /// Declare a transaction and have the manager accept it as `txn_id`.
    ///
    /// # Errors
    /// Returns the first failure along the way.
    pub fn declared(&mut self, txn_id: &'static [u8]) -> Result<TransactionId, AnyError> {
        let txn = self.declare()?;
        let requested = self.last_request()?;
        self.net.server.manager_declared(self.manager, requested, txn_id)?;
        self.net.pump()?;
        Ok(txn)
    }

    /// State of `txn` on the client.
    #[must_use]
    pub fn client_state(&self, txn: TransactionId) -> Option<TxnState> {
        self.net.client.transaction(txn).map(|t| t.state())
    }

    /// State of `txn` on the server.
    #[must_use]
    pub fn server_state(&self, txn: TransactionId) -> Option<TxnState> {
        self.net.server.transaction(txn).map(|t| t.state())
    }
}

/// Open `manager` on the server and grant it `credit`.
fn grant(net: &mut Loopback, manager: ManagerId, credit: u32) -> Result<(), AnyError> {
    net.server.open_manager(manager)?;
    if credit > 0 {
        let link = net.server.manager(manager).context("manager vanished")?.link();
        net.server.add_credit(link, credit)?;
    }
    net.pump()?;
    Ok(())
}
