//! Behavioural tests for transaction coordination over a loopback pair.

use std::cell::RefCell;

use amqp_engine::{EngineError, TransactionId, TxnState};
use bytes::Bytes;
use rstest::fixture;
use rstest_bdd_macros::{given, scenarios, then, when};
use test_util::Coordinated;

#[derive(Default)]
struct TxnWorld {
    link: RefCell<Option<Coordinated>>,
    txn: RefCell<Option<TransactionId>>,
}

impl TxnWorld {
    fn with<T>(&self, f: impl FnOnce(&mut Coordinated) -> T) -> T {
        let mut slot = self.link.borrow_mut();
        let coordinated = slot.as_mut().expect("coordinator link attached");
        f(coordinated)
    }

    fn txn(&self) -> TransactionId { self.txn.borrow().expect("transaction declared") }
}

#[fixture]
fn world() -> TxnWorld { TxnWorld::default() }

#[given("a controller attached to a manager with {credit:u32} credits")]
fn given_attached(world: &TxnWorld, credit: u32) {
    let coordinated = Coordinated::new(credit).expect("coordinator link");
    world.link.replace(Some(coordinated));
}

#[when("the controller declares a transaction")]
fn when_declare(world: &TxnWorld) {
    let txn = world.with(|c| c.declare().expect("declare"));
    world.txn.replace(Some(txn));
}

#[when("the manager accepts the declare")]
fn when_accept_declare(world: &TxnWorld) {
    world.with(|c| {
        let requested = c.last_request().expect("declare request");
        c.net
            .server
            .manager_declared(c.manager, requested, Bytes::from_static(b"bdd-txn"))
            .expect("declared");
        c.net.pump().expect("pump");
    });
}

#[when("the manager rejects the declare")]
fn when_reject_declare(world: &TxnWorld) {
    world.with(|c| {
        let requested = c.last_request().expect("declare request");
        c.net
            .server
            .manager_declare_failed(c.manager, requested, None)
            .expect("declare failed");
        c.net.pump().expect("pump");
    });
}

#[when("the controller commits the transaction")]
fn when_commit(world: &TxnWorld) {
    let txn = world.txn();
    world.with(|c| {
        assert_eq!(c.client_state(txn), Some(TxnState::Declared));
        c.net.client.discharge(c.controller, txn, false).expect("discharge");
        c.net.pump().expect("pump");
    });
}

#[when("the manager accepts the discharge")]
fn when_accept_discharge(world: &TxnWorld) {
    world.with(|c| {
        let requested = c.last_request().expect("discharge request");
        c.net
            .server
            .manager_discharged(c.manager, requested)
            .expect("discharged");
        c.net.pump().expect("pump");
    });
}

#[then("the controller sees the transaction as discharged")]
fn then_discharged(world: &TxnWorld) {
    let txn = world.txn();
    world.with(|c| {
        assert_eq!(c.client_state(txn), Some(TxnState::Discharged));
        assert_eq!(c.outcomes.borrow().len(), 2);
    });
}

#[then("the controller sees the declare as failed")]
fn then_declare_failed(world: &TxnWorld) {
    let txn = world.txn();
    world.with(|c| assert_eq!(c.client_state(txn), Some(TxnState::DeclareFailed)));
}

#[then("declaring a transaction is refused")]
fn then_refused(world: &TxnWorld) {
    world.with(|c| {
        let result = c.net.client.declare(c.controller, None);
        assert!(
            matches!(result, Err(EngineError::InvalidOperation(_))),
            "expected a refusal, got {result:?}"
        );
    });
}

scenarios!(
    "tests/features/transactions.feature",
    fixtures = [world: TxnWorld]
);
