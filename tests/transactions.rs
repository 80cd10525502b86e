//! Declare and discharge between a controller and a manager.

use std::{cell::RefCell, rc::Rc};

use amqp_engine::{
    DischargeState,
    Endpoint,
    Engine,
    EngineError,
    Event,
    EventKind,
    ManagerId,
    TxnState,
    codec::{
        ControlMessage,
        DeliveryState,
        Declare,
        Discharge,
        ErrorCondition,
        Performative,
        Role,
        Transfer,
        TransferFlags,
        condition,
    },
};
use bytes::Bytes;
use rstest::{fixture, rstest};
use test_util::{Coordinated, ScriptedPeer, frames};

#[fixture]
fn coordinated() -> Coordinated { Coordinated::new(10).expect("coordinator link") }

#[rstest]
fn declare_then_commit(mut coordinated: Coordinated) {
    let txn = coordinated.declared(b"txn-1").expect("declared");
    assert_eq!(coordinated.client_state(txn), Some(TxnState::Declared));
    let declared = coordinated.net.client.transaction(txn).expect("transaction");
    assert_eq!(declared.txn_id(), Some(&Bytes::from_static(b"txn-1")));
    assert!(matches!(
        coordinated.outcomes.borrow().as_slice(),
        [Event::Declared(_, id)] if *id == txn
    ));

    coordinated
        .net
        .client
        .discharge(coordinated.controller, txn, false)
        .expect("discharge");
    assert_eq!(coordinated.client_state(txn), Some(TxnState::Discharging));
    coordinated.net.pump().expect("pump");

    let requested = coordinated.last_request().expect("discharge request");
    assert_eq!(coordinated.server_state(requested), Some(TxnState::Discharging));
    let on_server = coordinated.net.server.transaction(requested).expect("manager txn");
    assert_eq!(on_server.discharge_state(), Some(DischargeState::Commit));
    coordinated
        .net
        .server
        .manager_discharged(coordinated.manager, requested)
        .expect("discharged");
    coordinated.net.pump().expect("pump");

    assert_eq!(coordinated.client_state(txn), Some(TxnState::Discharged));
    assert_eq!(coordinated.outcomes.borrow().len(), 2);
    let manager = coordinated.net.server.manager(coordinated.manager).expect("manager");
    assert_eq!(manager.lookup(b"txn-1"), None);
}

#[rstest]
fn rejected_declare_carries_the_error(mut coordinated: Coordinated) {
    let txn = coordinated.declare().expect("declare");
    let requested = coordinated.last_request().expect("declare request");
    let error = ErrorCondition::new(condition::RESOURCE_LIMIT_EXCEEDED, "too many transactions");
    coordinated
        .net
        .server
        .manager_declare_failed(coordinated.manager, requested, Some(error.clone()))
        .expect("declare failed");
    coordinated.net.pump().expect("pump");

    let failed = coordinated.net.client.transaction(txn).expect("transaction");
    assert_eq!(failed.state(), TxnState::DeclareFailed);
    assert!(failed.is_failed());
    assert_eq!(failed.error(), Some(&error));
    assert!(matches!(
        coordinated.outcomes.borrow().as_slice(),
        [Event::DeclareFailed(..)]
    ));
}

#[rstest]
fn rollback_can_be_refused(mut coordinated: Coordinated) {
    let txn = coordinated.declared(b"txn-9").expect("declared");
    coordinated
        .net
        .client
        .discharge(coordinated.controller, txn, true)
        .expect("rollback");
    coordinated.net.pump().expect("pump");
    let requested = coordinated.last_request().expect("discharge request");
    let on_server = coordinated.net.server.transaction(requested).expect("manager txn");
    assert_eq!(on_server.discharge_state(), Some(DischargeState::Rollback));
    coordinated
        .net
        .server
        .manager_discharge_failed(coordinated.manager, requested, None)
        .expect("discharge failed");
    coordinated.net.pump().expect("pump");
    assert_eq!(coordinated.client_state(txn), Some(TxnState::DischargeFailed));
    assert_eq!(coordinated.server_state(requested), Some(TxnState::DischargeFailed));
}

#[rstest]
fn discharge_requires_a_declared_transaction(mut coordinated: Coordinated) {
    let controller = coordinated.controller;
    let txn = coordinated.net.client.new_transaction(controller).expect("transaction");
    assert_eq!(coordinated.client_state(txn), Some(TxnState::Idle));
    assert!(matches!(
        coordinated.net.client.discharge(controller, txn, false),
        Err(EngineError::InvalidOperation(_))
    ));
    coordinated
        .net
        .client
        .declare(controller, Some(txn))
        .expect("declare existing");
    assert!(matches!(
        coordinated.net.client.declare(controller, Some(txn)),
        Err(EngineError::InvalidOperation(_))
    ));
}

#[rstest]
fn manager_answers_only_pending_requests(mut coordinated: Coordinated) {
    coordinated.declare().expect("declare");
    let requested = coordinated.last_request().expect("declare request");
    assert!(matches!(
        coordinated.net.server.manager_discharged(coordinated.manager, requested),
        Err(EngineError::InvalidOperation(_))
    ));
}

#[rstest]
fn transactions_stay_with_their_controller(mut coordinated: Coordinated) {
    let (other, _) = coordinated.attach_controller("txn-ctl-2", 10).expect("second link");
    let controller = coordinated.controller;
    let txn = coordinated.declared(b"txn-a").expect("declared");
    let idle = coordinated.net.client.new_transaction(controller).expect("transaction");

    assert!(matches!(
        coordinated.net.client.declare(other, Some(idle)),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        coordinated.net.client.discharge(other, txn, false),
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(coordinated.client_state(idle), Some(TxnState::Idle));
    assert_eq!(coordinated.client_state(txn), Some(TxnState::Declared));
}

#[rstest]
fn only_the_receiving_manager_may_answer(mut coordinated: Coordinated) {
    let (_, other) = coordinated.attach_controller("txn-ctl-2", 10).expect("second link");
    let txn = coordinated.declare().expect("declare");
    let requested = coordinated.last_request().expect("declare request");
    assert!(matches!(
        coordinated.net.server.manager_declared(other, requested, Bytes::from_static(b"x")),
        Err(EngineError::InvalidArgument(_))
    ));
    coordinated
        .net
        .server
        .manager_declared(coordinated.manager, requested, Bytes::from_static(b"txn-b"))
        .expect("declared");
    coordinated.net.pump().expect("pump");

    coordinated
        .net
        .client
        .discharge(coordinated.controller, txn, false)
        .expect("discharge");
    coordinated.net.pump().expect("pump");
    let discharging = coordinated.last_request().expect("discharge request");
    assert!(matches!(
        coordinated.net.server.manager_discharged(other, discharging),
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(coordinated.server_state(discharging), Some(TxnState::Discharging));
}

#[test]
fn declare_needs_credit_and_capacity_handlers_wait_for_it() {
    let mut coordinated = Coordinated::new(0).expect("coordinator link");
    let controller = coordinated.controller;
    assert!(matches!(
        coordinated.net.client.declare(controller, None),
        Err(EngineError::InvalidOperation(_))
    ));

    let declared = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&declared);
    coordinated
        .net
        .client
        .add_capacity_available_handler(controller, move |engine, id| {
            if let Ok(txn) = engine.declare(id, None) {
                sink.borrow_mut().push(txn);
            }
        })
        .expect("handler queued");
    let pending =
        |engine: &Engine| engine.controller(controller).map(|c| c.pending_capacity_handlers());
    assert_eq!(pending(&coordinated.net.client), Some(1));

    let link = coordinated
        .net
        .server
        .manager(coordinated.manager)
        .expect("manager")
        .link();
    coordinated.net.server.add_credit(link, 1).expect("credit");
    coordinated.net.pump().expect("pump");

    assert_eq!(declared.borrow().len(), 1);
    assert_eq!(pending(&coordinated.net.client), Some(0));
    assert_eq!(coordinated.requests.borrow().len(), 1);
}

/// An engine whose peer has attached a controller; the engine opens the
/// manager and grants it one credit.
fn manager_side() -> (Engine, ScriptedPeer, ManagerId) {
    let mut engine = Engine::default();
    let mut peer = ScriptedPeer::default();
    engine.start().expect("start");
    engine.open_connection().expect("open");
    peer.handshake(&mut engine).expect("peer open");

    let managers = Rc::new(RefCell::new(Vec::new()));
    let found = Rc::clone(&managers);
    engine.set_handler(
        Endpoint::Connection,
        EventKind::RemoteSessionOpened,
        move |eng, event| {
            let Event::RemoteSessionOpened(session) = event else {
                return Ok(());
            };
            eng.open_session(*session)?;
            let sink = Rc::clone(&found);
            eng.set_handler(
                Endpoint::Session(*session),
                EventKind::RemoteManagerOpened,
                move |inner, opened| {
                    if let Event::RemoteManagerOpened(_, manager) = opened {
                        sink.borrow_mut().push(*manager);
                        inner.open_manager(*manager)?;
                        if let Some(receiver) = inner.manager(*manager).map(|m| m.link()) {
                            inner.add_credit(receiver, 1)?;
                        }
                    }
                    Ok(())
                },
            );
            Ok(())
        },
    );
    peer.send(&mut engine, 0, &frames::begin(None)).expect("begin");
    peer.send(&mut engine, 0, &frames::attach_controller("ctl", 0))
        .expect("controller attach");
    peer.receive(&mut engine).expect("attach answer");
    let manager = *managers.borrow().first().expect("manager created");
    (engine, peer, manager)
}

#[test]
fn manager_rejects_discharge_of_unknown_transaction() {
    let (mut engine, mut peer, _) = manager_side();
    let message = ControlMessage::Discharge(Discharge {
        txn_id: Bytes::from_static(b"never-declared"),
        fail: false,
    });
    peer.send_transfer(&mut engine, 0, frames::transfer(0, 0, b"d0"), &message.encode())
        .expect("discharge transfer");

    let out = peer.performatives(&mut engine).expect("engine output");
    let rejected = out.iter().find_map(|p| match p {
        Performative::Disposition(d) if d.role == Role::Receiver => Some(d),
        _ => None,
    });
    let Some(disposition) = rejected else {
        panic!("expected a disposition, got {out:?}");
    };
    assert!(disposition.settled);
    let Some(DeliveryState::Rejected(Some(error))) = &disposition.state else {
        panic!("expected a rejection, got {:?}", disposition.state);
    };
    assert_eq!(error.condition.as_str(), condition::TRANSACTION_UNKNOWN_ID);
}

#[test]
fn aborted_declare_leaves_no_transaction() {
    let (mut engine, peer, manager) = manager_side();
    let requests = test_util::coordinator::record(
        &mut engine,
        Endpoint::Manager(manager),
        &[EventKind::DeclareRequested],
    );
    let message = ControlMessage::Declare(Declare::default()).encode();
    let mut first = frames::transfer(0, 0, b"d0");
    first.flags.insert(TransferFlags::MORE);
    peer.send_transfer(&mut engine, 0, first, message.get(..2).unwrap_or_default())
        .expect("first frame");
    let abort = Transfer {
        handle: 0,
        flags: TransferFlags::ABORTED,
        ..Transfer::default()
    };
    peer.send_transfer(&mut engine, 0, abort, b"").expect("abort");

    assert!(requests.borrow().is_empty());
    let state = engine.manager(manager).expect("manager");
    assert!(state.transactions().is_empty());
}
