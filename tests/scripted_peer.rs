//! Engine behaviour against a hand-driven peer.

use std::{cell::RefCell, rc::Rc};

use amqp_engine::{
    DeliveryKey,
    Endpoint,
    Engine,
    EngineConfig,
    EngineError,
    EngineFailure,
    EventKind,
    LinkId,
    LinkState,
    SessionId,
    codec::{
        DeliveryState,
        Performative,
        RawFrame,
        Role,
        Transfer,
        TransferFlags,
        Value,
        condition,
        frame::FRAME_TYPE_AMQP,
    },
    preamble::AMQP_HEADER,
};
use bytes::Bytes;
use rstest::{fixture, rstest};
use test_util::{
    Received,
    ScriptedPeer,
    frames::{self, WIDE_WINDOW},
};

struct Connected {
    engine: Engine,
    peer: ScriptedPeer,
    session: SessionId,
}

impl Connected {
    fn new(config: EngineConfig, peer_handle_max: u32) -> Self {
        let mut engine = Engine::new(config);
        let mut peer = ScriptedPeer::default();
        engine.start().expect("start");
        engine.open_connection().expect("open");
        let session = engine.new_session().expect("session");
        engine.open_session(session).expect("begin");
        peer.handshake(&mut engine).expect("peer open");
        peer.send(
            &mut engine,
            0,
            &frames::begin_with(Some(0), WIDE_WINDOW, peer_handle_max),
        )
        .expect("peer begin");
        peer.receive(&mut engine).expect("initial output");
        Self {
            engine,
            peer,
            session,
        }
    }

    fn sender(&mut self, name: &str, peer_handle: u32, credit: u32) -> LinkId {
        let link = self.engine.new_sender(self.session, name).expect("sender");
        self.engine.open_link(link).expect("attach");
        self.peer
            .send(&mut self.engine, 0, &frames::attach(name, peer_handle, Role::Receiver))
            .expect("peer attach");
        self.peer
            .send(&mut self.engine, 0, &frames::credit(peer_handle, 0, credit))
            .expect("peer credit");
        self.peer.receive(&mut self.engine).expect("attach output");
        link
    }

    fn receiver(&mut self, name: &str, peer_handle: u32, credit: u32) -> LinkId {
        let link = self.engine.new_receiver(self.session, name).expect("receiver");
        self.engine.open_link(link).expect("attach");
        self.peer
            .send(&mut self.engine, 0, &frames::attach(name, peer_handle, Role::Sender))
            .expect("peer attach");
        self.engine.add_credit(link, credit).expect("credit");
        self.peer.receive(&mut self.engine).expect("attach output");
        link
    }

    fn performatives(&mut self) -> Vec<Performative> {
        self.peer.performatives(&mut self.engine).expect("engine output")
    }
}

#[fixture]
fn connected() -> Connected { Connected::new(EngineConfig::default(), u32::MAX) }

fn record_deliveries(
    engine: &mut Engine,
    link: LinkId,
    kind: EventKind,
) -> Rc<RefCell<Vec<DeliveryKey>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    engine.set_handler(Endpoint::Link(link), kind, move |_, event| {
        if let Some(key) = event.delivery() {
            sink.borrow_mut().push(key);
        }
        Ok(())
    });
    seen
}

fn end_error(performatives: &[Performative]) -> Option<String> {
    performatives.iter().find_map(|p| match p {
        Performative::End(end) => end.error.as_ref().map(|e| e.condition.as_str().to_owned()),
        _ => None,
    })
}

#[test]
fn open_without_container_id_is_a_decode_error() {
    let mut engine = Engine::default();
    let mut peer = ScriptedPeer::default();
    engine.start().expect("start");

    let empty_open = RawFrame {
        channel: 0,
        frame_type: FRAME_TYPE_AMQP,
        body: Value::described(0x10, Value::List(Vec::new())).to_bytes(),
    };
    let mut bytes = AMQP_HEADER.to_vec();
    bytes.extend_from_slice(&empty_open.to_bytes());
    let err = engine.ingest(&bytes).expect_err("empty open must fail");
    assert!(matches!(err, EngineError::Failed(EngineFailure::Decode(_))));

    let out = peer.performatives(&mut engine).expect("engine output");
    let Some(Performative::Close(close)) = out.last() else {
        panic!("expected a close, got {out:?}");
    };
    let error = close.error.as_ref().expect("close carries an error");
    assert_eq!(error.condition.as_str(), condition::DECODE_ERROR);
    assert_eq!(
        error.description.as_deref(),
        Some("The container-id field cannot be omitted from the Open")
    );
    assert!(matches!(out.first(), Some(Performative::Open(_))));
}

#[test]
fn sasl_header_is_answered_and_refused() {
    let mut engine = Engine::default();
    let mut peer = ScriptedPeer::default();
    engine.start().expect("start");
    let err = engine.ingest(b"AMQP\x03\x01\x00\x00").expect_err("sasl refused");
    assert!(matches!(
        err,
        EngineError::Failed(EngineFailure::MalformedHeader(_))
    ));
    let out = peer.receive(&mut engine).expect("engine output");
    assert_eq!(out, vec![Received::Header(AMQP_HEADER)]);
}

#[test]
fn frame_before_open_is_a_framing_error() {
    let mut engine = Engine::default();
    let peer = ScriptedPeer::default();
    engine.start().expect("start");
    engine.ingest(&AMQP_HEADER).expect("header");
    let err = peer
        .send(&mut engine, 0, &frames::begin(None))
        .expect_err("begin before open");
    let EngineError::Failed(EngineFailure::Protocol(error)) = &err else {
        panic!("expected a protocol failure, got {err:?}");
    };
    assert_eq!(error.condition.as_str(), condition::FRAMING_ERROR);
}

#[test]
fn incoming_window_is_capacity_over_frame_size() {
    let config = EngineConfig {
        max_frame_size: 1024,
        session_incoming_capacity: 1024,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);
    let mut peer = ScriptedPeer::default();
    engine.start().expect("start");
    engine.open_connection().expect("open");
    let session = engine.new_session().expect("session");
    engine.open_session(session).expect("begin");

    let out = peer.performatives(&mut engine).expect("engine output");
    let begin = out.iter().find_map(|p| match p {
        Performative::Begin(begin) => Some(begin),
        _ => None,
    });
    assert_eq!(begin.map(|b| b.incoming_window), Some(1));
    assert_eq!(engine.session(session).map(|s| s.incoming_window()), Some(1));
}

#[test]
fn handle_max_zero_leaves_room_for_one_link() {
    let mut c = Connected::new(EngineConfig::default(), 0);
    let first = c.engine.new_sender(c.session, "first").expect("sender");
    let second = c.engine.new_sender(c.session, "second").expect("sender");
    c.engine.open_link(first).expect("handle 0 is free");
    assert_eq!(c.engine.link(first).and_then(|l| l.handle()), Some(0));
    assert!(matches!(
        c.engine.open_link(second),
        Err(EngineError::InvalidOperation(_))
    ));
}

#[test]
fn remote_attach_past_handle_max_is_a_framing_error() {
    let config = EngineConfig {
        handle_max: 0,
        ..EngineConfig::default()
    };
    let mut c = Connected::new(config, u32::MAX);
    let err = c
        .peer
        .send(&mut c.engine, 0, &frames::attach("late", 1, Role::Sender))
        .expect_err("attach past handle-max");
    assert!(matches!(err, EngineError::Failed(EngineFailure::Protocol(_))));

    let out = c.performatives();
    let Some(Performative::Close(close)) = out.last() else {
        panic!("expected a close, got {out:?}");
    };
    let error = close.error.as_ref().expect("close carries an error");
    assert_eq!(error.condition.as_str(), condition::FRAMING_ERROR);
    assert!(!c.engine.is_writable());
}

#[rstest]
fn credit_stays_visible_after_remote_detach(mut connected: Connected) {
    let link = connected.sender("out", 0, 10);
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(10));
    connected
        .peer
        .send(&mut connected.engine, 0, &frames::detach(0, true))
        .expect("peer detach");
    let state = connected.engine.link(link).expect("link");
    assert_eq!(state.remote_state(), LinkState::Closed);
    assert_eq!(state.credit(), 10);
}

#[rstest]
fn local_close_clears_credit(mut connected: Connected) {
    let link = connected.sender("out", 0, 10);
    connected.engine.close_link(link, None).expect("close");
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(0));
}

#[rstest]
fn teardown_is_idempotent(mut connected: Connected) {
    let link = connected.sender("out", 0, 1);
    let session = connected.session;
    for _ in 0..2 {
        connected.engine.close_link(link, None).expect("close link");
        connected.engine.close_session(session, None).expect("close session");
        connected.engine.close_connection(None).expect("close connection");
    }
    let out = connected.performatives();
    let count = |pred: fn(&Performative) -> bool| out.iter().filter(|p| pred(p)).count();
    assert_eq!(count(|p| matches!(p, Performative::Detach(_))), 1);
    assert_eq!(count(|p| matches!(p, Performative::End(_))), 1);
    assert_eq!(count(|p| matches!(p, Performative::Close(_))), 1);
}

#[rstest]
fn transfer_on_unattached_handle_ends_the_session(mut connected: Connected) {
    connected
        .peer
        .send_transfer(&mut connected.engine, 0, frames::transfer(7, 0, b"t"), b"x")
        .expect("session-level error");
    let out = connected.performatives();
    assert_eq!(end_error(&out).as_deref(), Some(condition::UNATTACHED_HANDLE));
    assert!(connected.engine.is_writable());
}

#[rstest]
fn attach_on_handle_in_use_ends_the_session(mut connected: Connected) {
    connected
        .peer
        .send(&mut connected.engine, 0, &frames::attach("a", 0, Role::Sender))
        .expect("first attach");
    connected
        .peer
        .send(&mut connected.engine, 0, &frames::attach("b", 0, Role::Sender))
        .expect("second attach");
    let out = connected.performatives();
    assert_eq!(end_error(&out).as_deref(), Some(condition::HANDLE_IN_USE));
}

#[rstest]
fn incoming_delivery_is_read_then_accepted(mut connected: Connected) {
    let link = connected.receiver("in", 0, 10);
    let reads = record_deliveries(&mut connected.engine, link, EventKind::DeliveryRead);

    let mut first = frames::transfer(0, 0, b"t0");
    first.flags.insert(TransferFlags::MORE);
    connected
        .peer
        .send_transfer(&mut connected.engine, 0, first, b"hello ")
        .expect("first frame");
    let key = *reads.borrow().first().expect("read event");
    assert!(connected.engine.delivery(key).is_some_and(|d| d.is_partial()));

    let rest = amqp_engine::codec::Transfer {
        handle: 0,
        ..Default::default()
    };
    connected
        .peer
        .send_transfer(&mut connected.engine, 0, rest, b"world")
        .expect("last frame");
    assert_eq!(reads.borrow().len(), 2);
    let delivery = connected.engine.delivery(key).expect("delivery");
    assert!(!delivery.is_partial());
    assert_eq!(delivery.tag().map(Bytes::as_ref), Some(b"t0".as_slice()));
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(9));

    let body = connected.engine.read(key).expect("read");
    assert_eq!(body.as_ref(), b"hello world");
    connected
        .engine
        .disposition(key, Some(DeliveryState::Accepted), true)
        .expect("accept");
    let out = connected.performatives();
    let disposition = out
        .iter()
        .find_map(|p| match p {
            Performative::Disposition(d) => Some(d),
            _ => None,
        })
        .expect("disposition sent");
    assert_eq!(disposition.role, Role::Receiver);
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert_eq!(disposition.state, Some(DeliveryState::Accepted));
    assert!(connected.engine.delivery(key).is_none());
}

#[rstest]
fn aborted_delivery_is_reported_and_discarded(mut connected: Connected) {
    let link = connected.receiver("in", 0, 10);
    let aborted = record_deliveries(&mut connected.engine, link, EventKind::DeliveryAborted);

    let mut first = frames::transfer(0, 0, b"t0");
    first.flags.insert(TransferFlags::MORE);
    connected
        .peer
        .send_transfer(&mut connected.engine, 0, first, b"partial")
        .expect("first frame");
    let abort = amqp_engine::codec::Transfer {
        handle: 0,
        flags: TransferFlags::ABORTED,
        ..Default::default()
    };
    connected
        .peer
        .send_transfer(&mut connected.engine, 0, abort, b"")
        .expect("abort");
    assert_eq!(aborted.borrow().len(), 1);
    let session = connected.engine.session(connected.session).expect("session");
    assert_eq!(session.incoming_bytes(), 0);
}

#[rstest]
fn outgoing_delivery_sees_the_remote_outcome(mut connected: Connected) {
    let link = connected.sender("out", 0, 5);
    let updates = record_deliveries(&mut connected.engine, link, EventKind::DeliveryStateUpdated);
    let key = connected.engine.new_delivery(link).expect("delivery");
    connected.engine.write(key, "payload", true).expect("write");

    let out = connected.peer.receive(&mut connected.engine).expect("engine output");
    let payload = out.iter().find_map(|r| match r {
        Received::Frame {
            performative: Performative::Transfer(t),
            payload,
            ..
        } if t.delivery_id == Some(0) => Some(payload.clone()),
        _ => None,
    });
    assert_eq!(payload.as_deref(), Some(b"payload".as_slice()));
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(4));

    connected
        .peer
        .send(
            &mut connected.engine,
            0,
            &frames::disposition(Role::Receiver, 0, 0, true, Some(DeliveryState::Accepted)),
        )
        .expect("peer disposition");
    assert_eq!(updates.borrow().as_slice(), &[key]);
    let delivery = connected.engine.delivery(key).expect("delivery");
    assert!(delivery.is_remotely_settled());
    assert_eq!(delivery.remote_state(), Some(&DeliveryState::Accepted));

    connected.engine.settle(key).expect("settle");
    assert!(connected.engine.delivery(key).is_none());
}

#[rstest]
fn writes_without_credit_wait_for_it(mut connected: Connected) {
    let link = connected.sender("out", 0, 0);
    let key = connected.engine.new_delivery(link).expect("delivery");
    connected.engine.write(key, "queued", true).expect("write queues");
    assert!(!connected.engine.is_sendable(link));
    let before = connected.performatives();
    assert!(!before.iter().any(|p| matches!(p, Performative::Transfer(_))));

    connected
        .peer
        .send(&mut connected.engine, 0, &frames::credit(0, 0, 1))
        .expect("credit");
    let after = connected.performatives();
    assert!(after.iter().any(|p| matches!(p, Performative::Transfer(_))));
}

fn transfer_frames(connected: &mut Connected) -> Vec<(Transfer, usize)> {
    connected
        .peer
        .receive(&mut connected.engine)
        .expect("engine output")
        .into_iter()
        .filter_map(|received| match received {
            Received::Frame {
                performative: Performative::Transfer(transfer),
                payload,
                ..
            } => Some((transfer, payload.len())),
            _ => None,
        })
        .collect()
}

#[rstest]
fn stale_flow_grants_no_extra_credit(mut connected: Connected) {
    let link = connected.sender("out", 0, 2);
    for body in ["one", "two"] {
        let key = connected.engine.new_delivery(link).expect("delivery");
        connected.engine.write(key, body, true).expect("write");
    }
    assert_eq!(transfer_frames(&mut connected).len(), 2);
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(0));

    connected
        .peer
        .send(&mut connected.engine, 0, &frames::credit(0, 0, 1))
        .expect("flow from before the transfers");
    assert_eq!(connected.engine.link(link).map(|l| l.credit()), Some(0));
    assert!(!connected.engine.is_sendable(link));
}

#[test]
fn closed_remote_window_holds_the_rest_of_a_delivery() {
    let config = EngineConfig {
        max_frame_size: 512,
        ..EngineConfig::default()
    };
    let mut c = Connected::new(config, u32::MAX);
    let link = c.engine.new_sender(c.session, "out").expect("sender");
    c.engine.open_link(link).expect("attach");
    c.peer
        .send(&mut c.engine, 0, &frames::attach("out", 0, Role::Receiver))
        .expect("peer attach");
    c.peer
        .send(&mut c.engine, 0, &frames::window(0, 1, 0, 1))
        .expect("one-frame window");
    c.peer.receive(&mut c.engine).expect("attach output");

    let key = c.engine.new_delivery(link).expect("delivery");
    c.engine.write(key, vec![7_u8; 3000], true).expect("write");
    let first = transfer_frames(&mut c);
    let [(head, head_len)] = first.as_slice() else {
        panic!("expected one transfer inside the window, got {first:?}");
    };
    assert!(head.flags.contains(TransferFlags::MORE));
    assert!(!c.engine.is_sendable(link));

    c.peer
        .send(&mut c.engine, 0, &frames::window(0, 0, 1, 100))
        .expect("window reopened");
    let rest = transfer_frames(&mut c);
    assert!(rest.len() > 1, "expected continuation frames, got {rest:?}");
    assert!(rest.iter().all(|(t, _)| t.delivery_id == head.delivery_id));
    let (tail, _) = rest.last().expect("final frame");
    assert!(!tail.flags.contains(TransferFlags::MORE));
    let sent: usize = rest.iter().map(|(_, len)| len).sum();
    assert_eq!(sent.saturating_add(*head_len), 3000);
    assert_eq!(c.engine.delivery(key).map(|d| d.transferred()), Some(3000));
}

#[rstest]
fn sender_answers_a_drain_by_spending_credit(mut connected: Connected) {
    let link = connected.sender("out", 0, 0);
    let mut drain = frames::credit(0, 0, 3);
    if let Performative::Flow(flow) = &mut drain {
        flow.drain = true;
    }
    connected.peer.send(&mut connected.engine, 0, &drain).expect("drain");
    assert!(connected.engine.link(link).is_some_and(|l| l.is_draining()));

    assert!(connected.engine.sender_drained(link).expect("drained"));
    let out = connected.performatives();
    let flow = out
        .iter()
        .find_map(|p| match p {
            Performative::Flow(f) if f.handle.is_some() => Some(f),
            _ => None,
        })
        .expect("link flow");
    assert_eq!(flow.delivery_count, Some(3));
    assert_eq!(flow.link_credit, Some(0));
    assert!(!connected.engine.sender_drained(link).expect("nothing left"));
}

#[rstest]
fn receiver_drain_completes_when_the_peer_gives_up_credit(mut connected: Connected) {
    let link = connected.receiver("in", 0, 4);
    let updates = Rc::new(RefCell::new(0_u32));
    let counter = Rc::clone(&updates);
    connected
        .engine
        .set_handler(Endpoint::Link(link), EventKind::CreditStateUpdated, move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        });
    assert!(connected.engine.drain(link).expect("drain"));
    assert!(matches!(
        connected.engine.drain(link),
        Err(EngineError::InvalidOperation(_))
    ));
    connected.peer.receive(&mut connected.engine).expect("drain flow");

    connected
        .peer
        .send(&mut connected.engine, 0, &frames::credit(0, 4, 0))
        .expect("peer spent credit");
    assert_eq!(*updates.borrow(), 1);
    let state = connected.engine.link(link).expect("link");
    assert_eq!(state.credit(), 0);
    assert!(!state.is_draining());
}

#[rstest]
fn remote_end_then_local_close_frees_the_channel(mut connected: Connected) {
    let session = connected.session;
    connected
        .peer
        .send(&mut connected.engine, 0, &frames::end())
        .expect("peer end");
    connected.engine.close_session(session, None).expect("close");
    let next = connected.engine.new_session().expect("session");
    connected.engine.open_session(next).expect("reopen");
    assert_eq!(connected.engine.session(next).and_then(|s| s.channel()), Some(0));
}
