//! Session outgoing capacity against a sink that completes writes late.

use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use amqp_engine::{
    Endpoint,
    Engine,
    EngineConfig,
    EventKind,
    LinkId,
    SessionId,
    WriteToken,
    codec::{DeliveryState, Performative, Role, Transfer, TransferFlags},
};
use bytes::Bytes;
use rstest::rstest;
use test_util::{Received, RecordingSink, ScriptedPeer, frames};

struct Sinked {
    engine: Engine,
    peer: ScriptedPeer,
    sink: RecordingSink,
    session: SessionId,
}

impl Sinked {
    fn new(capacity: u32) -> Self {
        let mut engine = Engine::new(EngineConfig {
            session_outgoing_capacity: capacity,
            ..EngineConfig::default()
        });
        let sink = RecordingSink::default();
        sink.hold_writes(true);
        engine.set_output_sink(sink.clone());
        let peer = ScriptedPeer::default();
        engine.start().expect("start");
        engine.open_connection().expect("open");
        let session = engine.new_session().expect("session");
        engine.open_session(session).expect("begin");
        peer.handshake(&mut engine).expect("peer open");
        peer.send(&mut engine, 0, &frames::begin(Some(0))).expect("peer begin");
        let mut sinked = Self {
            engine,
            peer,
            sink,
            session,
        };
        sinked.output();
        sinked
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
        self.output();
        link
    }

    fn receiver(&mut self, name: &str, peer_handle: u32, credit: u32) -> LinkId {
        let link = self.engine.new_receiver(self.session, name).expect("receiver");
        self.engine.open_link(link).expect("attach");
        self.peer
            .send(&mut self.engine, 0, &frames::attach(name, peer_handle, Role::Sender))
            .expect("peer attach");
        self.engine.add_credit(link, credit).expect("credit");
        self.output();
        link
    }

    /// Decode everything the sink holds, keeping the token of each write.
    fn output(&mut self) -> Vec<(WriteToken, Performative)> {
        let mut decoded = Vec::new();
        for (bytes, token) in self.sink.take() {
            for received in self.peer.decode(vec![bytes]).expect("decode") {
                if let Received::Frame { performative, .. } = received {
                    decoded.push((token, performative));
                }
            }
        }
        decoded
    }

    fn transfers(&mut self) -> Vec<(WriteToken, Transfer)> {
        self.output()
            .into_iter()
            .filter_map(|(token, performative)| match performative {
                Performative::Transfer(transfer) => Some((token, transfer)),
                _ => None,
            })
            .collect()
    }

    fn send(&mut self, link: LinkId, payload: &'static [u8]) {
        let key = self.engine.new_delivery(link).expect("delivery");
        self.engine
            .write(key, Bytes::from_static(payload), true)
            .expect("write");
    }
}

#[rstest]
fn pending_write_holds_capacity_until_completed() {
    let mut sinked = Sinked::new(10);
    let link = sinked.sender("out", 0, 5);
    sinked.send(link, b"0123456789");
    let sent = sinked.transfers();
    assert_eq!(sent.len(), 1);
    assert!(!sinked.engine.is_sendable(link));

    sinked.send(link, b"queued");
    assert!(sinked.transfers().is_empty());

    let (token, _) = sent.first().expect("first transfer");
    sinked.engine.write_completed(*token).expect("completed");
    let resumed = sinked.transfers();
    let [(_, transfer)] = resumed.as_slice() else {
        panic!("expected one resumed transfer, got {resumed:?}");
    };
    assert_eq!(transfer.delivery_id, Some(1));
}

#[rstest]
fn reopened_capacity_stops_notifying_once_saturated() {
    let mut sinked = Sinked::new(10);
    let first = sinked.sender("a", 0, 5);
    let second = sinked.sender("b", 1, 5);
    sinked.send(first, b"0123456789");
    let token = sinked
        .transfers()
        .first()
        .map(|(token, _)| *token)
        .expect("first transfer");

    let notified = Rc::new(RefCell::new(Vec::new()));
    for link in [first, second] {
        let seen = Rc::clone(&notified);
        sinked.engine.set_handler(
            Endpoint::Link(link),
            EventKind::CreditStateUpdated,
            move |engine, _| {
                seen.borrow_mut().push(link);
                let key = engine.new_delivery(link)?;
                engine.write(key, Bytes::from_static(b"9876543210"), true)
            },
        );
    }
    sinked.engine.write_completed(token).expect("completed");

    assert_eq!(*notified.borrow(), vec![first]);
    assert_eq!(sinked.transfers().len(), 1);
}

#[rstest]
fn shrinking_capacity_blocks_until_restored() {
    let mut sinked = Sinked::new(100);
    let link = sinked.sender("out", 0, 5);
    sinked.send(link, b"0123456789");
    assert_eq!(sinked.transfers().len(), 1);
    assert!(sinked.engine.is_sendable(link));

    let session = sinked.session;
    sinked
        .engine
        .set_session_outgoing_capacity(session, 5)
        .expect("shrink");
    assert!(!sinked.engine.is_sendable(link));
    sinked.send(link, b"queued");
    assert!(sinked.transfers().is_empty());

    sinked
        .engine
        .set_session_outgoing_capacity(session, 100)
        .expect("restore");
    assert_eq!(sinked.transfers().len(), 1);
    assert!(sinked.engine.is_sendable(link));
}

#[rstest]
fn disposition_applies_to_matching_deliveries_only() {
    let mut sinked = Sinked::new(100);
    let link = sinked.receiver("in", 0, 5);
    for (id, tag) in [(0, b"t0"), (1, b"t1"), (2, b"t2")] {
        sinked
            .peer
            .send_transfer(&mut sinked.engine, 0, frames::transfer(0, id, tag), b"body")
            .expect("transfer");
    }
    sinked.output();

    let skipped = Bytes::from_static(b"t1");
    let applied = sinked
        .engine
        .link_disposition_where(
            link,
            |delivery| delivery.tag() != Some(&skipped),
            Some(&DeliveryState::Accepted),
            true,
        )
        .expect("disposition");
    assert_eq!(applied, 2);

    let settled: BTreeSet<u32> = sinked
        .output()
        .into_iter()
        .filter_map(|(_, performative)| match performative {
            Performative::Disposition(d) if d.role == Role::Receiver && d.settled => {
                Some(d.first..=d.last.unwrap_or(d.first))
            }
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(settled, BTreeSet::from([0, 2]));
    let remaining = sinked.engine.link(link).expect("link").unsettled().len();
    assert_eq!(remaining, 1);
}

#[rstest]
fn aborting_a_started_delivery_sends_an_aborted_transfer() {
    let mut sinked = Sinked::new(100);
    let link = sinked.sender("out", 0, 5);
    let key = sinked.engine.new_delivery(link).expect("delivery");
    sinked
        .engine
        .write(key, Bytes::from_static(b"part"), false)
        .expect("partial write");
    let started = sinked.transfers();
    let [(_, first)] = started.as_slice() else {
        panic!("expected the first frame, got {started:?}");
    };
    assert!(first.flags.contains(TransferFlags::MORE));

    sinked.engine.abort_delivery(key).expect("abort");
    let ended = sinked.transfers();
    let [(_, aborted)] = ended.as_slice() else {
        panic!("expected an aborted transfer, got {ended:?}");
    };
    assert!(aborted.flags.contains(TransferFlags::ABORTED));
    assert_eq!(aborted.delivery_id, first.delivery_id);
    assert!(sinked.engine.delivery(key).is_none());
    assert!(sinked.engine.write(key, Bytes::from_static(b"late"), true).is_err());
}
