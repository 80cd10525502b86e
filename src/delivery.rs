//! Deliveries, their settlement state, and the unsettled map.

#![expect(clippy::big_endian_bytes, reason = "delivery tags are opaque network-order bytes")]

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::{
    codec::DeliveryState,
    endpoint::{DeliveryKey, LinkId, SessionId},
    sequence::{SequenceNo, in_range},
};

/// Which side of the link produced the delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer.
    Incoming,
    /// Sent to the peer.
    Outgoing,
}

/// One message transfer, possibly spanning several frames.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) link: LinkId,
    pub(crate) session: SessionId,
    pub(crate) direction: Direction,
    pub(crate) delivery_id: Option<SequenceNo>,
    pub(crate) tag: Option<Bytes>,
    pub(crate) message_format: u32,
    pub(crate) buffer: BytesMut,
    pub(crate) transferred: usize,
    pub(crate) partial: bool,
    pub(crate) aborted: bool,
    pub(crate) local_state: Option<DeliveryState>,
    pub(crate) local_settled: bool,
    pub(crate) remote_state: Option<DeliveryState>,
    pub(crate) remote_settled: bool,
}

impl Delivery {
    pub(crate) fn new(link: LinkId, session: SessionId, direction: Direction) -> Self {
        Self {
            link,
            session,
            direction,
            delivery_id: None,
            tag: None,
            message_format: 0,
            buffer: BytesMut::new(),
            transferred: 0,
            partial: true,
            aborted: false,
            local_state: None,
            local_settled: false,
            remote_state: None,
            remote_settled: false,
        }
    }

    /// Link the delivery travels on.
    #[must_use]
    pub const fn link(&self) -> LinkId { self.link }

    /// Incoming or outgoing.
    #[must_use]
    pub const fn direction(&self) -> Direction { self.direction }

    /// Wire delivery id, once the first transfer has been sent or received.
    #[must_use]
    pub const fn delivery_id(&self) -> Option<SequenceNo> { self.delivery_id }

    /// Delivery tag.
    #[must_use]
    pub const fn tag(&self) -> Option<&Bytes> { self.tag.as_ref() }

    /// Message format code.
    #[must_use]
    pub const fn message_format(&self) -> u32 { self.message_format }

    /// More frames are expected (incoming) or may still be written (outgoing).
    #[must_use]
    pub const fn is_partial(&self) -> bool { self.partial }

    /// The delivery was aborted.
    #[must_use]
    pub const fn is_aborted(&self) -> bool { self.aborted }

    /// Unread payload bytes of an incoming delivery.
    #[must_use]
    pub fn available(&self) -> usize { self.buffer.len() }

    /// Total payload bytes transferred so far.
    #[must_use]
    pub const fn transferred(&self) -> usize { self.transferred }

    /// State applied locally.
    #[must_use]
    pub const fn local_state(&self) -> Option<&DeliveryState> { self.local_state.as_ref() }

    /// Settled locally.
    #[must_use]
    pub const fn is_settled(&self) -> bool { self.local_settled }

    /// State reported by the peer.
    #[must_use]
    pub const fn remote_state(&self) -> Option<&DeliveryState> { self.remote_state.as_ref() }

    /// Settled by the peer.
    #[must_use]
    pub const fn is_remotely_settled(&self) -> bool { self.remote_settled }

    /// Both ends have settled; nothing more can happen to the delivery.
    pub(crate) const fn is_done(&self) -> bool { self.local_settled && self.remote_settled }
}

/// Deliveries awaiting settlement, ordered by wire delivery id.
///
/// Ids are assigned in increasing (wrapping) order, so appending keeps the
/// map sorted on the sequence circle. Lookups by range use wrap-aware
/// arithmetic; callers that mutate while walking use [`UnsettledMap::keys`]
/// to take a snapshot first.
#[derive(Debug, Default)]
pub struct UnsettledMap {
    entries: VecDeque<(SequenceNo, DeliveryKey)>,
}

impl UnsettledMap {
    /// Track `key` under `id`.
    pub fn insert(&mut self, id: SequenceNo, key: DeliveryKey) { self.entries.push_back((id, key)); }

    /// Stop tracking `id`.
    pub fn remove(&mut self, id: SequenceNo) -> Option<DeliveryKey> {
        let pos = self.entries.iter().position(|(entry, _)| *entry == id)?;
        self.entries.remove(pos).map(|(_, key)| key)
    }

    /// Delivery tracked under `id`.
    #[must_use]
    pub fn get(&self, id: SequenceNo) -> Option<DeliveryKey> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, key)| *key)
    }

    /// Deliveries with ids in `first..=last`, in id order.
    #[must_use]
    pub fn range(&self, first: SequenceNo, last: SequenceNo) -> Vec<DeliveryKey> {
        self.entries
            .iter()
            .filter(|(id, _)| in_range(first, last, *id))
            .map(|(_, key)| *key)
            .collect()
    }

    /// Snapshot of every tracked delivery, in id order.
    #[must_use]
    pub fn keys(&self) -> Vec<DeliveryKey> { self.entries.iter().map(|(_, key)| *key).collect() }

    /// Number of tracked deliveries.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// No deliveries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Drop every entry.
    pub fn clear(&mut self) { self.entries.clear(); }
}

/// Produces sequential delivery tags in the shortest big-endian form.
#[derive(Debug, Default)]
pub struct DeliveryTagGenerator {
    next: u64,
}

impl DeliveryTagGenerator {
    /// Next tag.
    pub fn next_tag(&mut self) -> Bytes {
        let value = self.next;
        self.next = self.next.wrapping_add(1);
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(bytes.len() - 1);
        Bytes::copy_from_slice(bytes.get(skip..).unwrap_or(&bytes))
    }
}
