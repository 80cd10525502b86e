//! Delivery creation, transfer framing, reading and settlement.
//!
//! A write that cannot go out immediately (no credit, no session capacity,
//! link not yet attached by the peer) is queued on its session and resumed
//! in order once the obstacle clears. Writes for one link never overtake
//! each other.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{debug, trace};

use super::Engine;
use crate::{
    codec::{
        DeliveryState, Disposition, Performative, RawFrame, Role, SenderSettleMode, Transfer,
        TransferFlags,
    },
    delivery::{Delivery, Direction},
    endpoint::{DeliveryKey, EndpointState, LinkId, LinkState, SessionId},
    error::{EngineError, Result},
    session::PendingWrite,
};

impl Engine {
    /// Start a new outgoing delivery on sender `link`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] on a receiver, a closed
    /// link, or while the previous delivery is still being written.
    pub fn new_delivery(&mut self, link: LinkId) -> Result<DeliveryKey> {
        self.ensure_usable()?;
        let state = self.link_ref(link)?;
        if !state.is_sender() {
            return Err(EngineError::invalid_op("only a sender creates deliveries"));
        }
        if state.local_state.is_terminal() {
            return Err(EngineError::invalid_op(format!("{link} is closed")));
        }
        if state.current.is_some() {
            return Err(EngineError::invalid_op(
                "the current delivery on this link is not complete",
            ));
        }
        let session = state.session;
        let key = DeliveryKey(self.alloc_id());
        self.deliveries
            .insert(key, Delivery::new(link, session, Direction::Outgoing));
        if let Some(sender) = self.links.get_mut(&link) {
            sender.unsettled.push(key);
            sender.current = Some(key);
        }
        Ok(key)
    }

    /// Use `tag` instead of the link's generated tag.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the first transfer of
    /// the delivery has been sent.
    pub fn set_delivery_tag(&mut self, key: DeliveryKey, tag: impl Into<Bytes>) -> Result<()> {
        let delivery = self.unsent_delivery(key, "tag")?;
        delivery.tag = Some(tag.into());
        Ok(())
    }

    /// Set the message format carried on the first transfer.
    ///
    /// # Errors
    /// As for [`Engine::set_delivery_tag`].
    pub fn set_message_format(&mut self, key: DeliveryKey, format: u32) -> Result<()> {
        let delivery = self.unsent_delivery(key, "message format")?;
        delivery.message_format = format;
        Ok(())
    }

    fn unsent_delivery(&mut self, key: DeliveryKey, what: &str) -> Result<&mut Delivery> {
        let delivery = self.delivery_mut(key)?;
        if matches!(delivery.direction, Direction::Incoming) || delivery.delivery_id.is_some() {
            return Err(EngineError::invalid_op(format!(
                "cannot change the {what} of a delivery already sent"
            )));
        }
        Ok(delivery)
    }

    /// Append `data` to an outgoing delivery; `complete` marks the last
    /// write. Bytes that cannot be sent yet are queued.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] for incoming, complete or
    /// aborted deliveries and closed links, and [`EngineError::Failed`] when
    /// the sink fails.
    pub fn write(
        &mut self,
        key: DeliveryKey,
        data: impl Into<Bytes>,
        complete: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        let delivery = self.delivery_ref(key)?;
        if matches!(delivery.direction, Direction::Incoming) {
            return Err(EngineError::invalid_op("cannot write to an incoming delivery"));
        }
        if delivery.aborted {
            return Err(EngineError::invalid_op("delivery was aborted"));
        }
        if !delivery.partial {
            return Err(EngineError::invalid_op("delivery is already complete"));
        }
        let link = delivery.link;
        if self.link_ref(link)?.local_state.is_terminal() {
            return Err(EngineError::invalid_op(format!("{link} is closed")));
        }
        let payload = data.into();
        self.run(|engine| engine.write_inner(key, payload, complete))
    }

    pub(crate) fn write_inner(
        &mut self,
        key: DeliveryKey,
        payload: Bytes,
        complete: bool,
    ) -> Result<()> {
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        let (link, session) = (delivery.link, delivery.session);
        let unsent = delivery.delivery_id.is_none();
        if complete {
            delivery.partial = false;
            if let Some(sender) = self.links.get_mut(&link)
                && sender.current == Some(key)
            {
                sender.current = None;
            }
        } else if payload.is_empty() {
            return Ok(());
        }
        let starts = unsent && !self.has_pending_write(session, key);
        let link_queued = self
            .sessions
            .get(&session)
            .is_some_and(|s| s.pending_writes.iter().any(|write| write.link == link));
        if !link_queued && self.can_transmit(session, link, starts) {
            return self.transmit(session, key, payload, complete);
        }
        if let Some(owner) = self.sessions.get_mut(&session) {
            owner.pending_writes.push_back(PendingWrite {
                link,
                delivery: key,
                payload,
                complete,
                starts_delivery: starts,
            });
        }
        if starts && let Some(sender) = self.links.get_mut(&link) {
            sender.queued_new = sender.queued_new.saturating_add(1);
        }
        Ok(())
    }

    /// `link` is attached, credited and its session can take more bytes.
    #[must_use]
    pub fn is_sendable(&self, link: LinkId) -> bool {
        self.links
            .get(&link)
            .is_some_and(|state| state.has_credit_to_send() && self.can_transmit(state.session, link, true))
    }

    fn can_transmit(&self, session: SessionId, link: LinkId, starts: bool) -> bool {
        if !self.is_writable() || self.connection.close_sent {
            return false;
        }
        let (Some(owner), Some(sender)) = (self.sessions.get(&session), self.links.get(&link)) else {
            return false;
        };
        let session_ready = owner.begin_sent
            && !owner.end_sent
            && !owner.parent_closed
            && matches!(owner.remote_state, EndpointState::Active)
            && owner.outgoing.is_sendable();
        let link_ready = sender.attach_sent
            && !sender.parent_closed
            && matches!(sender.local_state, LinkState::Active)
            && matches!(sender.remote_state, LinkState::Active);
        session_ready && link_ready && (!starts || sender.credit > 0)
    }

    pub(crate) fn has_pending_write(&self, session: SessionId, key: DeliveryKey) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|s| s.pending_writes.iter().any(|write| write.delivery == key))
    }

    /// Send queued writes that can go now, oldest first. A blocked link
    /// holds back only its own later writes.
    pub(crate) fn pump_writes(&mut self, session: SessionId) -> Result<()> {
        let mut blocked: Vec<LinkId> = Vec::new();
        let mut index = 0usize;
        loop {
            let Some(owner) = self.sessions.get(&session) else {
                return Ok(());
            };
            if !owner.outgoing.is_sendable() {
                return Ok(());
            }
            let Some(next) = owner.pending_writes.get(index) else {
                return Ok(());
            };
            let (link, starts) = (next.link, next.starts_delivery);
            if blocked.contains(&link) || !self.can_transmit(session, link, starts) {
                blocked.push(link);
                index = index.saturating_add(1);
                continue;
            }
            let Some(write) = self
                .sessions
                .get_mut(&session)
                .and_then(|s| s.pending_writes.remove(index))
            else {
                return Ok(());
            };
            if write.starts_delivery
                && let Some(sender) = self.links.get_mut(&link)
            {
                sender.queued_new = sender.queued_new.saturating_sub(1);
            }
            self.transmit(session, write.delivery, write.payload, write.complete)?;
        }
    }

    /// Frame `payload` into transfers no larger than the negotiated max
    /// frame size and hand them to the sink. Framing stops when the peer's
    /// incoming window closes; the rest waits at the head of the queue.
    fn transmit(
        &mut self,
        session: SessionId,
        key: DeliveryKey,
        payload: Bytes,
        complete: bool,
    ) -> Result<()> {
        let Some(channel) = self.sessions.get(&session).and_then(|s| s.local_channel) else {
            return Ok(());
        };
        let Some(link) = self.deliveries.get(&key).map(|d| d.link) else {
            return Ok(());
        };
        let Some((handle, presettle_mode)) = self.links.get(&link).and_then(|sender| {
            sender
                .local_handle
                .map(|h| (h, matches!(sender.snd_settle_mode, SenderSettleMode::Settled)))
        }) else {
            return Ok(());
        };
        if self.deliveries.get(&key).is_some_and(|d| d.delivery_id.is_none()) {
            self.start_outgoing_delivery(session, link, key, presettle_mode);
        }
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        let settled = presettle_mode || delivery.local_settled;
        let template = Transfer {
            handle,
            delivery_id: delivery.delivery_id,
            delivery_tag: delivery.tag.clone(),
            message_format: Some(delivery.message_format),
            settled: Some(settled),
            state: delivery.local_state.clone(),
            ..Transfer::default()
        };
        if complete && settled {
            delivery.local_settled = true;
            delivery.remote_settled = true;
            self.settled.push(key);
        }

        let mut probe = template.clone();
        probe.flags.insert(TransferFlags::MORE);
        let overhead = RawFrame::performative(channel, &Performative::Transfer(probe), &[])
            .to_bytes()
            .len();
        let max_frame = usize::try_from(self.connection.negotiated_max_frame_size()).unwrap_or(usize::MAX);
        let chunk = max_frame.saturating_sub(overhead).max(1);

        let mut remaining = payload;
        loop {
            let body = remaining.split_to(remaining.len().min(chunk));
            let last = remaining.is_empty();
            let mut transfer = template.clone();
            if !(last && complete) {
                transfer.flags.insert(TransferFlags::MORE);
            }
            self.send_transfer_frame(session, channel, &Performative::Transfer(transfer), &body)?;
            if let Some(sent) = self.deliveries.get_mut(&key) {
                sent.transferred = sent.transferred.saturating_add(body.len());
            }
            if last {
                return Ok(());
            }
            let window_closed = self
                .sessions
                .get(&session)
                .is_none_or(|s| s.outgoing.remote_incoming_window == 0);
            if window_closed {
                trace!(%link, delivery = %key, held = remaining.len(), "incoming window closed");
                if let Some(owner) = self.sessions.get_mut(&session) {
                    owner.pending_writes.push_front(PendingWrite {
                        link,
                        delivery: key,
                        payload: remaining,
                        complete,
                        starts_delivery: false,
                    });
                }
                return Ok(());
            }
        }
    }

    fn start_outgoing_delivery(
        &mut self,
        session: SessionId,
        link: LinkId,
        key: DeliveryKey,
        presettle_mode: bool,
    ) {
        let Some(id) = self
            .sessions
            .get_mut(&session)
            .map(|s| s.outgoing.allocate_delivery_id())
        else {
            return;
        };
        let Some(sender) = self.links.get_mut(&link) else {
            return;
        };
        sender.outgoing_delivery_started();
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return;
        };
        delivery.delivery_id = Some(id);
        if delivery.tag.is_none() {
            delivery.tag = Some(sender.next_tag());
        }
        let presettled = presettle_mode || delivery.local_settled;
        if !presettled && let Some(owner) = self.sessions.get_mut(&session) {
            owner.outgoing.unsettled.insert(id, key);
        }
    }

    /// Take the bytes received so far for an incoming delivery. Freed bytes
    /// widen the session's incoming window.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] for outgoing deliveries.
    pub fn read(&mut self, key: DeliveryKey) -> Result<Bytes> {
        self.ensure_usable()?;
        if matches!(self.delivery_ref(key)?.direction, Direction::Outgoing) {
            return Err(EngineError::invalid_op("cannot read an outgoing delivery"));
        }
        self.run(|engine| {
            let Some(delivery) = engine.deliveries.get_mut(&key) else {
                return Ok(Bytes::new());
            };
            let bytes = delivery.buffer.split().freeze();
            let session = delivery.session;
            if let Some(owner) = engine.sessions.get_mut(&session)
                && owner.incoming.bytes_released(bytes.len())
            {
                owner.flow_needed = true;
            }
            engine.flush_pending()?;
            Ok(bytes)
        })
    }

    /// Update the local state of `key` and optionally settle it.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] when the delivery is already
    /// settled locally.
    pub fn disposition(
        &mut self,
        key: DeliveryKey,
        state: Option<DeliveryState>,
        settle: bool,
    ) -> Result<()> {
        self.ensure_usable()?;
        if self.delivery_ref(key)?.local_settled {
            return Err(EngineError::invalid_op("delivery is already settled"));
        }
        self.run(|engine| engine.apply_disposition(key, state, settle))
    }

    /// Settle `key` keeping its current local state.
    ///
    /// # Errors
    /// As for [`Engine::disposition`].
    pub fn settle(&mut self, key: DeliveryKey) -> Result<()> { self.disposition(key, None, true) }

    pub(crate) fn apply_disposition(
        &mut self,
        key: DeliveryKey,
        state: Option<DeliveryState>,
        settle: bool,
    ) -> Result<()> {
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        if let Some(outcome) = state {
            delivery.local_state = Some(outcome);
        }
        if settle && !delivery.local_settled {
            delivery.local_settled = true;
            self.settled.push(key);
        }
        let session = delivery.session;
        let role = match delivery.direction {
            Direction::Incoming => Role::Receiver,
            Direction::Outgoing => Role::Sender,
        };
        let Some(id) = delivery.delivery_id else {
            return Ok(());
        };
        let frame = Disposition {
            role,
            first: id,
            last: None,
            settled: settle,
            state: delivery.local_state.clone(),
            batchable: false,
        };
        let remote_settled = delivery.remote_settled;
        let Some(owner) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if settle {
            match role {
                Role::Receiver => owner.incoming.unsettled.remove(id),
                Role::Sender => owner.outgoing.unsettled.remove(id),
            };
        }
        let Some(channel) = owner.local_channel else {
            return Ok(());
        };
        let sendable = owner.begin_sent
            && !owner.end_sent
            && !owner.parent_closed
            && !self.connection.close_sent
            && self.is_writable();
        if remote_settled || !sendable {
            return Ok(());
        }
        self.send_frame(channel, &Performative::Disposition(frame), &[])?;
        Ok(())
    }

    /// Apply `state` (and `settle`) to each unsettled delivery of `link`
    /// matching `predicate`. Returns how many were updated.
    ///
    /// Works over a snapshot, so settling inside the walk is safe.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown link and
    /// [`EngineError::Failed`] when the sink fails.
    pub fn link_disposition_where(
        &mut self,
        link: LinkId,
        mut predicate: impl FnMut(&Delivery) -> bool,
        state: Option<&DeliveryState>,
        settle: bool,
    ) -> Result<usize> {
        self.ensure_usable()?;
        let snapshot = self.link_ref(link)?.unsettled.clone();
        self.run(|engine| {
            let mut applied = 0usize;
            for key in snapshot {
                let selected = engine
                    .deliveries
                    .get(&key)
                    .is_some_and(|d| !d.local_settled && predicate(d));
                if selected {
                    engine.apply_disposition(key, state.cloned(), settle)?;
                    applied = applied.saturating_add(1);
                }
            }
            Ok(applied)
        })
    }

    /// Abandon an outgoing delivery that is still being written. A delivery
    /// already on the wire is ended with an aborted transfer.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] for incoming or complete
    /// deliveries.
    pub fn abort_delivery(&mut self, key: DeliveryKey) -> Result<()> {
        self.ensure_usable()?;
        let delivery = self.delivery_ref(key)?;
        if matches!(delivery.direction, Direction::Incoming) {
            return Err(EngineError::invalid_op("only the sender can abort a delivery"));
        }
        if !delivery.partial {
            return Err(EngineError::invalid_op("delivery is already complete"));
        }
        self.run(|engine| engine.abort_outgoing(key))
    }

    fn abort_outgoing(&mut self, key: DeliveryKey) -> Result<()> {
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        delivery.aborted = true;
        delivery.partial = false;
        delivery.local_settled = true;
        delivery.remote_settled = true;
        self.settled.push(key);
        let (link, session, delivery_id) = (delivery.link, delivery.session, delivery.delivery_id);

        let mut dropped_start = false;
        if let Some(owner) = self.sessions.get_mut(&session) {
            owner.pending_writes.retain(|write| {
                let keep = write.delivery != key;
                dropped_start |= !keep && write.starts_delivery;
                keep
            });
            if let Some(id) = delivery_id {
                owner.outgoing.unsettled.remove(id);
            }
        }
        let Some(sender) = self.links.get_mut(&link) else {
            return Ok(());
        };
        if dropped_start {
            sender.queued_new = sender.queued_new.saturating_sub(1);
        }
        if sender.current == Some(key) {
            sender.current = None;
        }
        debug!(%link, delivery = %key, "delivery aborted");
        let (Some(id), Some(handle)) = (delivery_id, sender.local_handle) else {
            return Ok(());
        };
        if !self.can_transmit(session, link, false) {
            return Ok(());
        }
        let Some(channel) = self.sessions.get(&session).and_then(|s| s.local_channel) else {
            return Ok(());
        };
        let transfer = Transfer {
            handle,
            delivery_id: Some(id),
            settled: Some(true),
            flags: TransferFlags::ABORTED,
            ..Transfer::default()
        };
        self.send_frame(channel, &Performative::Transfer(transfer), &[])?;
        Ok(())
    }

    /// Drop deliveries that are settled locally and fully written or read.
    pub(crate) fn purge_settled(&mut self) {
        if self.settled.is_empty() {
            return;
        }
        let queued: HashSet<DeliveryKey> = self
            .sessions
            .values()
            .flat_map(|s| s.pending_writes.iter().map(|write| write.delivery))
            .collect();
        let candidates = std::mem::take(&mut self.settled);
        for key in candidates {
            let Some(delivery) = self.deliveries.get(&key) else {
                continue;
            };
            if delivery.partial || queued.contains(&key) {
                self.settled.push(key);
                continue;
            }
            let Some(done) = self.deliveries.remove(&key) else {
                continue;
            };
            if let Some(state) = self.links.get_mut(&done.link) {
                state.forget_delivery(key);
            }
            if let (Some(id), Some(owner)) = (done.delivery_id, self.sessions.get_mut(&done.session)) {
                match done.direction {
                    Direction::Incoming => owner.incoming.unsettled.remove(id),
                    Direction::Outgoing => owner.outgoing.unsettled.remove(id),
                };
            }
        }
    }
}
