//! Inbound bytes: header check, framing, and per-performative handling.

use bytes::{Buf, Bytes};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use super::{Engine, Event, Queued};
use crate::{
    codec::{
        Attach, Begin, Close, DecodeError, Detach, Disposition, End, ErrorCondition, Flow, Open,
        Performative, Role, TargetKind, Transfer, condition,
    },
    delivery::{Delivery, Direction},
    endpoint::{DeliveryKey, Endpoint, EndpointState, LinkId, LinkState, ManagerId, SessionId},
    error::{EngineError, EngineFailure, Result},
    link::LinkOwner,
    preamble::{HEADER_LEN, parse_header},
    transaction::Manager,
};

impl Engine {
    /// Feed bytes received from the peer.
    ///
    /// # Errors
    /// Returns [`EngineError::NotStarted`] before [`Engine::start`],
    /// [`EngineError::Shutdown`] after shutdown, and [`EngineError::Failed`]
    /// once the engine has failed, including when these bytes fail it.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        self.run(|engine| engine.process_input(bytes))
    }

    fn process_input(&mut self, bytes: &[u8]) -> Result<()> {
        self.input.extend_from_slice(bytes);
        if !self.connection.header_received && !self.read_header()? {
            return Ok(());
        }
        while self.is_writable() {
            let frame = match self.codec.decode(&mut self.input) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    return Err(self.protocol_failure(condition::FRAMING_ERROR, err.to_string()));
                }
            };
            self.frames_read = self.frames_read.wrapping_add(1);
            if frame.is_heartbeat() {
                trace!(channel = frame.channel, "heartbeat in");
                continue;
            }
            let (performative, payload) = match frame.decode_body() {
                Ok(decoded) => decoded,
                Err(err) => return Err(self.decode_failure(err)),
            };
            trace!(
                channel = frame.channel,
                performative = performative.name(),
                payload = payload.len(),
                "frame in"
            );
            self.handle_performative(frame.channel, performative, payload)?;
        }
        Ok(())
    }

    /// Consume and check the protocol header. `Ok(false)` until all eight
    /// bytes have arrived.
    fn read_header(&mut self) -> Result<bool> {
        let Some(raw) = self.input.get(..HEADER_LEN) else {
            return Ok(false);
        };
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(raw);
        if let Err(err) = parse_header(&header) {
            // Tell the peer which protocol we speak before giving up.
            if let Err(write_err) = self.send_header() {
                debug!(error = %write_err, "could not answer malformed header");
            }
            return Err(self.failed(EngineFailure::MalformedHeader(err)));
        }
        self.input.advance(HEADER_LEN);
        self.connection.header_received = true;
        trace!("header in");
        self.send_header()?;
        Ok(true)
    }

    /// Close the connection with `condition` and fail with a protocol error.
    pub(crate) fn protocol_failure(
        &mut self,
        condition: &str,
        description: impl Into<String>,
    ) -> EngineError {
        let error = ErrorCondition::new(condition, description);
        self.close_on_failure(error.clone());
        self.failed(EngineFailure::Protocol(error))
    }

    fn decode_failure(&mut self, err: DecodeError) -> EngineError {
        self.close_on_failure(ErrorCondition::new(condition::DECODE_ERROR, err.to_string()));
        self.failed(EngineFailure::Decode(err))
    }

    /// Best-effort Close carrying `error`, preceded by Open if none was sent.
    pub(crate) fn close_on_failure(&mut self, error: ErrorCondition) {
        if self.connection.close_sent {
            return;
        }
        self.connection.local_state = EndpointState::Closed;
        self.connection.local_error = Some(error);
        if let Err(err) = self.write_failure_close() {
            debug!(error = %err, "close not written");
        }
    }

    fn write_failure_close(&mut self) -> Result<()> {
        self.send_header()?;
        if !self.connection.open_sent {
            self.connection.open_sent = true;
            let open = self.connection.open();
            self.send_frame(0, &Performative::Open(open), &[])?;
        }
        self.connection.close_sent = true;
        let close = Close {
            error: self.connection.local_error.clone(),
        };
        self.send_frame(0, &Performative::Close(close), &[])?;
        Ok(())
    }

    fn handle_performative(
        &mut self,
        channel: u16,
        performative: Performative,
        payload: Bytes,
    ) -> Result<()> {
        if self.connection.remote.is_none() && !matches!(performative, Performative::Open(_)) {
            return Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                format!("{} received before Open", performative.name()),
            ));
        }
        match performative {
            Performative::Open(open) => self.on_open(open),
            Performative::Begin(begin) => self.on_begin(channel, begin),
            Performative::Attach(attach) => self.on_attach(channel, attach),
            Performative::Flow(flow) => self.on_flow(channel, &flow),
            Performative::Transfer(transfer) => self.on_transfer(channel, &transfer, &payload),
            Performative::Disposition(disposition) => self.on_disposition(channel, &disposition),
            Performative::Detach(detach) => self.on_detach(channel, detach),
            Performative::End(end) => self.on_end(channel, end),
            Performative::Close(close) => {
                self.on_close(close);
                Ok(())
            }
        }
    }

    fn session_for_channel(&mut self, channel: u16) -> Result<SessionId> {
        match self.connection.remote_channels.get(&channel) {
            Some(session) => Ok(*session),
            None => Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                format!("frame received on unattached channel {channel}"),
            )),
        }
    }

    fn on_open(&mut self, open: Open) -> Result<()> {
        if self.connection.remote.is_some() {
            return Err(self.protocol_failure(condition::FRAMING_ERROR, "Open received twice"));
        }
        debug!(
            container_id = %open.container_id,
            max_frame_size = open.max_frame_size,
            channel_max = open.channel_max,
            "connection opened by peer"
        );
        self.idle.set_remote_timeout(open.idle_time_out.unwrap_or_default());
        self.connection.remote = Some(open);
        self.connection.remote_state = EndpointState::Active;
        self.push_event(Event::RemoteOpen(Endpoint::Connection));
        self.flush_pending()
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<()> {
        if self.connection.remote_channels.contains_key(&channel) {
            return Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                format!("Begin received on channel {channel} which is already in use"),
            ));
        }
        if channel > self.connection.channel_max {
            return Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                format!(
                    "channel {channel} exceeds channel-max {}",
                    self.connection.channel_max
                ),
            ));
        }
        let answered = begin.remote_channel;
        let session = match answered {
            Some(local) => match self
                .connection
                .local_channels
                .get(&local)
                .or_else(|| self.connection.zombie_channels.get(&local))
            {
                Some(session) => *session,
                None => {
                    return Err(self.protocol_failure(
                        condition::FRAMING_ERROR,
                        format!("Begin answers unknown channel {local}"),
                    ));
                }
            },
            None => self.create_session(),
        };
        if let Some(state) = self.sessions.get_mut(&session) {
            state.remote_begun(channel, begin);
        }
        self.connection.remote_channels.insert(channel, session);
        debug!(%session, channel, "session begun by peer");
        if answered.is_some() {
            self.push_event(Event::RemoteOpen(Endpoint::Session(session)));
        } else {
            self.push_event(Event::RemoteSessionOpened(session));
        }
        self.flush_pending()?;
        self.pump_writes(session)
    }

    fn on_attach(&mut self, channel: u16, attach: Box<Attach>) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        let Some(parent) = self.sessions.get(&session) else {
            return Ok(());
        };
        if attach.handle > parent.handle_max {
            let handle_max = parent.handle_max;
            return Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                format!("attach handle {} exceeds handle-max {handle_max}", attach.handle),
            ));
        }
        if parent.remote_handles.contains_key(&attach.handle) {
            let error = ErrorCondition::new(
                condition::HANDLE_IN_USE,
                format!("handle {} is already attached", attach.handle),
            );
            return self.end_session_with_error(session, error);
        }

        let role = attach.role.opposite();
        let existing = parent.links.iter().copied().find(|id| {
            self.links.get(id).is_some_and(|link| {
                link.role == role
                    && link.name == attach.name
                    && matches!(link.remote_state, LinkState::Idle)
            })
        });
        let handle = attach.handle;
        let link = match existing {
            Some(link) => {
                self.push_link_event(link, Event::RemoteOpen);
                link
            }
            None => self.create_remote_link(session, &attach, role),
        };
        if let Some(local) = self.links.get_mut(&link) {
            local.remote_attached(attach);
        }
        if let Some(owner) = self.sessions.get_mut(&session) {
            owner.remote_handles.insert(handle, link);
        }
        debug!(%session, %link, handle, "link attached by peer");
        self.flush_pending()?;
        self.pump_writes(session)
    }

    /// Create the local end of a link the peer initiated.
    fn create_remote_link(&mut self, session: SessionId, attach: &Attach, role: Role) -> LinkId {
        let wants_coordinator = matches!(role, Role::Receiver)
            && attach
                .target
                .as_ref()
                .is_some_and(TargetKind::is_coordinator);
        if wants_coordinator {
            let manager = ManagerId(self.alloc_id());
            let link = self.insert_link(
                session,
                attach.name.clone(),
                role,
                LinkOwner::Manager(manager),
            );
            if let Some(state) = self.links.get_mut(&link) {
                state.source.clone_from(&attach.source);
                state.target.clone_from(&attach.target);
            }
            self.managers.insert(manager, Manager::new(session, link));
            self.push_event(Event::RemoteManagerOpened(session, manager));
            return link;
        }
        let link = self.insert_link(session, attach.name.clone(), role, LinkOwner::Plain);
        let event = match role {
            Role::Sender => Event::RemoteSenderOpened(session, link),
            Role::Receiver => Event::RemoteReceiverOpened(session, link),
        };
        self.push_event(event);
        link
    }

    fn on_flow(&mut self, channel: u16, flow: &Flow) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        let Some(state) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        let was_sendable = state.outgoing.is_sendable();
        state.outgoing.remote_flow(flow);
        state.incoming.remote_outgoing_window = flow.outgoing_window;
        let reopened = !was_sendable && state.outgoing.is_sendable();
        if flow.echo && flow.handle.is_none() {
            state.flow_needed = true;
        }
        if let Some(handle) = flow.handle {
            let Some(link) = state.remote_handles.get(&handle).copied() else {
                let error = ErrorCondition::new(
                    condition::UNATTACHED_HANDLE,
                    format!("Flow for unattached handle {handle}"),
                );
                return self.end_session_with_error(session, error);
            };
            self.link_flow(link, flow);
        }
        self.pump_writes(session)?;
        if reopened {
            self.queue.push_back(Queued::NotifySenders(session));
        }
        self.flush_pending()
    }

    fn link_flow(&mut self, link: LinkId, flow: &Flow) {
        let Some(state) = self.links.get_mut(&link) else {
            return;
        };
        let drain_complete = state.remote_flow(flow);
        if flow.echo {
            state.flow_needed = true;
        }
        let is_sender = state.is_sender();
        let owner = state.owner;
        trace!(%link, credit = state.credit, drain = state.drain, "link flow");
        if is_sender || drain_complete {
            self.push_link_event(link, Event::CreditStateUpdated);
        }
        if let LinkOwner::Controller(controller) = owner {
            self.queue.push_back(Queued::ControllerCapacity(controller));
        }
    }

    fn on_transfer(&mut self, channel: u16, transfer: &Transfer, payload: &Bytes) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        let attached = self
            .sessions
            .get(&session)
            .and_then(|state| state.remote_handles.get(&transfer.handle).copied());
        let Some(link) = attached else {
            let error = ErrorCondition::new(
                condition::UNATTACHED_HANDLE,
                format!("Transfer on unattached handle {}", transfer.handle),
            );
            return self.end_session_with_error(session, error);
        };
        let Some((is_sender, owner, current)) = self
            .links
            .get(&link)
            .map(|state| (state.is_sender(), state.owner, state.current))
        else {
            return Ok(());
        };
        if is_sender {
            let error = ErrorCondition::new(
                condition::NOT_ALLOWED,
                format!("Transfer received on sending {link}"),
            );
            return self.end_session_with_error(session, error);
        }
        let key = match current {
            Some(key) => key,
            None => self.start_incoming_delivery(session, link, transfer)?,
        };
        if let Some(state) = self.sessions.get_mut(&session) {
            state.incoming.transfer_received(payload.len());
        }
        if transfer.flags.aborted() {
            return self.incoming_aborted(session, link, key, payload.len());
        }

        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        delivery.buffer.extend_from_slice(payload);
        delivery.transferred = delivery.transferred.saturating_add(payload.len());
        if let Some(state) = &transfer.state {
            delivery.remote_state = Some(state.clone());
        }
        if transfer.settled == Some(true) {
            delivery.remote_settled = true;
        }
        let complete = !transfer.flags.more();
        if complete {
            delivery.partial = false;
            if let Some(state) = self.links.get_mut(&link) {
                state.current = None;
            }
        }
        match owner {
            LinkOwner::Manager(manager) => {
                if complete {
                    self.manager_received(manager, key)?;
                    self.flush_pending()?;
                }
            }
            LinkOwner::Plain | LinkOwner::Controller(_) => {
                self.push_link_event(link, |endpoint| Event::DeliveryRead(endpoint, key));
            }
        }
        Ok(())
    }

    fn start_incoming_delivery(
        &mut self,
        session: SessionId,
        link: LinkId,
        transfer: &Transfer,
    ) -> Result<DeliveryKey> {
        let Some(delivery_id) = transfer.delivery_id else {
            return Err(self.protocol_failure(
                condition::FRAMING_ERROR,
                "first Transfer of a delivery carries no delivery-id",
            ));
        };
        let key = DeliveryKey(self.alloc_id());
        let mut delivery = Delivery::new(link, session, Direction::Incoming);
        delivery.delivery_id = Some(delivery_id);
        delivery.tag.clone_from(&transfer.delivery_tag);
        delivery.message_format = transfer.message_format.unwrap_or_default();
        self.deliveries.insert(key, delivery);
        if transfer.settled != Some(true)
            && let Some(state) = self.sessions.get_mut(&session)
        {
            state.incoming.unsettled.insert(delivery_id, key);
        }
        if let Some(state) = self.links.get_mut(&link) {
            state.incoming_delivery_started();
            state.unsettled.push(key);
            state.current = Some(key);
        }
        Ok(key)
    }

    /// Discard an aborted delivery's bytes and refund the window they held.
    fn incoming_aborted(
        &mut self,
        session: SessionId,
        link: LinkId,
        key: DeliveryKey,
        frame_bytes: usize,
    ) -> Result<()> {
        let mut discarded = frame_bytes;
        let mut delivery_id = None;
        if let Some(delivery) = self.deliveries.get_mut(&key) {
            discarded = discarded.saturating_add(delivery.buffer.len());
            delivery.buffer.clear();
            delivery.aborted = true;
            delivery.partial = false;
            delivery.local_settled = true;
            delivery.remote_settled = true;
            delivery_id = delivery.delivery_id;
        }
        let mut owner = LinkOwner::Plain;
        if let Some(state) = self.links.get_mut(&link) {
            state.current = None;
            owner = state.owner;
        }
        if let Some(state) = self.sessions.get_mut(&session) {
            if let Some(id) = delivery_id {
                state.incoming.unsettled.remove(id);
            }
            if state.incoming.bytes_released(discarded) {
                state.flow_needed = true;
            }
        }
        debug!(%link, delivery = %key, "delivery aborted by peer");
        if !matches!(owner, LinkOwner::Manager(_)) {
            self.push_link_event(link, |endpoint| Event::DeliveryAborted(endpoint, key));
        }
        self.flush_pending()
    }

    fn on_disposition(&mut self, channel: u16, disposition: &Disposition) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        let last = disposition.last.unwrap_or(disposition.first);
        let keys = match self.sessions.get(&session) {
            // A receiver reports on what we sent; a sender on what we received.
            Some(state) if matches!(disposition.role, Role::Receiver) => {
                state.outgoing.unsettled.range(disposition.first, last)
            }
            Some(state) => state.incoming.unsettled.range(disposition.first, last),
            None => return Ok(()),
        };
        for key in keys {
            self.remote_disposition(session, key, disposition)?;
        }
        Ok(())
    }

    fn remote_disposition(
        &mut self,
        session: SessionId,
        key: DeliveryKey,
        disposition: &Disposition,
    ) -> Result<()> {
        let Some(delivery) = self.deliveries.get_mut(&key) else {
            return Ok(());
        };
        if let Some(state) = &disposition.state {
            delivery.remote_state = Some(state.clone());
        }
        let link = delivery.link;
        if disposition.settled {
            delivery.remote_settled = true;
            let direction = delivery.direction;
            if let (Some(id), Some(state)) = (delivery.delivery_id, self.sessions.get_mut(&session)) {
                match direction {
                    Direction::Outgoing => state.outgoing.unsettled.remove(id),
                    Direction::Incoming => state.incoming.unsettled.remove(id),
                };
            }
        }
        match self.links.get(&link).map(|state| state.owner) {
            Some(LinkOwner::Controller(controller)) => self.controller_outcome(controller, key),
            _ => {
                self.push_link_event(link, |endpoint| Event::DeliveryStateUpdated(endpoint, key));
                Ok(())
            }
        }
    }

    fn on_detach(&mut self, channel: u16, detach: Detach) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        let attached = self
            .sessions
            .get_mut(&session)
            .and_then(|state| state.remote_handles.remove(&detach.handle));
        let Some(link) = attached else {
            let error = ErrorCondition::new(
                condition::UNATTACHED_HANDLE,
                format!("Detach for unattached handle {}", detach.handle),
            );
            return self.end_session_with_error(session, error);
        };
        if let Some(state) = self.links.get_mut(&link) {
            state.remote_state = if detach.closed {
                LinkState::Closed
            } else {
                LinkState::Detached
            };
            state.remote_error = detach.error;
        }
        debug!(%link, closed = detach.closed, "link detached by peer");
        if detach.closed {
            self.push_link_event(link, Event::RemoteClose);
        } else {
            self.push_link_event(link, Event::RemoteDetach);
        }
        self.release_link_if_closed(link);
        Ok(())
    }

    fn on_end(&mut self, channel: u16, end: End) -> Result<()> {
        let session = self.session_for_channel(channel)?;
        self.connection.remote_channels.remove(&channel);
        if let Some(state) = self.sessions.get_mut(&session) {
            state.remote_state = EndpointState::Closed;
            state.remote_error = end.error;
        }
        debug!(%session, channel, "session ended by peer");
        self.push_event(Event::RemoteClose(Endpoint::Session(session)));
        self.release_channel_if_closed(session);
        Ok(())
    }

    fn on_close(&mut self, close: Close) {
        match &close.error {
            Some(error) => warn!(%error, "connection closed by peer"),
            None => debug!("connection closed by peer"),
        }
        self.connection.remote_state = EndpointState::Closed;
        self.connection.remote_error = close.error;
        self.push_event(Event::RemoteClose(Endpoint::Connection));
    }
}
