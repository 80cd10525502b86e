//! Local lifecycle of the connection, sessions and links, and the flush that
//! turns pending local state into frames.
//!
//! Closing a parent never emits frames for its children: a closed connection
//! sends no End, a closed session sends no Detach. Those children only see a
//! parent-closed event, and a later local close on them is a silent no-op
//! apart from clearing link credit.

use tracing::{debug, warn};

use super::Engine;
use crate::{
    codec::{Close, Detach, End, ErrorCondition, Performative, Role},
    endpoint::{Endpoint, EndpointState, LinkId, LinkState, SessionId},
    engine::Event,
    error::{EngineError, Result},
    link::{Link, LinkOwner},
    session::Session,
};

impl Engine {
    /// Open the connection locally. Idempotent.
    ///
    /// # Errors
    /// Fails when the engine is not running.
    pub fn open_connection(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.run(|engine| {
            if !matches!(engine.connection.local_state, EndpointState::Idle) {
                return Ok(());
            }
            engine.connection.local_state = EndpointState::Active;
            engine.idle.set_local_timeout(engine.connection.idle_timeout);
            engine.codec.set_max_frame_size(engine.connection.max_frame_size);
            debug!(container_id = %engine.connection.container_id, "connection opened");
            engine.push_event(Event::LocalOpen(Endpoint::Connection));
            engine.flush_pending()
        })
    }

    /// Close the connection locally, optionally carrying `error`.
    ///
    /// Every session is closed implicitly without End frames. Idempotent;
    /// after shutdown the call only records the local state.
    ///
    /// # Errors
    /// Returns [`EngineError::Failed`] once the engine has failed and has not
    /// been shut down.
    pub fn close_connection(&mut self, error: Option<ErrorCondition>) -> Result<()> {
        if !self.ensure_closable()? {
            self.connection.local_state = EndpointState::Closed;
            return Ok(());
        }
        self.run(|engine| {
            if matches!(engine.connection.local_state, EndpointState::Closed) {
                return Ok(());
            }
            engine.connection.local_state = EndpointState::Closed;
            engine.connection.local_error = error;
            debug!("connection closed");
            engine.push_event(Event::LocalClose(Endpoint::Connection));
            let sessions: Vec<SessionId> = engine.sessions.keys().copied().collect();
            for session in sessions {
                engine.parent_closed_session(session);
            }
            engine.flush_pending()
        })
    }

    /// Create a session configured from the engine defaults.
    ///
    /// # Errors
    /// Fails once the engine has failed or shut down.
    pub fn new_session(&mut self) -> Result<SessionId> {
        self.ensure_usable()?;
        Ok(self.create_session())
    }

    pub(crate) fn create_session(&mut self) -> SessionId {
        let id = SessionId(self.alloc_id());
        let mut session = Session::new(
            self.config.handle_max,
            self.config.session_incoming_capacity,
            self.config.session_outgoing_capacity,
        );
        session.incoming.max_frame_size = self.connection.max_frame_size;
        session.parent_closed = matches!(self.connection.local_state, EndpointState::Closed);
        self.sessions.insert(id, session);
        id
    }

    /// Open `session` on the lowest free channel. Idempotent.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] when the connection is closed
    /// or every channel up to channel-max is taken.
    pub fn open_session(&mut self, session: SessionId) -> Result<()> {
        self.ensure_running()?;
        let state = self.session_ref(session)?;
        if !matches!(state.local_state, EndpointState::Idle) {
            return Ok(());
        }
        if state.parent_closed {
            return Err(EngineError::invalid_op("cannot open a session on a closed connection"));
        }
        let Some(channel) = self.connection.allocate_channel() else {
            return Err(EngineError::invalid_op(format!(
                "no free channel up to channel-max {}",
                self.connection.channel_max
            )));
        };
        self.run(|engine| {
            engine.bind_channel(session, channel);
            if let Some(opened) = engine.sessions.get_mut(&session) {
                opened.local_state = EndpointState::Active;
            }
            debug!(%session, channel, "session opened");
            engine.push_event(Event::LocalOpen(Endpoint::Session(session)));
            engine.flush_pending()
        })
    }

    fn bind_channel(&mut self, session: SessionId, channel: u16) {
        self.connection.zombie_channels.remove(&channel);
        self.connection.local_channels.insert(channel, session);
        let max_frame_size = self.connection.max_frame_size;
        if let Some(state) = self.sessions.get_mut(&session) {
            state.local_channel = Some(channel);
            state.incoming.max_frame_size = max_frame_size;
        }
    }

    /// End `session` locally, optionally carrying `error`. Its links are
    /// detached implicitly. Idempotent.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session and
    /// [`EngineError::Failed`] once the engine has failed.
    pub fn close_session(
        &mut self,
        session: SessionId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.session_ref(session)?;
        if !self.ensure_closable()? {
            if let Some(state) = self.sessions.get_mut(&session) {
                state.local_state = EndpointState::Closed;
            }
            return Ok(());
        }
        self.run(|engine| engine.close_session_inner(session, error))
    }

    fn close_session_inner(
        &mut self,
        session: SessionId,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if matches!(state.local_state, EndpointState::Closed) {
            return Ok(());
        }
        let answer_remote = state.local_channel.is_none()
            && !state.parent_closed
            && matches!(state.remote_state, EndpointState::Active);
        state.local_state = EndpointState::Closed;
        state.local_error = error;
        let links = state.links.clone();
        // The peer began this session; it still needs a Begin before the End.
        if answer_remote && let Some(channel) = self.connection.allocate_channel() {
            self.bind_channel(session, channel);
        }
        debug!(%session, "session closed");
        self.push_event(Event::LocalClose(Endpoint::Session(session)));
        for link in links {
            self.parent_closed_link(link);
        }
        self.flush_pending()?;
        self.release_channel_if_closed(session);
        Ok(())
    }

    /// End `session` because the peer broke a session-level rule.
    pub(crate) fn end_session_with_error(
        &mut self,
        session: SessionId,
        error: ErrorCondition,
    ) -> Result<()> {
        warn!(%session, %error, "ending session");
        self.close_session_inner(session, Some(error))
    }

    /// Create a sending link named `name` on `session`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn new_sender(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId> {
        self.ensure_usable()?;
        self.session_ref(session)?;
        Ok(self.insert_link(session, name.into(), Role::Sender, LinkOwner::Plain))
    }

    /// Create a receiving link named `name` on `session`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn new_receiver(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId> {
        self.ensure_usable()?;
        self.session_ref(session)?;
        Ok(self.insert_link(session, name.into(), Role::Receiver, LinkOwner::Plain))
    }

    pub(crate) fn insert_link(
        &mut self,
        session: SessionId,
        name: String,
        role: Role,
        owner: LinkOwner,
    ) -> LinkId {
        let id = LinkId(self.alloc_id());
        let mut link = Link::new(session, name, role, owner);
        if let Some(state) = self.sessions.get_mut(&session) {
            link.parent_closed =
                state.parent_closed || matches!(state.local_state, EndpointState::Closed);
            state.links.push(id);
        }
        self.links.insert(id, link);
        id
    }

    /// Attach `link` on the lowest free handle. Idempotent.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] when the session is closed
    /// or no handle up to handle-max is free.
    pub fn open_link(&mut self, link: LinkId) -> Result<()> {
        self.ensure_running()?;
        let state = self.link_ref(link)?;
        if !matches!(state.local_state, LinkState::Idle) {
            return Ok(());
        }
        if state.parent_closed {
            return Err(EngineError::invalid_op("cannot open a link on a closed session"));
        }
        let session = state.session;
        let parent = self.session_ref(session)?;
        let Some(handle) = parent.free_handle() else {
            return Err(EngineError::invalid_op(format!(
                "{session} has no free handle up to handle-max {}",
                parent.handle_max
            )));
        };
        self.run(|engine| {
            if let Some(owner) = engine.sessions.get_mut(&session) {
                owner.local_handles.insert(handle, link);
            }
            if let Some(opened) = engine.links.get_mut(&link) {
                opened.local_handle = Some(handle);
                opened.local_state = LinkState::Active;
            }
            debug!(%link, handle, "link opened");
            engine.push_link_event(link, Event::LocalOpen);
            engine.flush_pending()
        })
    }

    /// Close `link`, ending its terminus.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown link and
    /// [`EngineError::Failed`] once the engine has failed.
    pub fn close_link(&mut self, link: LinkId, error: Option<ErrorCondition>) -> Result<()> {
        self.end_link(link, true, error)
    }

    /// Detach `link` without closing its terminus.
    ///
    /// # Errors
    /// As for [`Engine::close_link`].
    pub fn detach_link(&mut self, link: LinkId, error: Option<ErrorCondition>) -> Result<()> {
        self.end_link(link, false, error)
    }

    fn end_link(
        &mut self,
        link: LinkId,
        closed: bool,
        error: Option<ErrorCondition>,
    ) -> Result<()> {
        self.link_ref(link)?;
        let terminal = if closed {
            LinkState::Closed
        } else {
            LinkState::Detached
        };
        if !self.ensure_closable()? {
            if let Some(state) = self.links.get_mut(&link)
                && !state.local_state.is_terminal()
            {
                state.local_state = terminal;
                state.reset_credit();
            }
            return Ok(());
        }
        self.run(|engine| {
            let Some(state) = engine.links.get_mut(&link) else {
                return Ok(());
            };
            if state.local_state.is_terminal() {
                return Ok(());
            }
            state.local_state = terminal;
            state.local_error = error;
            state.reset_credit();
            let session = state.session;
            if let Some(parent) = engine.sessions.get_mut(&session) {
                parent.pending_writes.retain(|write| write.link != link);
            }
            debug!(%link, closed, "link detached");
            if closed {
                engine.push_link_event(link, Event::LocalClose);
            } else {
                engine.push_link_event(link, Event::LocalDetach);
            }
            engine.flush_pending()?;
            engine.release_link_if_closed(link);
            Ok(())
        })
    }

    /// Grant `credit` more deliveries to the peer's sender.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] on a sender or a closed
    /// link.
    pub fn add_credit(&mut self, link: LinkId, credit: u32) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_open_receiver(link)?;
        self.run(|engine| {
            if let Some(state) = engine.links.get_mut(&link) {
                state.add_credit(credit);
            }
            engine.flush_pending()
        })
    }

    /// Ask the peer to use or give up all outstanding credit. Returns
    /// `false` when there is no credit to drain.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] on a sender, a closed link,
    /// or while an earlier drain is outstanding.
    pub fn drain(&mut self, link: LinkId) -> Result<bool> {
        self.ensure_usable()?;
        self.ensure_open_receiver(link)?;
        self.run(|engine| {
            let started = engine
                .links
                .get_mut(&link)
                .map_or(Ok(false), Link::start_drain)?;
            if started {
                engine.flush_pending()?;
            }
            Ok(started)
        })
    }

    /// Answer a drain request by giving up the remaining credit. Returns
    /// `false` when no drain was requested or no credit is left.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] on a receiver.
    pub fn sender_drained(&mut self, link: LinkId) -> Result<bool> {
        self.ensure_usable()?;
        if !self.link_ref(link)?.is_sender() {
            return Err(EngineError::invalid_op("only a sender can answer a drain"));
        }
        self.run(|engine| {
            let drained = engine.links.get_mut(&link).is_some_and(Link::drained);
            if drained {
                engine.flush_pending()?;
            }
            Ok(drained)
        })
    }

    fn ensure_open_receiver(&self, link: LinkId) -> Result<()> {
        let state = self.link_ref(link)?;
        if state.is_sender() {
            return Err(EngineError::invalid_op("credit is granted by the receiver"));
        }
        if state.local_state.is_terminal() {
            return Err(EngineError::invalid_op(format!("{link} is closed")));
        }
        Ok(())
    }

    /// Set the byte capacity backing `session`'s incoming window.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn set_session_incoming_capacity(
        &mut self,
        session: SessionId,
        capacity: u32,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.session_ref(session)?;
        self.run(|engine| {
            if let Some(state) = engine.sessions.get_mut(&session) {
                let before = state.incoming.window();
                state.incoming.capacity = capacity;
                if state.begin_sent && state.incoming.window() != before {
                    state.flow_needed = true;
                }
            }
            engine.flush_pending()
        })
    }

    /// Set how many transfer bytes `session` may have handed to the sink and
    /// not yet completed. Writes blocked by a smaller capacity resume once
    /// room exists.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn set_session_outgoing_capacity(
        &mut self,
        session: SessionId,
        capacity: u32,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.session_ref(session)?;
        self.run(|engine| {
            let Some(state) = engine.sessions.get_mut(&session) else {
                return Ok(());
            };
            let was_blocked = state.outgoing.remaining() == 0;
            state.outgoing.capacity = capacity;
            if was_blocked && state.outgoing.remaining() > 0 {
                engine.capacity_reopened(session)?;
            }
            Ok(())
        })
    }

    /// Write every frame local state changes call for.
    pub(crate) fn flush_pending(&mut self) -> Result<()> {
        if !self.is_writable() || matches!(self.connection.local_state, EndpointState::Idle) {
            return Ok(());
        }
        self.send_header()?;
        if !self.connection.open_sent {
            self.connection.open_sent = true;
            let open = self.connection.open();
            self.send_frame(0, &Performative::Open(open), &[])?;
        }
        if self.connection.close_sent {
            return Ok(());
        }
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in sessions {
            self.flush_session(session)?;
        }
        if matches!(self.connection.local_state, EndpointState::Closed) {
            self.connection.close_sent = true;
            let close = Close {
                error: self.connection.local_error.clone(),
            };
            self.send_frame(0, &Performative::Close(close), &[])?;
        }
        Ok(())
    }

    fn flush_session(&mut self, session: SessionId) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if state.parent_closed || state.end_sent || matches!(state.local_state, EndpointState::Idle)
        {
            return Ok(());
        }
        let Some(channel) = state.local_channel else {
            return Ok(());
        };
        if !state.begin_sent {
            state.begin_sent = true;
            state.flow_needed = false;
            let begin = state.begin();
            self.send_frame(channel, &Performative::Begin(begin), &[])?;
        }

        let links = self
            .sessions
            .get(&session)
            .map(|s| s.links.clone())
            .unwrap_or_default();
        let mut link_flow_sent = false;
        for link in links {
            link_flow_sent |= self.flush_link(channel, link)?;
        }

        let Some(windows) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        let session_flow = if windows.flow_needed {
            windows.flow_needed = false;
            (!link_flow_sent).then(|| windows.flow())
        } else {
            None
        };
        if let Some(flow) = session_flow {
            self.send_frame(channel, &Performative::Flow(flow), &[])?;
        }

        let Some(ending) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if matches!(ending.local_state, EndpointState::Closed) {
            ending.end_sent = true;
            let end = End {
                error: ending.local_error.clone(),
            };
            self.send_frame(channel, &Performative::End(end), &[])?;
            self.session_end_sent(session, channel);
        }
        Ok(())
    }

    /// Returns `true` when a link Flow went out, which also carries the
    /// session's window.
    fn flush_link(&mut self, channel: u16, link: LinkId) -> Result<bool> {
        let Some(state) = self.links.get_mut(&link) else {
            return Ok(false);
        };
        if state.parent_closed || state.detach_sent {
            return Ok(false);
        }
        let Some(handle) = state.local_handle else {
            return Ok(false);
        };
        if !state.attach_sent {
            state.attach_sent = true;
            let attach = state.attach(handle);
            self.send_frame(channel, &Performative::Attach(Box::new(attach)), &[])?;
        }

        let Some(attached) = self.links.get_mut(&link) else {
            return Ok(false);
        };
        if attached.local_state.is_terminal() {
            attached.detach_sent = true;
            let detach = Detach {
                handle,
                closed: matches!(attached.local_state, LinkState::Closed),
                error: attached.local_error.clone(),
            };
            self.send_frame(channel, &Performative::Detach(detach), &[])?;
            return Ok(false);
        }
        if !attached.flow_needed {
            return Ok(false);
        }
        attached.flow_needed = false;
        let mut flow = self
            .sessions
            .get(&attached.session)
            .map(Session::flow)
            .unwrap_or_default();
        attached.fill_flow(&mut flow);
        self.send_frame(channel, &Performative::Flow(flow), &[])?;
        Ok(true)
    }

    /// The connection closed: flag `session` and its links.
    fn parent_closed_session(&mut self, session: SessionId) {
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        if state.parent_closed {
            return;
        }
        state.parent_closed = true;
        let notify = !matches!(state.local_state, EndpointState::Closed);
        let links = state.links.clone();
        if notify {
            self.push_event(Event::ParentEndpointClosed(Endpoint::Session(session)));
        }
        for link in links {
            self.parent_closed_link(link);
        }
    }

    /// The session or connection closed: flag `link`. Credit stays as it was
    /// until the link itself is closed.
    fn parent_closed_link(&mut self, link: LinkId) {
        let Some(state) = self.links.get_mut(&link) else {
            return;
        };
        if state.parent_closed {
            return;
        }
        state.parent_closed = true;
        if !state.local_state.is_terminal() {
            self.push_link_event(link, Event::ParentEndpointClosed);
        }
    }

    /// End went out on `channel`. A channel the peer has not ended yet is
    /// kept out of normal allocation until it has.
    fn session_end_sent(&mut self, session: SessionId, channel: u16) {
        if self.connection.local_channels.get(&channel) == Some(&session) {
            self.connection.local_channels.remove(&channel);
        }
        let remote_ended = self
            .sessions
            .get(&session)
            .is_some_and(|s| matches!(s.remote_state, EndpointState::Closed));
        if !remote_ended {
            self.connection.zombie_channels.insert(channel, session);
        }
    }

    /// Free `session`'s local channel once both ends are done with it.
    pub(crate) fn release_channel_if_closed(&mut self, session: SessionId) {
        let Some(state) = self.sessions.get(&session) else {
            return;
        };
        let local_done = state.end_sent || !state.begin_sent;
        if !matches!(state.local_state, EndpointState::Closed) || !local_done {
            return;
        }
        let remote_done = matches!(state.remote_state, EndpointState::Closed | EndpointState::Idle);
        let Some(channel) = state.local_channel else {
            return;
        };
        if !remote_done {
            return;
        }
        if self.connection.zombie_channels.get(&channel) == Some(&session) {
            self.connection.zombie_channels.remove(&channel);
        }
        if self.connection.local_channels.get(&channel) == Some(&session) {
            self.connection.local_channels.remove(&channel);
        }
    }

    /// Free `link`'s local handle once both ends have detached, or once the
    /// local end detached before any Attach went out.
    pub(crate) fn release_link_if_closed(&mut self, link: LinkId) {
        let Some(state) = self.links.get(&link) else {
            return;
        };
        let remote_done = state.remote_state.is_terminal()
            || (matches!(state.remote_state, LinkState::Idle) && !state.attach_sent);
        if !state.local_state.is_terminal() || !remote_done {
            return;
        }
        let session = state.session;
        if let Some(handle) = state.local_handle
            && let Some(parent) = self.sessions.get_mut(&session)
            && parent.local_handles.get(&handle) == Some(&link)
        {
            parent.local_handles.remove(&handle);
        }
    }
}
