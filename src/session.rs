//! Session state and window accounting.
//!
//! The incoming window is counted in frames and derived from a byte
//! capacity: `(capacity - buffered bytes) / max frame size`. The outgoing
//! side is limited by bytes handed to the output sink and not yet reported
//! as written, on top of the peer's frame-count incoming window.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;

use crate::{
    codec::{Begin, ErrorCondition, Fields, Flow, Symbol},
    delivery::UnsettledMap,
    endpoint::{DeliveryKey, EndpointState, LinkId},
    error::{EngineError, Result},
    sequence::{SequenceNo, precedes},
};

/// Frame-count window derived from a byte capacity.
#[derive(Debug, Default)]
pub(crate) struct IncomingWindow {
    pub(crate) capacity: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) buffered: u32,
    pub(crate) next_incoming_id: Option<SequenceNo>,
    pub(crate) remote_outgoing_window: u32,
    pub(crate) unsettled: UnsettledMap,
}

impl IncomingWindow {
    /// Frames the peer may still send.
    pub(crate) fn window(&self) -> u32 {
        if self.capacity == 0 || self.max_frame_size == u32::MAX {
            return u32::MAX;
        }
        self.capacity
            .saturating_sub(self.buffered)
            .checked_div(self.max_frame_size)
            .unwrap_or(u32::MAX)
    }

    /// A transfer arrived carrying `bytes` of payload.
    pub(crate) fn transfer_received(&mut self, bytes: usize) {
        self.buffered = self.buffered.saturating_add(clamp(bytes));
        self.next_incoming_id = self.next_incoming_id.map(|id| id.wrapping_add(1));
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);
    }

    /// The application consumed (or an abort discarded) `bytes`. Returns
    /// `true` when the window reopened from zero.
    pub(crate) fn bytes_released(&mut self, bytes: usize) -> bool {
        let was_closed = self.window() == 0;
        self.buffered = self.buffered.saturating_sub(clamp(bytes));
        was_closed && self.window() > 0
    }
}

/// Byte-capacity limited outgoing side.
#[derive(Debug)]
pub(crate) struct OutgoingWindow {
    pub(crate) capacity: u32,
    pub(crate) in_flight: u32,
    pub(crate) next_outgoing_id: SequenceNo,
    pub(crate) next_delivery_id: SequenceNo,
    pub(crate) remote_incoming_window: u32,
    pub(crate) unsettled: UnsettledMap,
}

impl Default for OutgoingWindow {
    fn default() -> Self {
        Self {
            capacity: i32::MAX.unsigned_abs(),
            in_flight: 0,
            next_outgoing_id: 0,
            next_delivery_id: 0,
            remote_incoming_window: 0,
            unsettled: UnsettledMap::default(),
        }
    }
}

impl OutgoingWindow {
    /// Bytes that may still be written before the sink catches up.
    pub(crate) const fn remaining(&self) -> u32 { self.capacity.saturating_sub(self.in_flight) }

    /// Transfers may be written now.
    pub(crate) const fn is_sendable(&self) -> bool {
        self.remaining() > 0 && self.remote_incoming_window > 0
    }

    /// A transfer frame carrying `bytes` went to the sink.
    pub(crate) fn frame_sent(&mut self, bytes: u32) {
        self.in_flight = self.in_flight.saturating_add(bytes);
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);
    }

    /// Allocate the next delivery id.
    pub(crate) const fn allocate_delivery_id(&mut self) -> SequenceNo {
        let id = self.next_delivery_id;
        self.next_delivery_id = id.wrapping_add(1);
        id
    }

    /// The sink confirmed `bytes` were written. Returns `true` when capacity
    /// became available again.
    pub(crate) const fn write_completed(&mut self, bytes: u32) -> bool {
        let was_blocked = self.remaining() == 0;
        self.in_flight = self.in_flight.saturating_sub(bytes);
        was_blocked && self.remaining() > 0
    }

    /// Apply the session fields of the peer's Flow.
    pub(crate) const fn remote_flow(&mut self, flow: &Flow) {
        // Before the peer has seen our Begin it omits next-incoming-id and the
        // window counts from our first outgoing id, which is 0.
        let next_incoming = match flow.next_incoming_id {
            Some(id) => id,
            None => 0,
        };
        let limit = next_incoming.wrapping_add(flow.incoming_window);
        self.remote_incoming_window = if precedes(limit, self.next_outgoing_id) {
            0
        } else {
            limit.wrapping_sub(self.next_outgoing_id)
        };
    }
}

fn clamp(bytes: usize) -> u32 { u32::try_from(bytes).unwrap_or(u32::MAX) }

/// A write that could not be sent when requested.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub(crate) link: LinkId,
    pub(crate) delivery: DeliveryKey,
    pub(crate) payload: Bytes,
    pub(crate) complete: bool,
    pub(crate) starts_delivery: bool,
}

/// One AMQP session.
#[derive(Debug)]
pub struct Session {
    pub(crate) local_state: EndpointState,
    pub(crate) remote_state: EndpointState,
    pub(crate) parent_closed: bool,
    pub(crate) local_channel: Option<u16>,
    pub(crate) remote_channel: Option<u16>,
    pub(crate) begin_sent: bool,
    pub(crate) end_sent: bool,
    pub(crate) handle_max: u32,
    pub(crate) offered_capabilities: Option<Vec<Symbol>>,
    pub(crate) desired_capabilities: Option<Vec<Symbol>>,
    pub(crate) properties: Option<Fields>,
    pub(crate) local_error: Option<ErrorCondition>,
    pub(crate) remote: Option<Begin>,
    pub(crate) remote_error: Option<ErrorCondition>,
    pub(crate) links: Vec<LinkId>,
    pub(crate) local_handles: BTreeMap<u32, LinkId>,
    pub(crate) remote_handles: HashMap<u32, LinkId>,
    pub(crate) incoming: IncomingWindow,
    pub(crate) outgoing: OutgoingWindow,
    pub(crate) flow_needed: bool,
    pub(crate) pending_writes: VecDeque<PendingWrite>,
}

impl Session {
    pub(crate) fn new(handle_max: u32, incoming_capacity: u32, outgoing_capacity: u32) -> Self {
        Self {
            local_state: EndpointState::Idle,
            remote_state: EndpointState::Idle,
            parent_closed: false,
            local_channel: None,
            remote_channel: None,
            begin_sent: false,
            end_sent: false,
            handle_max,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            local_error: None,
            remote: None,
            remote_error: None,
            links: Vec::new(),
            local_handles: BTreeMap::new(),
            remote_handles: HashMap::new(),
            incoming: IncomingWindow {
                capacity: incoming_capacity,
                ..IncomingWindow::default()
            },
            outgoing: OutgoingWindow {
                capacity: outgoing_capacity,
                ..OutgoingWindow::default()
            },
            flow_needed: false,
            pending_writes: VecDeque::new(),
        }
    }

    /// Local state.
    #[must_use]
    pub const fn local_state(&self) -> EndpointState { self.local_state }

    /// Remote state.
    #[must_use]
    pub const fn remote_state(&self) -> EndpointState { self.remote_state }

    /// The connection closed underneath this session.
    #[must_use]
    pub const fn is_parent_closed(&self) -> bool { self.parent_closed }

    /// Local channel, once the session has been opened.
    #[must_use]
    pub const fn channel(&self) -> Option<u16> { self.local_channel }

    /// Highest handle accepted locally.
    #[must_use]
    pub const fn handle_max(&self) -> u32 { self.handle_max }

    /// Highest handle the peer accepts.
    #[must_use]
    pub fn remote_handle_max(&self) -> Option<u32> { self.remote.as_ref().map(|b| b.handle_max) }

    /// Session incoming capacity in bytes (0 = unbounded).
    #[must_use]
    pub const fn incoming_capacity(&self) -> u32 { self.incoming.capacity }

    /// Session outgoing capacity in bytes.
    #[must_use]
    pub const fn outgoing_capacity(&self) -> u32 { self.outgoing.capacity }

    /// Incoming window the next Flow will advertise.
    #[must_use]
    pub fn incoming_window(&self) -> u32 { self.incoming.window() }

    /// Bytes of payload received but not yet read.
    #[must_use]
    pub const fn incoming_bytes(&self) -> u32 { self.incoming.buffered }

    /// Outgoing bytes that may still be written.
    #[must_use]
    pub const fn remaining_outgoing_capacity(&self) -> u32 { self.outgoing.remaining() }

    /// Frames the peer will still accept.
    #[must_use]
    pub const fn remote_incoming_window(&self) -> u32 { self.outgoing.remote_incoming_window }

    /// Error sent with the local End.
    #[must_use]
    pub const fn local_error(&self) -> Option<&ErrorCondition> { self.local_error.as_ref() }

    /// Error received with the peer's End.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> { self.remote_error.as_ref() }

    /// Links in creation order.
    #[must_use]
    pub fn links(&self) -> &[LinkId] { &self.links }

    fn ensure_configurable(&self, what: &str) -> Result<()> {
        if matches!(self.local_state, EndpointState::Idle) {
            Ok(())
        } else {
            Err(EngineError::invalid_op(format!(
                "cannot change {what} after the session has been opened"
            )))
        }
    }

    /// Set the highest handle accepted locally.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the session is open.
    pub fn set_handle_max(&mut self, handle_max: u32) -> Result<()> {
        self.ensure_configurable("the handle max")?;
        self.handle_max = handle_max;
        Ok(())
    }

    /// Set the offered capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the session is open.
    pub fn set_offered_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the offered capabilities")?;
        self.offered_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the desired capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the session is open.
    pub fn set_desired_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the desired capabilities")?;
        self.desired_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the session properties.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the session is open.
    pub fn set_properties(&mut self, properties: Fields) -> Result<()> {
        self.ensure_configurable("the properties")?;
        self.properties = Some(properties);
        Ok(())
    }

    /// Lowest free handle usable under both ends' handle max.
    pub(crate) fn free_handle(&self) -> Option<u32> {
        let max = self
            .remote_handle_max()
            .map_or(self.handle_max, |remote| remote.min(self.handle_max));
        let mut candidate = 0u32;
        for used in self.local_handles.keys() {
            if *used != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= max).then_some(candidate)
    }

    /// Build a Flow carrying only session state.
    pub(crate) fn flow(&self) -> Flow {
        Flow {
            next_incoming_id: self.incoming.next_incoming_id,
            incoming_window: self.incoming.window(),
            next_outgoing_id: self.outgoing.next_outgoing_id,
            outgoing_window: u32::MAX,
            ..Flow::default()
        }
    }

    /// Build the Begin announcing this end.
    pub(crate) fn begin(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.outgoing.next_outgoing_id,
            incoming_window: self.incoming.window(),
            outgoing_window: u32::MAX,
            handle_max: self.handle_max,
            offered_capabilities: self.offered_capabilities.clone(),
            desired_capabilities: self.desired_capabilities.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Record the peer's Begin.
    pub(crate) fn remote_begun(&mut self, channel: u16, begin: Begin) {
        self.remote_channel = Some(channel);
        self.remote_state = EndpointState::Active;
        self.incoming.next_incoming_id = Some(begin.next_outgoing_id);
        self.incoming.remote_outgoing_window = begin.outgoing_window;
        self.outgoing.remote_incoming_window = begin.incoming_window;
        self.remote = Some(begin);
    }

    /// Both ends have ended.
    pub(crate) const fn is_fully_closed(&self) -> bool {
        matches!(self.local_state, EndpointState::Closed)
            && matches!(self.remote_state, EndpointState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1024, 1024, 0, 1)]
    #[case(1024, 4096, 0, 4)]
    #[case(1024, 1024, 5, 0)]
    #[case(1024, 0, 5, u32::MAX)]
    #[case(u32::MAX, 1024, 0, u32::MAX)]
    fn incoming_window_from_capacity(
        #[case] max_frame_size: u32,
        #[case] capacity: u32,
        #[case] buffered: u32,
        #[case] expected: u32,
    ) {
        let window = IncomingWindow {
            capacity,
            max_frame_size,
            buffered,
            ..IncomingWindow::default()
        };
        assert_eq!(window.window(), expected);
    }

    #[test]
    fn reading_reopens_closed_window() {
        let mut window = IncomingWindow {
            capacity: 1024,
            max_frame_size: 1024,
            ..IncomingWindow::default()
        };
        window.transfer_received(5);
        assert_eq!(window.window(), 0);
        assert!(window.bytes_released(5));
        assert_eq!(window.window(), 1);
    }

    #[test]
    fn outgoing_capacity_blocks_until_write_completes() {
        let mut out = OutgoingWindow {
            capacity: 10,
            remote_incoming_window: 100,
            ..OutgoingWindow::default()
        };
        out.frame_sent(10);
        assert!(!out.is_sendable());
        assert!(out.write_completed(4));
        assert_eq!(out.remaining(), 4);
        assert!(!out.write_completed(6));
    }

    #[test]
    fn shrinking_capacity_blocks_immediately() {
        let mut out = OutgoingWindow {
            capacity: 100,
            remote_incoming_window: 100,
            ..OutgoingWindow::default()
        };
        out.frame_sent(50);
        out.capacity = 40;
        assert!(!out.is_sendable());
        out.capacity = 100;
        assert!(out.is_sendable());
    }

    #[test]
    fn remote_window_from_flow_accounts_for_sent_frames() {
        let mut out = OutgoingWindow::default();
        out.next_outgoing_id = 3;
        out.remote_flow(&Flow {
            next_incoming_id: Some(2),
            incoming_window: 10,
            ..Flow::default()
        });
        assert_eq!(out.remote_incoming_window, 9);
    }

    #[test]
    fn stale_flow_closes_the_remote_window() {
        let mut out = OutgoingWindow {
            next_outgoing_id: 5,
            ..OutgoingWindow::default()
        };
        out.remote_flow(&Flow {
            next_incoming_id: Some(1),
            incoming_window: 2,
            ..Flow::default()
        });
        assert_eq!(out.remote_incoming_window, 0);
        assert!(!out.is_sendable());
    }

    #[test]
    fn handle_allocation_respects_handle_max() {
        let mut session = Session::new(1, 0, 100);
        assert_eq!(session.free_handle(), Some(0));
        session.local_handles.insert(0, LinkId(0));
        assert_eq!(session.free_handle(), Some(1));
        session.local_handles.insert(1, LinkId(1));
        assert_eq!(session.free_handle(), None);
        session.local_handles.remove(&0);
        assert_eq!(session.free_handle(), Some(0));
    }

    #[test]
    fn zero_handle_max_allows_one_link() {
        let mut session = Session::new(0, 0, 100);
        assert_eq!(session.free_handle(), Some(0));
        session.local_handles.insert(0, LinkId(0));
        assert_eq!(session.free_handle(), None);
    }
}
