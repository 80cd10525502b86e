//! Sender and receiver link state.
//!
//! A [`Link`] holds the attach configuration, both ends' lifecycle state and
//! the credit bookkeeping for one direction of message flow. Everything that
//! produces frames lives on the engine; this module only updates state.

use bytes::Bytes;

use crate::{
    codec::{
        Attach, ErrorCondition, Fields, Flow, ReceiverSettleMode, Role, SenderSettleMode, Source,
        Symbol, TargetKind,
    },
    delivery::DeliveryTagGenerator,
    endpoint::{ControllerId, DeliveryKey, LinkState, ManagerId, SessionId},
    error::{EngineError, Result},
    sequence::{SequenceNo, distance, precedes},
};

/// What a link is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkOwner {
    /// An ordinary application link.
    Plain,
    /// The sender of a transaction controller.
    Controller(ControllerId),
    /// The receiver of a transaction manager.
    Manager(ManagerId),
}

/// One end of a link.
#[derive(Debug)]
pub struct Link {
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) owner: LinkOwner,
    pub(crate) local_state: LinkState,
    pub(crate) remote_state: LinkState,
    pub(crate) parent_closed: bool,
    pub(crate) local_handle: Option<u32>,
    pub(crate) remote_handle: Option<u32>,
    pub(crate) attach_sent: bool,
    pub(crate) detach_sent: bool,
    pub(crate) source: Option<Source>,
    pub(crate) target: Option<TargetKind>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) offered_capabilities: Option<Vec<Symbol>>,
    pub(crate) desired_capabilities: Option<Vec<Symbol>>,
    pub(crate) properties: Option<Fields>,
    pub(crate) max_message_size: Option<u64>,
    pub(crate) local_error: Option<ErrorCondition>,
    pub(crate) remote: Option<Box<Attach>>,
    pub(crate) remote_error: Option<ErrorCondition>,
    pub(crate) credit: u32,
    pub(crate) delivery_count: SequenceNo,
    pub(crate) drain: bool,
    pub(crate) flow_needed: bool,
    pub(crate) unsettled: Vec<DeliveryKey>,
    pub(crate) current: Option<DeliveryKey>,
    pub(crate) queued_new: u32,
    pub(crate) tags: DeliveryTagGenerator,
}

fn locked(what: &str) -> EngineError {
    EngineError::invalid_op(format!("cannot change {what} after the link has been opened"))
}

impl Link {
    pub(crate) fn new(session: SessionId, name: String, role: Role, owner: LinkOwner) -> Self {
        Self {
            session,
            name,
            role,
            owner,
            local_state: LinkState::Idle,
            remote_state: LinkState::Idle,
            parent_closed: false,
            local_handle: None,
            remote_handle: None,
            attach_sent: false,
            detach_sent: false,
            source: None,
            target: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            max_message_size: None,
            local_error: None,
            remote: None,
            remote_error: None,
            credit: 0,
            delivery_count: 0,
            drain: false,
            flow_needed: false,
            unsettled: Vec::new(),
            current: None,
            queued_new: 0,
            tags: DeliveryTagGenerator::default(),
        }
    }

    /// Owning session.
    #[must_use]
    pub const fn session(&self) -> SessionId { self.session }

    /// Link name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Local role.
    #[must_use]
    pub const fn role(&self) -> Role { self.role }

    /// Return `true` for a sender.
    #[must_use]
    pub const fn is_sender(&self) -> bool { matches!(self.role, Role::Sender) }

    /// Local state.
    #[must_use]
    pub const fn local_state(&self) -> LinkState { self.local_state }

    /// Remote state.
    #[must_use]
    pub const fn remote_state(&self) -> LinkState { self.remote_state }

    /// Handle assigned when the link was opened.
    #[must_use]
    pub const fn handle(&self) -> Option<u32> { self.local_handle }

    /// The session or connection closed underneath this link.
    #[must_use]
    pub const fn is_parent_closed(&self) -> bool { self.parent_closed }

    /// Link credit: granted (receiver) or available (sender).
    #[must_use]
    pub const fn credit(&self) -> u32 { self.credit }

    /// Delivery count.
    #[must_use]
    pub const fn delivery_count(&self) -> SequenceNo { self.delivery_count }

    /// A drain is outstanding (receiver) or requested by the peer (sender).
    #[must_use]
    pub const fn is_draining(&self) -> bool { self.drain }

    /// Local source.
    #[must_use]
    pub const fn source(&self) -> Option<&Source> { self.source.as_ref() }

    /// Local target.
    #[must_use]
    pub const fn target(&self) -> Option<&TargetKind> { self.target.as_ref() }

    /// Sender settle mode.
    #[must_use]
    pub const fn sender_settle_mode(&self) -> SenderSettleMode { self.snd_settle_mode }

    /// Receiver settle mode.
    #[must_use]
    pub const fn receiver_settle_mode(&self) -> ReceiverSettleMode { self.rcv_settle_mode }

    /// Largest message size offered locally.
    #[must_use]
    pub const fn max_message_size(&self) -> Option<u64> { self.max_message_size }

    /// Source sent by the peer.
    #[must_use]
    pub fn remote_source(&self) -> Option<&Source> { self.remote.as_ref()?.source.as_ref() }

    /// Target sent by the peer.
    #[must_use]
    pub fn remote_target(&self) -> Option<&TargetKind> { self.remote.as_ref()?.target.as_ref() }

    /// Largest message size the peer accepts.
    #[must_use]
    pub fn remote_max_message_size(&self) -> Option<u64> { self.remote.as_ref()?.max_message_size }

    /// Error condition sent locally on detach.
    #[must_use]
    pub const fn local_error(&self) -> Option<&ErrorCondition> { self.local_error.as_ref() }

    /// Error condition received with the peer's detach.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> { self.remote_error.as_ref() }

    /// Unsettled deliveries, oldest first.
    #[must_use]
    pub fn unsettled(&self) -> &[DeliveryKey] { &self.unsettled }

    /// The sender could transfer a new delivery now, ignoring session capacity.
    pub(crate) const fn has_credit_to_send(&self) -> bool {
        matches!(self.local_state, LinkState::Active)
            && matches!(self.remote_state, LinkState::Active)
            && !self.parent_closed
            && self.credit > self.queued_new
    }

    pub(crate) fn ensure_configurable(&self, what: &str) -> Result<()> {
        if matches!(self.local_state, LinkState::Idle) {
            Ok(())
        } else {
            Err(locked(what))
        }
    }

    /// Set the source terminus.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_source(&mut self, source: Source) -> Result<()> {
        self.ensure_configurable("the source")?;
        self.source = Some(source);
        Ok(())
    }

    /// Set the target terminus.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_target(&mut self, target: impl Into<TargetKind>) -> Result<()> {
        self.ensure_configurable("the target")?;
        self.target = Some(target.into());
        Ok(())
    }

    /// Set the sender settle mode.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_sender_settle_mode(&mut self, mode: SenderSettleMode) -> Result<()> {
        self.ensure_configurable("the sender settle mode")?;
        self.snd_settle_mode = mode;
        Ok(())
    }

    /// Set the receiver settle mode.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_receiver_settle_mode(&mut self, mode: ReceiverSettleMode) -> Result<()> {
        self.ensure_configurable("the receiver settle mode")?;
        self.rcv_settle_mode = mode;
        Ok(())
    }

    /// Set the offered capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_offered_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the offered capabilities")?;
        self.offered_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the desired capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_desired_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the desired capabilities")?;
        self.desired_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the link properties.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_properties(&mut self, properties: Fields) -> Result<()> {
        self.ensure_configurable("the properties")?;
        self.properties = Some(properties);
        Ok(())
    }

    /// Set the largest message size accepted.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the link is open.
    pub fn set_max_message_size(&mut self, size: u64) -> Result<()> {
        self.ensure_configurable("the max message size")?;
        self.max_message_size = Some(size);
        Ok(())
    }

    /// Next tag from the link's sequential generator.
    pub(crate) fn next_tag(&mut self) -> Bytes { self.tags.next_tag() }

    /// Build the Attach announcing this end.
    pub(crate) fn attach(&self, handle: u32) -> Attach {
        Attach {
            name: self.name.clone(),
            handle,
            role: self.role,
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source.clone(),
            target: self.target.clone(),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: self.is_sender().then_some(self.delivery_count),
            max_message_size: self.max_message_size,
            offered_capabilities: self.offered_capabilities.clone(),
            desired_capabilities: self.desired_capabilities.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Record the peer's Attach.
    pub(crate) fn remote_attached(&mut self, attach: Box<Attach>) {
        self.remote_handle = Some(attach.handle);
        self.remote_state = LinkState::Active;
        if !self.is_sender() {
            self.delivery_count = attach.initial_delivery_count.unwrap_or_default();
        }
        self.remote = Some(attach);
    }

    /// Fill the link fields of a Flow.
    pub(crate) fn fill_flow(&self, flow: &mut Flow) {
        flow.handle = self.local_handle;
        flow.delivery_count = Some(self.delivery_count);
        flow.link_credit = Some(self.credit);
        flow.drain = self.drain;
    }

    /// Grant more credit to the peer's sender.
    pub(crate) const fn add_credit(&mut self, credit: u32) {
        self.credit = self.credit.saturating_add(credit);
        self.flow_needed = true;
    }

    /// Start a drain; `false` when there is no credit to drain.
    pub(crate) fn start_drain(&mut self) -> Result<bool> {
        if self.drain {
            return Err(EngineError::invalid_op("a drain request is already outstanding"));
        }
        if self.credit == 0 {
            return Ok(false);
        }
        self.drain = true;
        self.flow_needed = true;
        Ok(true)
    }

    /// Receiver side of a transfer starting a new delivery.
    pub(crate) const fn incoming_delivery_started(&mut self) {
        self.credit = self.credit.saturating_sub(1);
        self.delivery_count = self.delivery_count.wrapping_add(1);
    }

    /// Sender side of a transfer starting a new delivery.
    pub(crate) const fn outgoing_delivery_started(&mut self) {
        self.credit = self.credit.saturating_sub(1);
        self.delivery_count = self.delivery_count.wrapping_add(1);
    }

    /// Apply the link fields of the peer's Flow. Returns `true` when a
    /// receiver's outstanding drain completed.
    pub(crate) fn remote_flow(&mut self, flow: &Flow) -> bool {
        if self.is_sender() {
            // The receiver may not have seen our attach yet, in which case it
            // omits its delivery count and our initial count applies.
            let receiver_count = flow.delivery_count.unwrap_or(self.delivery_count);
            let limit = receiver_count.wrapping_add(flow.link_credit.unwrap_or_default());
            // A limit behind what we already sent leaves no credit.
            self.credit = if precedes(limit, self.delivery_count) {
                0
            } else {
                distance(self.delivery_count, limit)
            };
            self.drain = flow.drain;
            false
        } else {
            if let Some(sender_count) = flow.delivery_count {
                let advanced = distance(self.delivery_count, sender_count);
                self.credit = self.credit.saturating_sub(advanced);
                self.delivery_count = sender_count;
            }
            if self.drain && self.credit == 0 {
                self.drain = false;
                return true;
            }
            false
        }
    }

    /// Sender answering a drain: consume all remaining credit.
    pub(crate) fn drained(&mut self) -> bool {
        if !self.drain || self.credit == 0 {
            return false;
        }
        self.delivery_count = self.delivery_count.wrapping_add(self.credit);
        self.credit = 0;
        self.flow_needed = true;
        true
    }

    /// Explicit local close or detach clears credit.
    pub(crate) const fn reset_credit(&mut self) {
        self.credit = 0;
        self.drain = false;
        self.queued_new = 0;
    }

    /// Both ends are closed or detached.
    pub(crate) const fn is_fully_closed(&self) -> bool {
        self.local_state.is_terminal() && self.remote_state.is_terminal()
    }

    pub(crate) fn forget_delivery(&mut self, key: DeliveryKey) {
        self.unsettled.retain(|k| *k != key);
        if self.current == Some(key) {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::codec::Target;

    fn link(role: Role) -> Link {
        Link::new(SessionId(0), "test".to_owned(), role, LinkOwner::Plain)
    }

    #[fixture]
    fn receiver() -> Link { link(Role::Receiver) }

    #[fixture]
    fn sender() -> Link { link(Role::Sender) }

    fn flow(delivery_count: Option<u32>, credit: u32, drain: bool) -> Flow {
        Flow {
            delivery_count,
            link_credit: Some(credit),
            drain,
            ..Flow::default()
        }
    }

    #[rstest]
    fn configuration_locks_after_open(mut sender: Link) {
        assert!(sender.set_target(Target::with_address("queue")).is_ok());
        sender.local_state = LinkState::Active;
        let err = sender.set_source(Source::default());
        assert!(matches!(err, Err(EngineError::InvalidOperation(_))));
        assert!(sender.set_max_message_size(1).is_err());
    }

    #[rstest]
    fn sender_credit_follows_receiver_limit(mut sender: Link) {
        sender.delivery_count = u32::MAX - 1;
        sender.remote_flow(&flow(Some(u32::MAX - 1), 5, false));
        assert_eq!(sender.credit(), 5);
        sender.outgoing_delivery_started();
        sender.outgoing_delivery_started();
        assert_eq!(sender.delivery_count(), 0);
        assert_eq!(sender.credit(), 3);
        // A stale flow computed before the two transfers leaves three credits.
        sender.remote_flow(&flow(Some(u32::MAX - 1), 5, false));
        assert_eq!(sender.credit(), 3);
    }

    #[rstest]
    fn limit_behind_sent_deliveries_grants_nothing(mut sender: Link) {
        sender.remote_flow(&flow(Some(0), 2, false));
        sender.outgoing_delivery_started();
        sender.outgoing_delivery_started();
        assert_eq!(sender.credit(), 0);
        sender.remote_flow(&flow(Some(0), 1, false));
        assert_eq!(sender.credit(), 0);
        sender.remote_flow(&flow(Some(2), 1, false));
        assert_eq!(sender.credit(), 1);
    }

    #[rstest]
    fn second_drain_is_rejected(mut receiver: Link) {
        receiver.add_credit(3);
        assert!(matches!(receiver.start_drain(), Ok(true)));
        assert!(matches!(
            receiver.start_drain(),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[rstest]
    fn drain_without_credit_is_a_no_op(mut receiver: Link) {
        assert!(matches!(receiver.start_drain(), Ok(false)));
        assert!(!receiver.is_draining());
    }

    #[rstest]
    fn drain_completes_when_sender_consumes_credit(mut receiver: Link) {
        receiver.add_credit(4);
        assert!(matches!(receiver.start_drain(), Ok(true)));
        assert!(receiver.remote_flow(&flow(Some(4), 0, true)));
        assert_eq!(receiver.credit(), 0);
        assert!(!receiver.is_draining());
        assert!(receiver.start_drain().is_ok());
    }

    #[rstest]
    fn sender_drained_consumes_remaining_credit(mut sender: Link) {
        sender.remote_flow(&flow(Some(0), 7, true));
        assert!(sender.drained());
        assert_eq!(sender.credit(), 0);
        assert_eq!(sender.delivery_count(), 7);
        assert!(!sender.drained());
    }
}
