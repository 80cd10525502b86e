//! The nine AMQP transport performatives.
//!
//! Decoding enforces the mandatory-field list of each performative in field
//! order, so an Open with an empty field list reports its `container-id`.

use bitflags::bitflags;
use bytes::Bytes;

use super::{
    definitions::{
        DeliveryState, ErrorCondition, ReceiverSettleMode, Role, SenderSettleMode, Source,
        TargetKind, canonical_code, descriptor,
    },
    error::DecodeError,
    fields::{FieldReader, Fields, ListBuilder},
    value::{Symbol, Value},
};

/// Open: negotiates connection parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Open {
    /// Container id of the sending peer.
    pub container_id: String,
    /// Virtual host name the peer is connecting to.
    pub hostname: Option<String>,
    /// Largest frame the sender will accept.
    pub max_frame_size: u32,
    /// Highest channel number the sender will accept.
    pub channel_max: u16,
    /// Idle timeout in milliseconds.
    pub idle_time_out: Option<u32>,
    /// Locales available for outgoing text.
    pub outgoing_locales: Option<Vec<Symbol>>,
    /// Desired locales for incoming text.
    pub incoming_locales: Option<Vec<Symbol>>,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extension capabilities the sender may use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Connection properties.
    pub properties: Option<Fields>,
}

impl Open {
    /// An Open with protocol defaults for every optional field.
    #[must_use]
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }
}

/// Begin: starts a session on a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Begin {
    /// Channel of the remote session when answering a begin.
    pub remote_channel: Option<u16>,
    /// Transfer id of the next outgoing transfer.
    pub next_outgoing_id: u32,
    /// Initial incoming window in frames.
    pub incoming_window: u32,
    /// Initial outgoing window in frames.
    pub outgoing_window: u32,
    /// Highest link handle usable in the session.
    pub handle_max: u32,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extension capabilities the sender may use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Session properties.
    pub properties: Option<Fields>,
}

/// Attach: attaches a link to a session.
#[derive(Clone, Debug, PartialEq)]
pub struct Attach {
    /// Link name.
    pub name: String,
    /// Handle chosen by the sender of the attach.
    pub handle: u32,
    /// Role of the sender of the attach.
    pub role: Role,
    /// Sender settlement mode.
    pub snd_settle_mode: SenderSettleMode,
    /// Receiver settlement mode.
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Source terminus.
    pub source: Option<Source>,
    /// Target terminus or coordinator.
    pub target: Option<TargetKind>,
    /// Unsettled delivery state map.
    pub unsettled: Option<Value>,
    /// Whether the unsettled map is incomplete.
    pub incomplete_unsettled: bool,
    /// Sender's initial delivery count; mandatory when the role is sender.
    pub initial_delivery_count: Option<u32>,
    /// Largest message size supported.
    pub max_message_size: Option<u64>,
    /// Extension capabilities the sender supports.
    pub offered_capabilities: Option<Vec<Symbol>>,
    /// Extension capabilities the sender may use.
    pub desired_capabilities: Option<Vec<Symbol>>,
    /// Link properties.
    pub properties: Option<Fields>,
}

/// Flow: updates session and link flow state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Flow {
    /// Expected next incoming transfer id.
    pub next_incoming_id: Option<u32>,
    /// Incoming window in frames.
    pub incoming_window: u32,
    /// Next outgoing transfer id.
    pub next_outgoing_id: u32,
    /// Outgoing window in frames.
    pub outgoing_window: u32,
    /// Link handle for link flow state.
    pub handle: Option<u32>,
    /// Link delivery count.
    pub delivery_count: Option<u32>,
    /// Link credit.
    pub link_credit: Option<u32>,
    /// Messages available at the sender.
    pub available: Option<u32>,
    /// Drain mode.
    pub drain: bool,
    /// Request a flow in reply.
    pub echo: bool,
    /// Link state properties.
    pub properties: Option<Fields>,
}

bitflags! {
    /// Boolean flags carried by a transfer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u8 {
        /// More frames of this delivery follow.
        const MORE = 1 << 0;
        /// The transfer resumes a previous delivery.
        const RESUME = 1 << 1;
        /// The delivery is aborted.
        const ABORTED = 1 << 2;
        /// The sender may batch disposition replies.
        const BATCHABLE = 1 << 3;
    }
}

impl TransferFlags {
    /// More frames follow.
    #[must_use]
    pub const fn more(self) -> bool { self.contains(Self::MORE) }

    /// Delivery aborted.
    #[must_use]
    pub const fn aborted(self) -> bool { self.contains(Self::ABORTED) }
}

/// Transfer: carries one frame of a delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transfer {
    /// Link handle.
    pub handle: u32,
    /// Delivery id; present on the first frame of a delivery.
    pub delivery_id: Option<u32>,
    /// Delivery tag; present on the first frame of a delivery.
    pub delivery_tag: Option<Bytes>,
    /// Message format code.
    pub message_format: Option<u32>,
    /// Sender settled the delivery.
    pub settled: Option<bool>,
    /// More/resume/aborted/batchable flags.
    pub flags: TransferFlags,
    /// Receiver settle mode override.
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Sender's delivery state.
    pub state: Option<DeliveryState>,
}

/// Disposition: communicates delivery state changes for a range of ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Disposition {
    /// Role of the sender of the disposition.
    pub role: Role,
    /// First delivery id in the range.
    pub first: u32,
    /// Last delivery id in the range; defaults to `first`.
    pub last: Option<u32>,
    /// Deliveries are settled.
    pub settled: bool,
    /// New delivery state.
    pub state: Option<DeliveryState>,
    /// The receiver may batch replies.
    pub batchable: bool,
}

/// Detach: detaches or closes a link.
#[derive(Clone, Debug, PartialEq)]
pub struct Detach {
    /// Link handle.
    pub handle: u32,
    /// The link is closed rather than detached.
    pub closed: bool,
    /// Error causing the detach.
    pub error: Option<ErrorCondition>,
}

/// End: ends a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct End {
    /// Error causing the end.
    pub error: Option<ErrorCondition>,
}

/// Close: closes the connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Close {
    /// Error causing the close.
    pub error: Option<ErrorCondition>,
}

/// Any transport performative.
#[derive(Clone, Debug, PartialEq)]
pub enum Performative {
    /// See [`Open`].
    Open(Open),
    /// See [`Begin`].
    Begin(Begin),
    /// See [`Attach`].
    Attach(Box<Attach>),
    /// See [`Flow`].
    Flow(Flow),
    /// See [`Transfer`].
    Transfer(Transfer),
    /// See [`Disposition`].
    Disposition(Disposition),
    /// See [`Detach`].
    Detach(Detach),
    /// See [`End`].
    End(End),
    /// See [`Close`].
    Close(Close),
}

fn error_value(error: Option<&ErrorCondition>) -> Value {
    error.map_or(Value::Null, ErrorCondition::to_value)
}

impl Performative {
    /// Performative name as used in decode error text.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "Open",
            Self::Begin(_) => "Begin",
            Self::Attach(_) => "Attach",
            Self::Flow(_) => "Flow",
            Self::Transfer(_) => "Transfer",
            Self::Disposition(_) => "Disposition",
            Self::Detach(_) => "Detach",
            Self::End(_) => "End",
            Self::Close(_) => "Close",
        }
    }

    /// Encode as a described list.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Open(o) => ListBuilder::new()
                .push(o.container_id.as_str())
                .opt(o.hostname.clone())
                .push(o.max_frame_size)
                .push(o.channel_max)
                .opt(o.idle_time_out)
                .opt(o.outgoing_locales.clone())
                .opt(o.incoming_locales.clone())
                .opt(o.offered_capabilities.clone())
                .opt(o.desired_capabilities.clone())
                .opt(o.properties.clone())
                .describe(descriptor::OPEN),
            Self::Begin(b) => ListBuilder::new()
                .opt(b.remote_channel)
                .push(b.next_outgoing_id)
                .push(b.incoming_window)
                .push(b.outgoing_window)
                .push(b.handle_max)
                .opt(b.offered_capabilities.clone())
                .opt(b.desired_capabilities.clone())
                .opt(b.properties.clone())
                .describe(descriptor::BEGIN),
            Self::Attach(a) => ListBuilder::new()
                .push(a.name.as_str())
                .push(a.handle)
                .push(a.role)
                .push(a.snd_settle_mode)
                .push(a.rcv_settle_mode)
                .push(a.source.as_ref().map_or(Value::Null, Source::to_value))
                .push(a.target.as_ref().map_or(Value::Null, TargetKind::to_value))
                .opt(a.unsettled.clone())
                .push(a.incomplete_unsettled)
                .opt(a.initial_delivery_count)
                .opt(a.max_message_size)
                .opt(a.offered_capabilities.clone())
                .opt(a.desired_capabilities.clone())
                .opt(a.properties.clone())
                .describe(descriptor::ATTACH),
            Self::Flow(f) => ListBuilder::new()
                .opt(f.next_incoming_id)
                .push(f.incoming_window)
                .push(f.next_outgoing_id)
                .push(f.outgoing_window)
                .opt(f.handle)
                .opt(f.delivery_count)
                .opt(f.link_credit)
                .opt(f.available)
                .push(f.drain)
                .push(f.echo)
                .opt(f.properties.clone())
                .describe(descriptor::FLOW),
            Self::Transfer(t) => ListBuilder::new()
                .push(t.handle)
                .opt(t.delivery_id)
                .opt(t.delivery_tag.clone())
                .opt(t.message_format)
                .opt(t.settled)
                .push(t.flags.more())
                .opt(t.rcv_settle_mode)
                .push(t.state.as_ref().map_or(Value::Null, DeliveryState::to_value))
                .push(t.flags.contains(TransferFlags::RESUME))
                .push(t.flags.aborted())
                .push(t.flags.contains(TransferFlags::BATCHABLE))
                .describe(descriptor::TRANSFER),
            Self::Disposition(d) => ListBuilder::new()
                .push(d.role)
                .push(d.first)
                .opt(d.last)
                .push(d.settled)
                .push(d.state.as_ref().map_or(Value::Null, DeliveryState::to_value))
                .push(d.batchable)
                .describe(descriptor::DISPOSITION),
            Self::Detach(d) => ListBuilder::new()
                .push(d.handle)
                .push(d.closed)
                .push(error_value(d.error.as_ref()))
                .describe(descriptor::DETACH),
            Self::End(e) => ListBuilder::new()
                .push(error_value(e.error.as_ref()))
                .describe(descriptor::END),
            Self::Close(c) => ListBuilder::new()
                .push(error_value(c.error.as_ref()))
                .describe(descriptor::CLOSE),
        }
    }

    /// Decode and validate a performative.
    ///
    /// # Errors
    /// Returns [`DecodeError::MissingField`] naming the first absent mandatory
    /// field, or another [`DecodeError`] for malformed input.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Described(desc, _) = &value else {
            return Err(DecodeError::NotAComposite("performative"));
        };
        let code = canonical_code(desc)
            .ok_or_else(|| DecodeError::UnknownDescriptor(desc.to_string()))?;
        match code {
            descriptor::OPEN => decode_open(FieldReader::described("Open", code, value)?),
            descriptor::BEGIN => decode_begin(FieldReader::described("Begin", code, value)?),
            descriptor::ATTACH => decode_attach(FieldReader::described("Attach", code, value)?),
            descriptor::FLOW => decode_flow(FieldReader::described("Flow", code, value)?),
            descriptor::TRANSFER => {
                decode_transfer(FieldReader::described("Transfer", code, value)?)
            }
            descriptor::DISPOSITION => {
                decode_disposition(FieldReader::described("Disposition", code, value)?)
            }
            descriptor::DETACH => {
                let mut r = FieldReader::described("Detach", code, value)?;
                Ok(Self::Detach(Detach {
                    handle: r.required("handle")?,
                    closed: r.or_default("closed")?,
                    error: r.optional("error")?,
                }))
            }
            descriptor::END => {
                let mut r = FieldReader::described("End", code, value)?;
                Ok(Self::End(End {
                    error: r.optional("error")?,
                }))
            }
            descriptor::CLOSE => {
                let mut r = FieldReader::described("Close", code, value)?;
                Ok(Self::Close(Close {
                    error: r.optional("error")?,
                }))
            }
            other => Err(DecodeError::UnknownDescriptor(format!("0x{other:016x}"))),
        }
    }
}

fn decode_open(mut r: FieldReader) -> Result<Performative, DecodeError> {
    Ok(Performative::Open(Open {
        container_id: r.required("container-id")?,
        hostname: r.optional("hostname")?,
        max_frame_size: r.optional("max-frame-size")?.unwrap_or(u32::MAX),
        channel_max: r.optional("channel-max")?.unwrap_or(u16::MAX),
        idle_time_out: r.optional("idle-time-out")?,
        outgoing_locales: r.optional("outgoing-locales")?,
        incoming_locales: r.optional("incoming-locales")?,
        offered_capabilities: r.optional("offered-capabilities")?,
        desired_capabilities: r.optional("desired-capabilities")?,
        properties: r.optional("properties")?,
    }))
}

fn decode_begin(mut r: FieldReader) -> Result<Performative, DecodeError> {
    Ok(Performative::Begin(Begin {
        remote_channel: r.optional("remote-channel")?,
        next_outgoing_id: r.required("next-outgoing-id")?,
        incoming_window: r.required("incoming-window")?,
        outgoing_window: r.required("outgoing-window")?,
        handle_max: r.optional("handle-max")?.unwrap_or(u32::MAX),
        offered_capabilities: r.optional("offered-capabilities")?,
        desired_capabilities: r.optional("desired-capabilities")?,
        properties: r.optional("properties")?,
    }))
}

fn decode_attach(mut r: FieldReader) -> Result<Performative, DecodeError> {
    let name = r.required("name")?;
    let handle = r.required("handle")?;
    let role: Role = r.required("role")?;
    let snd_settle_mode = r.or_default("snd-settle-mode")?;
    let rcv_settle_mode = r.or_default("rcv-settle-mode")?;
    let source = r.optional("source")?;
    let target = r.optional("target")?;
    let unsettled = r.optional("unsettled")?;
    let incomplete_unsettled = r.or_default("incomplete-unsettled")?;
    let initial_delivery_count = match role {
        Role::Sender => Some(r.required("initial-delivery-count")?),
        Role::Receiver => r.optional("initial-delivery-count")?,
    };
    Ok(Performative::Attach(Box::new(Attach {
        name,
        handle,
        role,
        snd_settle_mode,
        rcv_settle_mode,
        source,
        target,
        unsettled,
        incomplete_unsettled,
        initial_delivery_count,
        max_message_size: r.optional("max-message-size")?,
        offered_capabilities: r.optional("offered-capabilities")?,
        desired_capabilities: r.optional("desired-capabilities")?,
        properties: r.optional("properties")?,
    })))
}

fn decode_flow(mut r: FieldReader) -> Result<Performative, DecodeError> {
    Ok(Performative::Flow(Flow {
        next_incoming_id: r.optional("next-incoming-id")?,
        incoming_window: r.required("incoming-window")?,
        next_outgoing_id: r.required("next-outgoing-id")?,
        outgoing_window: r.required("outgoing-window")?,
        handle: r.optional("handle")?,
        delivery_count: r.optional("delivery-count")?,
        link_credit: r.optional("link-credit")?,
        available: r.optional("available")?,
        drain: r.or_default("drain")?,
        echo: r.or_default("echo")?,
        properties: r.optional("properties")?,
    }))
}

fn decode_transfer(mut r: FieldReader) -> Result<Performative, DecodeError> {
    let handle = r.required("handle")?;
    let delivery_id = r.optional("delivery-id")?;
    let delivery_tag = r.optional("delivery-tag")?;
    let message_format = r.optional("message-format")?;
    let settled = r.optional("settled")?;
    let mut flags = TransferFlags::empty();
    flags.set(TransferFlags::MORE, r.or_default("more")?);
    let rcv_settle_mode = r.optional("rcv-settle-mode")?;
    let state = r.optional("state")?;
    flags.set(TransferFlags::RESUME, r.or_default("resume")?);
    flags.set(TransferFlags::ABORTED, r.or_default("aborted")?);
    flags.set(TransferFlags::BATCHABLE, r.or_default("batchable")?);
    Ok(Performative::Transfer(Transfer {
        handle,
        delivery_id,
        delivery_tag,
        message_format,
        settled,
        flags,
        rcv_settle_mode,
        state,
    }))
}

fn decode_disposition(mut r: FieldReader) -> Result<Performative, DecodeError> {
    Ok(Performative::Disposition(Disposition {
        role: r.required("role")?,
        first: r.required("first")?,
        last: r.optional("last")?,
        settled: r.or_default("settled")?,
        state: r.optional("state")?,
        batchable: r.or_default("batchable")?,
    }))
}
