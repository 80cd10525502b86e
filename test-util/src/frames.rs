//! Performative builders with the fields tests usually leave at defaults.

use amqp_engine::codec::{
    Attach,
    Begin,
    Close,
    Coordinator,
    DeliveryState,
    Detach,
    Disposition,
    End,
    ErrorCondition,
    Flow,
    Open,
    Performative,
    ReceiverSettleMode,
    Role,
    SenderSettleMode,
    Source,
    Target,
    TargetKind,
    Transfer,
};
use bytes::Bytes;

/// Window large enough that no test runs into it.
pub const WIDE_WINDOW: u32 = i32::MAX.unsigned_abs();

/// Open from a peer called `container_id`.
#[must_use]
pub fn open(container_id: &str) -> Performative { Performative::Open(Open::new(container_id)) }

/// Open advertising `idle_time_out` milliseconds.
#[must_use]
pub fn open_with_idle_timeout(container_id: &str, idle_time_out: u32) -> Performative {
    let mut open = Open::new(container_id);
    open.idle_time_out = Some(idle_time_out);
    Performative::Open(open)
}

/// Begin with wide windows; `remote_channel` answers a local begin.
#[must_use]
pub const fn begin(remote_channel: Option<u16>) -> Performative {
    begin_with(remote_channel, WIDE_WINDOW, u32::MAX)
}

/// Begin with an explicit incoming window and handle-max.
#[must_use]
pub const fn begin_with(
    remote_channel: Option<u16>,
    incoming_window: u32,
    handle_max: u32,
) -> Performative {
    Performative::Begin(Begin {
        remote_channel,
        next_outgoing_id: 0,
        incoming_window,
        outgoing_window: WIDE_WINDOW,
        handle_max,
        offered_capabilities: None,
        desired_capabilities: None,
        properties: None,
    })
}

fn link_attach(name: &str, handle: u32, role: Role, target: TargetKind) -> Performative {
    Performative::Attach(Box::new(Attach {
        name: name.to_owned(),
        handle,
        role,
        snd_settle_mode: SenderSettleMode::Mixed,
        rcv_settle_mode: ReceiverSettleMode::First,
        source: Some(Source::with_address(name)),
        target: Some(target),
        unsettled: None,
        incomplete_unsettled: false,
        initial_delivery_count: matches!(role, Role::Sender).then_some(0),
        max_message_size: None,
        offered_capabilities: None,
        desired_capabilities: None,
        properties: None,
    }))
}

/// Attach for link `name` on `handle`, sent by a peer playing `role`.
#[must_use]
pub fn attach(name: &str, handle: u32, role: Role) -> Performative {
    link_attach(name, handle, role, TargetKind::Target(Target::with_address(name)))
}

/// Attach for a controller link: a sender whose target is a coordinator.
#[must_use]
pub fn attach_controller(name: &str, handle: u32) -> Performative {
    link_attach(
        name,
        handle,
        Role::Sender,
        TargetKind::Coordinator(Coordinator::default()),
    )
}

/// Link flow granting `credit` at `delivery_count` on `handle`.
#[must_use]
pub const fn credit(handle: u32, delivery_count: u32, credit: u32) -> Performative {
    Performative::Flow(Flow {
        next_incoming_id: Some(0),
        incoming_window: WIDE_WINDOW,
        next_outgoing_id: 0,
        outgoing_window: WIDE_WINDOW,
        handle: Some(handle),
        delivery_count: Some(delivery_count),
        link_credit: Some(credit),
        available: None,
        drain: false,
        echo: false,
        properties: None,
    })
}

/// Session flow opening `incoming_window` frames past `next_incoming_id`,
/// carrying `credit` for `handle` at delivery count zero.
#[must_use]
pub const fn window(
    handle: u32,
    credit: u32,
    next_incoming_id: u32,
    incoming_window: u32,
) -> Performative {
    Performative::Flow(Flow {
        next_incoming_id: Some(next_incoming_id),
        incoming_window,
        next_outgoing_id: 0,
        outgoing_window: WIDE_WINDOW,
        handle: Some(handle),
        delivery_count: Some(0),
        link_credit: Some(credit),
        available: None,
        drain: false,
        echo: false,
        properties: None,
    })
}

/// First frame of a delivery.
#[must_use]
pub fn transfer(handle: u32, delivery_id: u32, tag: &'static [u8]) -> Transfer {
    Transfer {
        handle,
        delivery_id: Some(delivery_id),
        delivery_tag: Some(Bytes::from_static(tag)),
        message_format: Some(0),
        ..Transfer::default()
    }
}

/// Disposition for `first..=last`, sent by a peer playing `role`.
#[must_use]
pub const fn disposition(
    role: Role,
    first: u32,
    last: u32,
    settled: bool,
    state: Option<DeliveryState>,
) -> Performative {
    Performative::Disposition(Disposition {
        role,
        first,
        last: Some(last),
        settled,
        state,
        batchable: false,
    })
}

/// Detach of `handle`.
#[must_use]
pub const fn detach(handle: u32, closed: bool) -> Performative {
    Performative::Detach(Detach {
        handle,
        closed,
        error: None,
    })
}

/// End without an error.
#[must_use]
pub const fn end() -> Performative { Performative::End(End { error: None }) }

/// Close, optionally carrying `error`.
#[must_use]
pub const fn close(error: Option<ErrorCondition>) -> Performative {
    Performative::Close(Close { error })
}
