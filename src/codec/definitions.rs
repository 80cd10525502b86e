//! Composite types shared by performatives: roles, settle modes, error
//! conditions, termini and delivery states.

use bytes::Bytes;

use super::{
    error::DecodeError,
    fields::{FieldReader, Fields, FromValue, ListBuilder},
    value::{Descriptor, Symbol, Value},
};

/// Numeric descriptors with their symbolic aliases.
pub(crate) mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const RECEIVED: u64 = 0x23;
    pub const ACCEPTED: u64 = 0x24;
    pub const REJECTED: u64 = 0x25;
    pub const RELEASED: u64 = 0x26;
    pub const MODIFIED: u64 = 0x27;
    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;
    pub const COORDINATOR: u64 = 0x30;
    pub const DECLARE: u64 = 0x31;
    pub const DISCHARGE: u64 = 0x32;
    pub const DECLARED: u64 = 0x33;
    pub const TRANSACTIONAL_STATE: u64 = 0x34;
    pub const DATA: u64 = 0x75;
    pub const AMQP_VALUE: u64 = 0x77;

    pub const NAMES: &[(u64, &str)] = &[
        (OPEN, "amqp:open:list"),
        (BEGIN, "amqp:begin:list"),
        (ATTACH, "amqp:attach:list"),
        (FLOW, "amqp:flow:list"),
        (TRANSFER, "amqp:transfer:list"),
        (DISPOSITION, "amqp:disposition:list"),
        (DETACH, "amqp:detach:list"),
        (END, "amqp:end:list"),
        (CLOSE, "amqp:close:list"),
        (ERROR, "amqp:error:list"),
        (RECEIVED, "amqp:received:list"),
        (ACCEPTED, "amqp:accepted:list"),
        (REJECTED, "amqp:rejected:list"),
        (RELEASED, "amqp:released:list"),
        (MODIFIED, "amqp:modified:list"),
        (SOURCE, "amqp:source:list"),
        (TARGET, "amqp:target:list"),
        (COORDINATOR, "amqp:coordinator:list"),
        (DECLARE, "amqp:declare:list"),
        (DISCHARGE, "amqp:discharge:list"),
        (DECLARED, "amqp:declared:list"),
        (TRANSACTIONAL_STATE, "amqp:transactional-state:list"),
        (DATA, "amqp:data:binary"),
        (AMQP_VALUE, "amqp:amqp-value:*"),
    ];
}

/// Resolve a numeric or symbolic descriptor to its numeric code.
pub(crate) fn canonical_code(desc: &Descriptor) -> Option<u64> {
    match desc {
        Descriptor::Code(code) => Some(*code),
        Descriptor::Name(name) => descriptor::NAMES
            .iter()
            .find(|(_, alias)| name.as_str() == *alias)
            .map(|(code, _)| *code),
    }
}

/// Standard AMQP error condition symbols.
pub mod condition {
    /// An internal error occurred.
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    /// A peer attempted to work with a remote entity that does not exist.
    pub const NOT_FOUND: &str = "amqp:not-found";
    /// A peer attempted to work with a remote entity it has no access to.
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    /// Data could not be decoded.
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    /// A peer exceeded its resource allocation.
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    /// The peer tried to use a frame in a manner that is inconsistent.
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    /// An invalid field was passed in a frame body.
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    /// The peer tried to use functionality that is not implemented.
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    /// The client attempted to work with a locked resource.
    pub const RESOURCE_LOCKED: &str = "amqp:resource-locked";
    /// A precondition was not met.
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    /// A resource was deleted while in use.
    pub const RESOURCE_DELETED: &str = "amqp:resource-deleted";
    /// The peer sent a frame that is not permitted in the current state.
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    /// The peer could not encode a frame within its frame size.
    pub const FRAME_SIZE_TOO_SMALL: &str = "amqp:frame-size-too-small";
    /// An operator intervened to close the connection.
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    /// A valid frame header cannot be formed from the incoming bytes.
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    /// The container is no longer available on this connection.
    pub const REDIRECT: &str = "amqp:connection:redirect";
    /// The peer violated incoming window for the session.
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    /// Input was received for a link that was detached with an error.
    pub const ERRANT_LINK: &str = "amqp:session:errant-link";
    /// An attach was received using a handle that is already in use.
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    /// A frame referenced a handle that is not attached.
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    /// An operator intervened to detach for some reason.
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    /// The peer sent more message transfers than currently allowed.
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    /// The peer sent a larger message than is supported on the link.
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    /// The address provided cannot be resolved to a terminus.
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    /// The link has been attached elsewhere.
    pub const STOLEN: &str = "amqp:link:stolen";
    /// The specified transaction id does not exist.
    pub const TRANSACTION_UNKNOWN_ID: &str = "amqp:transaction:unknown-id";
    /// The transaction was rolled back for an unspecified reason.
    pub const TRANSACTION_ROLLBACK: &str = "amqp:transaction:rollback";
    /// The work represented by this transaction took too long.
    pub const TRANSACTION_TIMEOUT: &str = "amqp:transaction:timeout";
}

/// Link endpoint role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends deliveries (`false` on the wire).
    Sender,
    /// Receives deliveries (`true` on the wire).
    Receiver,
}

impl Role {
    /// Wire encoding of the role.
    #[must_use]
    pub const fn as_bool(self) -> bool { matches!(self, Self::Receiver) }

    /// The role of the peer's endpoint on the same link.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl FromValue for Role {
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError> {
        Ok(if bool::from_value(value, field, composite)? { Self::Receiver } else { Self::Sender })
    }
}

impl From<Role> for Value {
    fn from(value: Role) -> Self { Self::Bool(value.as_bool()) }
}

/// Settlement policy for a sender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled.
    Unsettled,
    /// Deliveries are sent pre-settled.
    Settled,
    /// The sender may send either.
    #[default]
    Mixed,
}

/// Settlement policy for a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// The receiver settles spontaneously.
    #[default]
    First,
    /// The receiver settles only after the sender has settled.
    Second,
}

macro_rules! ubyte_enum {
    ($ty:ident { $($variant:ident = $raw:literal),+ }) => {
        impl FromValue for $ty {
            fn from_value(
                value: Value,
                field: &'static str,
                composite: &'static str,
            ) -> Result<Self, DecodeError> {
                match u8::from_value(value, field, composite)? {
                    $($raw => Ok(Self::$variant),)+
                    other => Err(DecodeError::InvalidFieldValue {
                        field,
                        composite,
                        value: u64::from(other),
                    }),
                }
            }
        }

        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Self::Ubyte(match value {
                    $($ty::$variant => $raw,)+
                })
            }
        }
    };
}

ubyte_enum!(SenderSettleMode { Unsettled = 0, Settled = 1, Mixed = 2 });
ubyte_enum!(ReceiverSettleMode { First = 0, Second = 1 });

/// An error condition carried by Close, End, Detach and Rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorCondition {
    /// Symbolic condition such as `amqp:decode-error`.
    pub condition: Symbol,
    /// Free-text description.
    pub description: Option<String>,
    /// Supplementary information.
    pub info: Option<Fields>,
}

impl ErrorCondition {
    /// Build a condition with a description.
    #[must_use]
    pub fn new(condition: impl Into<Symbol>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }

    /// Build a condition without a description.
    #[must_use]
    pub fn bare(condition: impl Into<Symbol>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }

    /// Encode as a described list.
    #[must_use]
    pub fn to_value(&self) -> Value {
        ListBuilder::new()
            .push(self.condition.clone())
            .opt(self.description.clone())
            .opt(self.info.clone())
            .describe(descriptor::ERROR)
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl FromValue for ErrorCondition {
    fn from_value(value: Value, _: &'static str, _: &'static str) -> Result<Self, DecodeError> {
        let mut r = FieldReader::described("Error", descriptor::ERROR, value)?;
        Ok(Self {
            condition: r.required("condition")?,
            description: r.optional("description")?,
            info: r.optional("info")?,
        })
    }
}

/// Link source terminus.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Source {
    /// Address of the source node.
    pub address: Option<String>,
    /// Terminus durability (0 none, 1 configuration, 2 unsettled state).
    pub durable: u32,
    /// Expiry policy symbol.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: u32,
    /// Request a dynamically created node.
    pub dynamic: bool,
    /// Properties of the dynamically created node.
    pub dynamic_node_properties: Option<Fields>,
    /// Distribution mode (`move` or `copy`).
    pub distribution_mode: Option<Symbol>,
    /// Filter set.
    pub filter: Option<Fields>,
    /// Outcome applied to unsettled deliveries on link close.
    pub default_outcome: Option<DeliveryState>,
    /// Outcomes supported by the source.
    pub outcomes: Option<Vec<Symbol>>,
    /// Extension capabilities.
    pub capabilities: Option<Vec<Symbol>>,
}

impl Source {
    /// A source bound to `address`.
    #[must_use]
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Encode as a described list.
    #[must_use]
    pub fn to_value(&self) -> Value {
        ListBuilder::new()
            .opt(self.address.clone())
            .push(self.durable)
            .opt(self.expiry_policy.clone())
            .push(self.timeout)
            .push(self.dynamic)
            .opt(self.dynamic_node_properties.clone())
            .opt(self.distribution_mode.clone())
            .opt(self.filter.clone())
            .push(self.default_outcome.as_ref().map_or(Value::Null, DeliveryState::to_value))
            .opt(self.outcomes.clone())
            .opt(self.capabilities.clone())
            .describe(descriptor::SOURCE)
    }
}

impl FromValue for Source {
    fn from_value(value: Value, _: &'static str, _: &'static str) -> Result<Self, DecodeError> {
        let mut r = FieldReader::described("Source", descriptor::SOURCE, value)?;
        Ok(Self {
            address: r.optional("address")?,
            durable: r.or_default("durable")?,
            expiry_policy: r.optional("expiry-policy")?,
            timeout: r.or_default("timeout")?,
            dynamic: r.or_default("dynamic")?,
            dynamic_node_properties: r.optional("dynamic-node-properties")?,
            distribution_mode: r.optional("distribution-mode")?,
            filter: r.optional("filter")?,
            default_outcome: r.optional("default-outcome")?,
            outcomes: r.optional("outcomes")?,
            capabilities: r.optional("capabilities")?,
        })
    }
}

/// Link target terminus.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Target {
    /// Address of the target node.
    pub address: Option<String>,
    /// Terminus durability.
    pub durable: u32,
    /// Expiry policy symbol.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: u32,
    /// Request a dynamically created node.
    pub dynamic: bool,
    /// Properties of the dynamically created node.
    pub dynamic_node_properties: Option<Fields>,
    /// Extension capabilities.
    pub capabilities: Option<Vec<Symbol>>,
}

impl Target {
    /// A target bound to `address`.
    #[must_use]
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .opt(self.address.clone())
            .push(self.durable)
            .opt(self.expiry_policy.clone())
            .push(self.timeout)
            .push(self.dynamic)
            .opt(self.dynamic_node_properties.clone())
            .opt(self.capabilities.clone())
            .describe(descriptor::TARGET)
    }

    fn decode(value: Value) -> Result<Self, DecodeError> {
        let mut r = FieldReader::described("Target", descriptor::TARGET, value)?;
        Ok(Self {
            address: r.optional("address")?,
            durable: r.or_default("durable")?,
            expiry_policy: r.optional("expiry-policy")?,
            timeout: r.or_default("timeout")?,
            dynamic: r.or_default("dynamic")?,
            dynamic_node_properties: r.optional("dynamic-node-properties")?,
            capabilities: r.optional("capabilities")?,
        })
    }
}

/// Target of a transaction control link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Coordinator {
    /// Transaction capabilities such as `amqp:local-transactions`.
    pub capabilities: Option<Vec<Symbol>>,
}

/// Either kind of link target.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetKind {
    /// An ordinary node.
    Target(Target),
    /// A transaction coordinator.
    Coordinator(Coordinator),
}

impl TargetKind {
    /// Return `true` when this target is a coordinator.
    #[must_use]
    pub const fn is_coordinator(&self) -> bool { matches!(self, Self::Coordinator(_)) }

    /// Encode as a described list.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Target(target) => target.to_value(),
            Self::Coordinator(coordinator) => ListBuilder::new()
                .opt(coordinator.capabilities.clone())
                .describe(descriptor::COORDINATOR),
        }
    }
}

impl From<Target> for TargetKind {
    fn from(value: Target) -> Self { Self::Target(value) }
}

impl From<Coordinator> for TargetKind {
    fn from(value: Coordinator) -> Self { Self::Coordinator(value) }
}

impl FromValue for TargetKind {
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError> {
        let Value::Described(desc, _) = &value else {
            return Err(DecodeError::invalid_type(field, composite));
        };
        match canonical_code(desc) {
            Some(descriptor::COORDINATOR) => {
                let mut r = FieldReader::described("Coordinator", descriptor::COORDINATOR, value)?;
                Ok(Self::Coordinator(Coordinator {
                    capabilities: r.optional("capabilities")?,
                }))
            }
            _ => Target::decode(value).map(Self::Target),
        }
    }
}

/// Delivery state, covering outcomes and transactional states.
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryState {
    /// Partial progress through a delivery.
    Received {
        /// Section reached.
        section_number: u32,
        /// Offset within the section.
        section_offset: u64,
    },
    /// Successfully processed.
    Accepted,
    /// Invalid and unprocessable.
    Rejected(Option<ErrorCondition>),
    /// Not (and will not be) processed.
    Released,
    /// Modified and returned to the source.
    Modified {
        /// Count the attempt as a delivery failure.
        delivery_failed: bool,
        /// Do not redeliver to this link.
        undeliverable_here: bool,
        /// Annotations to merge into the message.
        message_annotations: Option<Fields>,
    },
    /// A transaction was declared with this id.
    Declared {
        /// Transaction identifier assigned by the resource.
        txn_id: Bytes,
    },
    /// Work performed within a transaction.
    Transactional {
        /// Transaction the work belongs to.
        txn_id: Bytes,
        /// Provisional outcome.
        outcome: Option<Box<DeliveryState>>,
    },
}

impl DeliveryState {
    /// Outcomes end the sender's interest in a delivery; `Received` does not.
    #[must_use]
    pub const fn is_terminal(&self) -> bool { !matches!(self, Self::Received { .. }) }

    /// Encode as a described list.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Received {
                section_number,
                section_offset,
            } => ListBuilder::new()
                .push(*section_number)
                .push(*section_offset)
                .describe(descriptor::RECEIVED),
            Self::Accepted => ListBuilder::new().describe(descriptor::ACCEPTED),
            Self::Rejected(error) => ListBuilder::new()
                .push(error.as_ref().map_or(Value::Null, ErrorCondition::to_value))
                .describe(descriptor::REJECTED),
            Self::Released => ListBuilder::new().describe(descriptor::RELEASED),
            Self::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => ListBuilder::new()
                .push(*delivery_failed)
                .push(*undeliverable_here)
                .opt(message_annotations.clone())
                .describe(descriptor::MODIFIED),
            Self::Declared { txn_id } => ListBuilder::new()
                .push(txn_id.clone())
                .describe(descriptor::DECLARED),
            Self::Transactional { txn_id, outcome } => ListBuilder::new()
                .push(txn_id.clone())
                .push(outcome.as_deref().map_or(Value::Null, Self::to_value))
                .describe(descriptor::TRANSACTIONAL_STATE),
        }
    }
}

impl FromValue for DeliveryState {
    fn from_value(
        value: Value,
        field: &'static str,
        composite: &'static str,
    ) -> Result<Self, DecodeError> {
        let Value::Described(desc, _) = &value else {
            return Err(DecodeError::invalid_type(field, composite));
        };
        let Some(code) = canonical_code(desc) else {
            return Err(DecodeError::UnknownDescriptor(desc.to_string()));
        };
        let state = match code {
            descriptor::RECEIVED => {
                let mut r = FieldReader::described("Received", code, value)?;
                Self::Received {
                    section_number: r.required("section-number")?,
                    section_offset: r.required("section-offset")?,
                }
            }
            descriptor::ACCEPTED => {
                FieldReader::described("Accepted", code, value)?;
                Self::Accepted
            }
            descriptor::REJECTED => {
                let mut r = FieldReader::described("Rejected", code, value)?;
                Self::Rejected(r.optional("error")?)
            }
            descriptor::RELEASED => {
                FieldReader::described("Released", code, value)?;
                Self::Released
            }
            descriptor::MODIFIED => {
                let mut r = FieldReader::described("Modified", code, value)?;
                Self::Modified {
                    delivery_failed: r.or_default("delivery-failed")?,
                    undeliverable_here: r.or_default("undeliverable-here")?,
                    message_annotations: r.optional("message-annotations")?,
                }
            }
            descriptor::DECLARED => {
                let mut r = FieldReader::described("Declared", code, value)?;
                Self::Declared {
                    txn_id: r.required("txn-id")?,
                }
            }
            descriptor::TRANSACTIONAL_STATE => {
                let mut r = FieldReader::described("TransactionalState", code, value)?;
                Self::Transactional {
                    txn_id: r.required("txn-id")?,
                    outcome: r.optional::<Self>("outcome")?.map(Box::new),
                }
            }
            _ => return Err(DecodeError::UnknownDescriptor(desc.to_string())),
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn decode<T: FromValue>(value: Value) -> Result<T, DecodeError> {
        T::from_value(value, "field", "Test")
    }

    #[rstest]
    #[case(DeliveryState::Accepted)]
    #[case(DeliveryState::Released)]
    #[case(DeliveryState::Rejected(Some(ErrorCondition::new(condition::NOT_FOUND, "gone"))))]
    #[case(DeliveryState::Declared { txn_id: Bytes::from_static(b"txn-1") })]
    #[case(DeliveryState::Transactional {
        txn_id: Bytes::from_static(b"txn-1"),
        outcome: Some(Box::new(DeliveryState::Accepted)),
    })]
    fn delivery_states_decode_from_their_encoding(#[case] state: DeliveryState) {
        assert_eq!(decode::<DeliveryState>(state.to_value()), Ok(state));
    }

    #[test]
    fn symbolic_descriptor_resolves_delivery_state() {
        let value = Value::Described(
            Box::new(Descriptor::Name(Symbol::from("amqp:accepted:list"))),
            Box::new(Value::List(Vec::new())),
        );
        assert_eq!(decode::<DeliveryState>(value), Ok(DeliveryState::Accepted));
    }

    #[test]
    fn coordinator_target_is_distinguished() {
        let coordinator = TargetKind::Coordinator(Coordinator {
            capabilities: Some(vec![Symbol::from("amqp:local-transactions")]),
        });
        let decoded = decode::<TargetKind>(coordinator.to_value());
        assert!(decoded.as_ref().is_ok_and(TargetKind::is_coordinator));
        assert_eq!(decoded, Ok(coordinator));
    }

    #[test]
    fn error_condition_requires_condition() {
        let value = Value::described(descriptor::ERROR, Value::List(Vec::new()));
        assert_eq!(
            decode::<ErrorCondition>(value),
            Err(DecodeError::missing("condition", "Error"))
        );
    }

    #[test]
    fn settle_mode_out_of_range_is_rejected() {
        assert!(matches!(
            decode::<SenderSettleMode>(Value::Ubyte(7)),
            Err(DecodeError::InvalidFieldValue { value: 7, .. })
        ));
    }
}
