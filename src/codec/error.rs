//! Error types for AMQP type decoding and frame validation.

use thiserror::Error;

/// Errors raised while decoding AMQP values, composites, and performatives.
///
/// The [`DecodeError::MissingField`] text is surfaced verbatim as the
/// description of the `amqp:decode-error` condition sent to the peer, so its
/// wording is part of the wire contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the encoded value was complete.
    #[error("unexpected end of input while decoding {0}")]
    UnexpectedEof(&'static str),
    /// A constructor byte that is not part of the AMQP type system.
    #[error("invalid format code 0x{0:02x}")]
    InvalidConstructor(u8),
    /// A string or symbol payload was not valid UTF-8.
    #[error("invalid UTF-8 in encoded {0}")]
    InvalidUtf8(&'static str),
    /// A `char` value outside the Unicode scalar range.
    #[error("invalid char code point {0:#x}")]
    InvalidChar(u32),
    /// A described type whose descriptor is not understood in this position.
    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),
    /// A value that should have been a described list was something else.
    #[error("expected a described list for the {0}")]
    NotAComposite(&'static str),
    /// A mandatory field was absent or encoded as null.
    #[error("The {field} field cannot be omitted from the {composite}")]
    MissingField {
        /// AMQP name of the omitted field.
        field: &'static str,
        /// Name of the composite (performative) being decoded.
        composite: &'static str,
    },
    /// A field was present but carried an incompatible type.
    #[error("The {field} field of the {composite} has an invalid type")]
    InvalidFieldType {
        /// AMQP name of the offending field.
        field: &'static str,
        /// Name of the composite (performative) being decoded.
        composite: &'static str,
    },
    /// An enumerated field carried a value outside its domain.
    #[error("The {field} field of the {composite} has an out of range value {value}")]
    InvalidFieldValue {
        /// AMQP name of the offending field.
        field: &'static str,
        /// Name of the composite being decoded.
        composite: &'static str,
        /// The raw value received.
        value: u64,
    },
    /// A frame carried a type code other than AMQP (0).
    #[error("unsupported frame type {0}")]
    UnsupportedFrameType(u8),
    /// Bytes followed a performative that does not carry a payload.
    #[error("the {0} performative does not carry a payload")]
    UnexpectedPayload(&'static str),
}

impl DecodeError {
    /// Build a [`DecodeError::MissingField`] for the given composite.
    #[must_use]
    pub const fn missing(field: &'static str, composite: &'static str) -> Self {
        Self::MissingField { field, composite }
    }

    /// Build a [`DecodeError::InvalidFieldType`] for the given composite.
    #[must_use]
    pub const fn invalid_type(field: &'static str, composite: &'static str) -> Self {
        Self::InvalidFieldType { field, composite }
    }
}
