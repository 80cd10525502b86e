//! Transaction control messages carried to a coordinator.
//!
//! Declare and Discharge travel as the `amqp-value` body section of a message
//! sent on a link whose target is a [`Coordinator`](super::Coordinator).

use bytes::Bytes;

use super::{
    definitions::{canonical_code, descriptor},
    error::DecodeError,
    fields::{FieldReader, ListBuilder},
    value::Value,
};

/// Request to declare a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Declare {
    /// Global transaction id; distributed transactions are not supported.
    pub global_id: Option<Bytes>,
}

/// Request to end a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discharge {
    /// Transaction being discharged.
    pub txn_id: Bytes,
    /// Roll back instead of committing.
    pub fail: bool,
}

/// A decoded coordinator control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// See [`Declare`].
    Declare(Declare),
    /// See [`Discharge`].
    Discharge(Discharge),
}

impl ControlMessage {
    /// Encode as a complete message payload with an `amqp-value` body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let body = match self {
            Self::Declare(declare) => ListBuilder::new()
                .opt(declare.global_id.clone())
                .describe(descriptor::DECLARE),
            Self::Discharge(discharge) => ListBuilder::new()
                .push(discharge.txn_id.clone())
                .push(discharge.fail)
                .describe(descriptor::DISCHARGE),
        };
        Value::described(descriptor::AMQP_VALUE, body).to_bytes()
    }

    /// Decode the `amqp-value` section of a message payload, skipping any
    /// preceding sections.
    ///
    /// # Errors
    /// Returns a [`DecodeError`] if no section holds a Declare or Discharge.
    pub fn decode(payload: Bytes) -> Result<Self, DecodeError> {
        let mut src = payload;
        while !src.is_empty() {
            let Value::Described(section, body) = Value::decode(&mut src)? else {
                return Err(DecodeError::NotAComposite("message section"));
            };
            if canonical_code(&section) == Some(descriptor::AMQP_VALUE) {
                return Self::from_value(*body);
            }
        }
        Err(DecodeError::UnexpectedEof("amqp-value section"))
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Described(desc, _) = &value else {
            return Err(DecodeError::NotAComposite("coordinator control message"));
        };
        match canonical_code(desc) {
            Some(descriptor::DECLARE) => {
                let mut r = FieldReader::described("Declare", descriptor::DECLARE, value)?;
                Ok(Self::Declare(Declare {
                    global_id: r.optional("global-id")?,
                }))
            }
            Some(descriptor::DISCHARGE) => {
                let mut r = FieldReader::described("Discharge", descriptor::DISCHARGE, value)?;
                Ok(Self::Discharge(Discharge {
                    txn_id: r.required("txn-id")?,
                    fail: r.or_default("fail")?,
                }))
            }
            _ => Err(DecodeError::UnknownDescriptor(desc.to_string())),
        }
    }
}
