//! Engine error taxonomy.
//!
//! [`EngineError`] keeps caller mistakes apart from a dead connection:
//! usage errors leave the engine untouched and may be retried with a valid
//! call, while [`EngineError::Failed`] means only `shutdown` remains useful.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::{
    codec::{DecodeError, ErrorCondition},
    preamble::HeaderError,
};

/// Why an engine failed. Stored on the engine and handed to the error event.
#[derive(Clone, Debug, Error)]
pub enum EngineFailure {
    /// A frame could not be decoded or violated a mandatory-field contract.
    #[error("frame decoding failed: {0}")]
    Decode(#[from] DecodeError),
    /// The peer's protocol header did not match.
    #[error("malformed AMQP header: {0}")]
    MalformedHeader(#[from] HeaderError),
    /// The peer violated the protocol in a way the engine answered with a
    /// connection close carrying this condition.
    #[error("protocol violation: {0}")]
    Protocol(ErrorCondition),
    /// The output sink failed.
    #[error("I/O failure: {0}")]
    Io(Arc<io::Error>),
    /// No frame arrived within the local idle timeout.
    #[error("local idle timeout expired")]
    IdleTimeout,
    /// A failure reported by the caller through `engine_failed`.
    #[error("{0}")]
    Injected(String),
}

impl From<io::Error> for EngineFailure {
    fn from(value: io::Error) -> Self { Self::Io(Arc::new(value)) }
}

/// Errors returned by public engine operations.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    /// The call is not valid in the endpoint's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// An argument does not belong to this endpoint or is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The engine has not been started.
    #[error("engine not started")]
    NotStarted,
    /// The engine has been shut down.
    #[error("engine shut down")]
    Shutdown,
    /// The engine failed; only shutdown remains.
    #[error("engine failed: {0}")]
    Failed(#[from] EngineFailure),
}

impl EngineError {
    /// Return `true` for errors caused by an invalid local call.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidOperation(_) | Self::InvalidArgument(_))
    }

    pub(crate) fn invalid_op(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub(crate) fn invalid_arg(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Result alias for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
