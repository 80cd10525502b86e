//! AMQP 1.0 wire codec.
//!
//! Covers the type system values, the composite definitions and
//! performatives the engine exchanges, transaction control messages, and the
//! frame layer with its Tokio codec.

pub mod coordinator;
pub mod definitions;
pub mod error;
pub mod fields;
pub mod frame;
pub mod performative;
pub mod value;

pub use coordinator::{ControlMessage, Declare, Discharge};
pub use definitions::{
    Coordinator, DeliveryState, ErrorCondition, ReceiverSettleMode, Role, SenderSettleMode,
    Source, Target, TargetKind, condition,
};
pub use error::DecodeError;
pub use fields::Fields;
pub use frame::{FrameCodec, FrameError, FrameHeader, RawFrame};
pub use performative::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
    TransferFlags,
};
pub use value::{Descriptor, Symbol, Value};
