//! Atomic single-key session operations and their wire records.

pub mod operation;
pub mod state;
pub mod wire;

pub use operation::{Applied, OperationKind, OperationResult, SessionOperation};
pub use state::SessionState;
pub use wire::{
    SESSION_FACTORY_ID, WireRecord, decode_operation, decode_record, decode_state,
    encode_operation, encode_state,
};
