//! Protocol error types.

use crate::frame::Operator;

/// Errors raised by the command buffer codec and frame layer.
///
/// A [`ProtocolError::StreamDesync`] poisons the remainder of the message it
/// occurred in: once the read cursor disagrees with the write cursor, no
/// later field in the same buffer can be trusted, so callers must abort
/// decoding the whole message rather than skip the offending command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("read of {wanted} bytes at offset {offset} passes the write cursor at {written}")]
    StreamDesync {
        offset: usize,
        wanted: usize,
        written: usize,
    },

    #[error("unknown operator id {0}")]
    UnknownOperator(u8),

    #[error("unknown command id {command} for operator {operator:?}")]
    UnknownCommand { operator: Operator, command: u8 },

    #[error("frame does not match schema: {0}")]
    SchemaMismatch(&'static str),

    #[error("buffer storage is detached (in flight to the other side)")]
    Detached,

    #[error("buffer payload mode does not match this buffer's storage")]
    StorageMismatch,
}
