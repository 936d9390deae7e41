//! Wire protocol shared by the simulation director and the simulation backend.
//!
//! Every request and response exchanged across the execution boundary is a
//! [`CommandBuffer`]: a growable byte buffer holding a sequence of command
//! frames, each addressed by a two-level opcode (operator + command) and
//! followed by a fixed, schema-described list of typed payload fields.
//! Optional fields cost a single packed bit drawn from a shared bit cursor.
//!
//! The codec is deliberately positional: both sides must read exactly what
//! the other wrote, in order. The per-command schema tables in [`schema`]
//! exist so that pairing is enforced by one table instead of call-site
//! discipline.

/// Growable binary command buffer with write/read/bit cursors.
pub mod buffer;
/// Bridge configuration consumed by both sides of the boundary.
pub mod config;
/// Message envelope passed through the transport dispatcher.
pub mod envelope;
/// Protocol error types.
pub mod error;
/// Command frames and the operator/command opcode space.
pub mod frame;
/// Static payload schemas, one per (operator, command) pair.
pub mod schema;
/// Wire-level value types.
pub mod wire;

pub use buffer::{BufferPayload, CommandBuffer, SharedBytes};
pub use config::{BridgeSettings, SettingsError};
pub use envelope::{Envelope, MessageKind, Origin, SharedBufferPair};
pub use error::ProtocolError;
pub use frame::{BodyKind, Frame, Operator};
pub use schema::{schema_for, CommandSchema, FieldSpec};
pub use wire::{WireType, WireValue};

/// Result alias for protocol-level operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
