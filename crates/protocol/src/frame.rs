//! Command frames and the operator/command opcode space.
//!
//! A frame is `(operator, command, payload)`. The operator addresses a
//! subsystem, the command an operation within it. Framing is positional:
//! the payload carries no length prefix, so decoding relies on the schema
//! table registered for the opcode pair (see [`crate::schema`]).

use glam::{Quat, Vec3, Vec4};

use crate::buffer::CommandBuffer;
use crate::error::ProtocolError;
use crate::schema::schema_for;
use crate::wire::WireValue;
use crate::ProtocolResult;

/// Subsystem addressed by a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operator {
    /// Object creation commands (director → backend).
    Creation = 0,
    /// Property/state modification commands (director → backend).
    Modification = 1,
    /// Scene query commands (director → backend).
    Query = 2,
    /// Object teardown commands (director → backend).
    Cleanup = 3,
    /// Simulation results (backend → director).
    Report = 4,
    /// Virtual character controller commands.
    Character = 5,
}

impl Operator {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Operator::Creation,
            1 => Operator::Modification,
            2 => Operator::Query,
            3 => Operator::Cleanup,
            4 => Operator::Report,
            5 => Operator::Character,
            _ => return None,
        })
    }
}

/// Command ids under [`Operator::Creation`].
pub mod creation {
    pub const CREATE_BODY: u8 = 0;
}

/// Simulation class of a body, as encoded in creation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Dynamic,
    Static,
    Kinematic,
}

impl BodyKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BodyKind::Dynamic,
            1 => BodyKind::Static,
            2 => BodyKind::Kinematic,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            BodyKind::Dynamic => 0,
            BodyKind::Static => 1,
            BodyKind::Kinematic => 2,
        }
    }
}

/// Command ids under [`Operator::Modification`].
pub mod modification {
    pub const SET_TRANSFORM: u8 = 0;
    pub const SET_LINEAR_VELOCITY: u8 = 1;
    pub const SET_ANGULAR_VELOCITY: u8 = 2;
    pub const APPLY_IMPULSE: u8 = 3;
    pub const SET_GRAVITY: u8 = 4;
}

/// Command ids under [`Operator::Query`].
pub mod query {
    pub const RAYCAST: u8 = 0;
}

/// Command ids under [`Operator::Cleanup`].
pub mod cleanup {
    pub const DESTROY_BODY: u8 = 0;
    pub const DESTROY_ALL: u8 = 1;
}

/// Command ids under [`Operator::Report`].
pub mod report {
    pub const BODY_POSE: u8 = 0;
    pub const RAYCAST_HIT: u8 = 1;
    /// The backend tripped its fatal flag; no further results will come.
    pub const FATAL: u8 = 2;
}

/// Command ids under [`Operator::Character`].
pub mod character {
    pub const UPDATE_CONTROLLER: u8 = 0;
}

/// A decoded (or to-be-encoded) command frame.
///
/// Fields appear in schema order; `None` marks an absent optional field.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub operator: Operator,
    pub command: u8,
    pub fields: Vec<Option<WireValue>>,
}

impl Frame {
    pub fn new(operator: Operator, command: u8) -> Self {
        Self {
            operator,
            command,
            fields: Vec::new(),
        }
    }

    /// Appends a required field.
    pub fn push(mut self, value: impl Into<WireValue>) -> Self {
        self.fields.push(Some(value.into()));
        self
    }

    /// Appends an optional field.
    pub fn push_opt<T: Into<WireValue>>(mut self, value: Option<T>) -> Self {
        self.fields.push(value.map(Into::into));
        self
    }

    fn value_at(&self, index: usize) -> ProtocolResult<&WireValue> {
        self.fields
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(ProtocolError::SchemaMismatch("field index out of range or absent"))
    }

    pub fn is_present(&self, index: usize) -> bool {
        matches!(self.fields.get(index), Some(Some(_)))
    }

    pub fn u8_at(&self, index: usize) -> ProtocolResult<u8> {
        match self.value_at(index)? {
            WireValue::U8(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected u8 field")),
        }
    }

    pub fn u16_at(&self, index: usize) -> ProtocolResult<u16> {
        match self.value_at(index)? {
            WireValue::U16(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected u16 field")),
        }
    }

    pub fn u32_at(&self, index: usize) -> ProtocolResult<u32> {
        match self.value_at(index)? {
            WireValue::U32(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected u32 field")),
        }
    }

    pub fn i32_at(&self, index: usize) -> ProtocolResult<i32> {
        match self.value_at(index)? {
            WireValue::I32(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected i32 field")),
        }
    }

    pub fn f32_at(&self, index: usize) -> ProtocolResult<f32> {
        match self.value_at(index)? {
            WireValue::F32(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected f32 field")),
        }
    }

    pub fn bool_at(&self, index: usize) -> ProtocolResult<bool> {
        match self.value_at(index)? {
            WireValue::Bool(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected bool field")),
        }
    }

    pub fn vec3_at(&self, index: usize) -> ProtocolResult<Vec3> {
        match self.value_at(index)? {
            WireValue::Vector3(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected vector field")),
        }
    }

    pub fn quat_at(&self, index: usize) -> ProtocolResult<Quat> {
        match self.value_at(index)? {
            WireValue::Quaternion(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected quaternion field")),
        }
    }

    pub fn plane_at(&self, index: usize) -> ProtocolResult<Vec4> {
        match self.value_at(index)? {
            WireValue::Plane(v) => Ok(*v),
            _ => Err(ProtocolError::SchemaMismatch("expected plane field")),
        }
    }

    pub fn opt_f32_at(&self, index: usize) -> ProtocolResult<Option<f32>> {
        if self.is_present(index) {
            Ok(Some(self.f32_at(index)?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_u16_at(&self, index: usize) -> ProtocolResult<Option<u16>> {
        if self.is_present(index) {
            Ok(Some(self.u16_at(index)?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_u32_at(&self, index: usize) -> ProtocolResult<Option<u32>> {
        if self.is_present(index) {
            Ok(Some(self.u32_at(index)?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_vec3_at(&self, index: usize) -> ProtocolResult<Option<Vec3>> {
        if self.is_present(index) {
            Ok(Some(self.vec3_at(index)?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_quat_at(&self, index: usize) -> ProtocolResult<Option<Quat>> {
        if self.is_present(index) {
            Ok(Some(self.quat_at(index)?))
        } else {
            Ok(None)
        }
    }
}

impl CommandBuffer {
    /// Encodes a whole frame against its schema.
    ///
    /// The schema table supplies field order and optionality, so the write
    /// sequence is always the mirror image of [`CommandBuffer::read_frame`].
    /// If the buffer is full and resize is disabled, the frame is rolled
    /// back in one piece (never a torn frame) and the write is dropped per
    /// the configured data-loss policy.
    ///
    /// # Errors
    /// Returns [`ProtocolError::SchemaMismatch`] when the frame's fields do
    /// not match the schema, and [`ProtocolError::UnknownCommand`] when no
    /// schema is registered for the opcode pair.
    pub fn write_frame(&mut self, frame: &Frame) -> ProtocolResult<()> {
        let schema = schema_for(frame.operator, frame.command).ok_or(
            ProtocolError::UnknownCommand {
                operator: frame.operator,
                command: frame.command,
            },
        )?;
        if frame.fields.len() != schema.fields.len() {
            return Err(ProtocolError::SchemaMismatch("field count mismatch"));
        }
        for (spec, field) in schema.fields.iter().zip(&frame.fields) {
            match field {
                Some(value) => {
                    if value.wire_type() != spec.ty {
                        return Err(ProtocolError::SchemaMismatch("field type mismatch"));
                    }
                }
                None => {
                    if !spec.optional {
                        return Err(ProtocolError::SchemaMismatch("required field absent"));
                    }
                }
            }
        }

        let mark = self.mark();
        self.write_operator(frame.operator as u8);
        self.write_command(frame.command);
        for (spec, field) in schema.fields.iter().zip(&frame.fields) {
            if spec.optional {
                self.write_flag(field.is_some());
            }
            if let Some(value) = field {
                self.write_value(value);
            }
        }
        if self.write_dropped_since(&mark) {
            self.truncate_to(mark);
        }
        Ok(())
    }

    /// Decodes the next frame against its schema.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownOperator`] / [`ProtocolError::UnknownCommand`]
    /// for an unrecognized opcode (the caller must abort the rest of the
    /// message: field boundaries after an unknown frame cannot be known),
    /// and [`ProtocolError::StreamDesync`] when the read cursor runs past
    /// the written region.
    pub fn read_frame(&mut self) -> ProtocolResult<Frame> {
        let op_id = self.read_operator()?;
        let operator = Operator::from_u8(op_id).ok_or(ProtocolError::UnknownOperator(op_id))?;
        let command = self.read_command()?;
        let schema =
            schema_for(operator, command).ok_or(ProtocolError::UnknownCommand { operator, command })?;

        let mut fields = Vec::with_capacity(schema.fields.len());
        for spec in schema.fields {
            let present = if spec.optional { self.flag()? } else { true };
            if present {
                fields.push(Some(self.read_value(spec.ty)?));
            } else {
                fields.push(None);
            }
        }
        Ok(Frame {
            operator,
            command,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_with_optionals() {
        let mut cb = CommandBuffer::new(128, true);
        let frame = Frame::new(Operator::Creation, creation::CREATE_BODY)
            .push(7u32)
            .push(0u8)
            .push(Vec3::new(0.0, 10.0, 0.0))
            .push(Quat::IDENTITY)
            .push_opt(Some(2.5f32))
            .push_opt(None::<Vec3>)
            .push_opt(None::<u16>);
        cb.write_frame(&frame).unwrap();
        assert_eq!(cb.commands_count(), 1);

        let decoded = cb.read_frame().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.u32_at(0).unwrap(), 7);
        assert_eq!(decoded.opt_f32_at(4).unwrap(), Some(2.5));
        assert_eq!(decoded.opt_vec3_at(5).unwrap(), None);
    }

    #[test]
    fn test_frame_schema_validation() {
        let mut cb = CommandBuffer::new(64, true);
        // Wrong arity.
        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_BODY);
        assert_eq!(
            cb.write_frame(&frame),
            Err(ProtocolError::SchemaMismatch("field count mismatch"))
        );
        // Wrong type.
        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_BODY).push(1.5f32);
        assert_eq!(
            cb.write_frame(&frame),
            Err(ProtocolError::SchemaMismatch("field type mismatch"))
        );
    }

    #[test]
    fn test_unknown_operator_is_protocol_error() {
        let mut cb = CommandBuffer::new(64, true);
        cb.write_operator(200);
        cb.write_command(0);
        assert_eq!(cb.read_frame(), Err(ProtocolError::UnknownOperator(200)));
    }

    #[test]
    fn test_full_buffer_rolls_back_whole_frame() {
        // Room for one DestroyBody frame (1 + 1 + 4 bytes) but not two.
        let mut cb = CommandBuffer::new(8, false);
        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_BODY).push(1u32);
        cb.write_frame(&frame).unwrap();
        let written = cb.written_len();

        let frame = Frame::new(Operator::Cleanup, cleanup::DESTROY_BODY).push(2u32);
        cb.write_frame(&frame).unwrap();
        // Second frame dropped in one piece.
        assert_eq!(cb.written_len(), written);
        assert_eq!(cb.commands_count(), 1);

        let decoded = cb.read_frame().unwrap();
        assert_eq!(decoded.u32_at(0).unwrap(), 1);
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let mut cb = CommandBuffer::new(256, true);
        cb.write_frame(
            &Frame::new(Operator::Modification, modification::SET_GRAVITY)
                .push(Vec3::new(0.0, -9.81, 0.0)),
        )
        .unwrap();
        cb.write_frame(
            &Frame::new(Operator::Modification, modification::SET_LINEAR_VELOCITY)
                .push(3u32)
                .push(Vec3::X),
        )
        .unwrap();
        assert_eq!(cb.commands_count(), 2);

        let first = cb.read_frame().unwrap();
        assert_eq!(first.command, modification::SET_GRAVITY);
        let second = cb.read_frame().unwrap();
        assert_eq!(second.u32_at(0).unwrap(), 3);
        assert_eq!(second.vec3_at(1).unwrap(), Vec3::X);
    }
}
