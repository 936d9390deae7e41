//! Wire-level value types.
//!
//! Every payload field on the wire is one of these types. Multi-byte scalars
//! are little-endian; vectors, quaternions and planes are consecutive `f32`
//! components. Booleans never occupy a byte of their own: they are packed
//! into shared flag bytes managed by the buffer's bit cursor.

use glam::{Quat, Vec3, Vec4};

/// Declared type of a single payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U8,
    U16,
    U32,
    I32,
    F32,
    /// Packed boolean; consumes one bit of a shared flag byte.
    Bool,
    /// Three consecutive `f32` components.
    Vector3,
    /// Four consecutive `f32` components (x, y, z, w).
    Quaternion,
    /// Four consecutive `f32` components (normal xyz, distance).
    Plane,
}

impl WireType {
    /// Encoded size in bytes. `Bool` reports zero because packed flags are
    /// billed to the shared flag byte, not to the field itself.
    pub const fn byte_len(self) -> usize {
        match self {
            WireType::U8 => 1,
            WireType::U16 => 2,
            WireType::U32 | WireType::I32 | WireType::F32 => 4,
            WireType::Bool => 0,
            WireType::Vector3 => 12,
            WireType::Quaternion | WireType::Plane => 16,
        }
    }
}

/// A decoded payload field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Vector3(Vec3),
    Quaternion(Quat),
    Plane(Vec4),
}

impl WireValue {
    /// The wire type this value encodes as.
    pub const fn wire_type(&self) -> WireType {
        match self {
            WireValue::U8(_) => WireType::U8,
            WireValue::U16(_) => WireType::U16,
            WireValue::U32(_) => WireType::U32,
            WireValue::I32(_) => WireType::I32,
            WireValue::F32(_) => WireType::F32,
            WireValue::Bool(_) => WireType::Bool,
            WireValue::Vector3(_) => WireType::Vector3,
            WireValue::Quaternion(_) => WireType::Quaternion,
            WireValue::Plane(_) => WireType::Plane,
        }
    }
}

impl From<u8> for WireValue {
    fn from(v: u8) -> Self {
        WireValue::U8(v)
    }
}

impl From<u16> for WireValue {
    fn from(v: u16) -> Self {
        WireValue::U16(v)
    }
}

impl From<u32> for WireValue {
    fn from(v: u32) -> Self {
        WireValue::U32(v)
    }
}

impl From<i32> for WireValue {
    fn from(v: i32) -> Self {
        WireValue::I32(v)
    }
}

impl From<f32> for WireValue {
    fn from(v: f32) -> Self {
        WireValue::F32(v)
    }
}

impl From<bool> for WireValue {
    fn from(v: bool) -> Self {
        WireValue::Bool(v)
    }
}

impl From<Vec3> for WireValue {
    fn from(v: Vec3) -> Self {
        WireValue::Vector3(v)
    }
}

impl From<Quat> for WireValue {
    fn from(v: Quat) -> Self {
        WireValue::Quaternion(v)
    }
}

impl From<Vec4> for WireValue {
    fn from(v: Vec4) -> Self {
        WireValue::Plane(v)
    }
}
