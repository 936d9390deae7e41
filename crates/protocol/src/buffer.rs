//! Growable binary command buffer.
//!
//! A [`CommandBuffer`] owns a byte buffer plus four cursors: the write
//! offset, the read offset, a bit cursor for packed boolean flags on each
//! side, and a count of framed commands. Writes append typed values at the
//! write offset; reads consume them in the exact same order. The bit
//! cursors pack up to eight optional-field flags into one shared byte.
//!
//! Storage is either owned (transfer mode: the `Vec<u8>` moves with the
//! message and comes home in a later message's `in_buffer`) or shared
//! (both sides hold a view of the same memory and only lengths cross the
//! boundary). Single-flight dispatch keeps the shared lock uncontended.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use glam::{Quat, Vec3, Vec4};
use tracing::warn;

use crate::error::ProtocolError;
use crate::wire::{WireType, WireValue};
use crate::ProtocolResult;

/// Capacity growth factor applied when a write overflows (rounded up, and
/// never less than the shortfall).
const GROWTH_NUM: usize = 3;
const GROWTH_DEN: usize = 2;

/// Byte storage visible to both sides of the boundary without a handoff.
#[derive(Clone, Debug)]
pub struct SharedBytes(Arc<Mutex<Vec<u8>>>);

impl SharedBytes {
    /// Allocates zeroed shared storage of the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; capacity])))
    }

    /// Returns another view of the same storage. No bytes are copied and
    /// ownership does not move.
    pub fn share_view(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn len(&self) -> usize {
        self.with(|b| b.len())
    }
}

/// Underlying storage of a command buffer.
#[derive(Debug)]
enum Storage {
    /// Exclusively owned bytes; may be moved into a message.
    Owned(Vec<u8>),
    /// A view of memory shared with the other side.
    Shared(SharedBytes),
    /// Owned bytes are currently in flight to the other side.
    Detached,
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Owned(v) => v.len(),
            Storage::Shared(s) => s.len(),
            Storage::Detached => 0,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> ProtocolResult<R> {
        match self {
            Storage::Owned(v) => Ok(f(v)),
            Storage::Shared(s) => Ok(s.with(f)),
            Storage::Detached => Err(ProtocolError::Detached),
        }
    }

    fn with_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> ProtocolResult<R> {
        match self {
            Storage::Owned(v) => Ok(f(v)),
            Storage::Shared(s) => Ok(s.with_mut(|v| f(v))),
            Storage::Detached => Err(ProtocolError::Detached),
        }
    }

    fn grow(&mut self, new_len: usize) -> ProtocolResult<()> {
        match self {
            Storage::Owned(v) => {
                v.resize(new_len, 0);
                Ok(())
            }
            Storage::Shared(s) => {
                s.with_mut(|v| v.resize(new_len, 0));
                Ok(())
            }
            Storage::Detached => Err(ProtocolError::Detached),
        }
    }
}

/// Position of the currently open packed-flag byte.
#[derive(Clone, Copy, Debug, Default)]
struct BitCursor {
    byte_offset: usize,
    bit: u8,
    open: bool,
}

/// Snapshot of the write side, used to roll back a partially written frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WriteMark {
    write_offset: usize,
    write_bits: BitCursor,
    commands_count: u32,
    write_dropped: bool,
}

/// A command buffer's bytes as they travel inside a message envelope.
#[derive(Debug)]
pub enum BufferPayload {
    /// Ownership of the bytes moves with the message; the previous owner
    /// must not touch them until they come back in `in_buffer`.
    Transfer {
        bytes: Vec<u8>,
        len: usize,
        commands: u32,
    },
    /// The bytes live in shared storage; only cursor metadata crosses.
    Shared { len: usize, commands: u32 },
}

/// Growable binary encoder/decoder for command frames.
pub struct CommandBuffer {
    storage: Storage,
    write_offset: usize,
    read_offset: usize,
    write_bits: BitCursor,
    read_bits: BitCursor,
    commands_count: u32,
    allow_resize: bool,
    /// Capacity the buffer was created with. Storage handed off in
    /// flight regrows back to this even when resizing is disabled.
    base_capacity: usize,
    /// Set when any write since the last frame mark was dropped for lack
    /// of capacity.
    write_dropped: bool,
    dropped_writes: u64,
    warned_drop: bool,
    /// (len, commands) handed to the other side and not yet released.
    in_flight: Option<(usize, u32)>,
    side_buffers: Vec<Bytes>,
}

impl CommandBuffer {
    /// Creates an owned buffer of the given capacity.
    pub fn new(capacity: usize, allow_resize: bool) -> Self {
        Self::from_storage(Storage::Owned(vec![0; capacity]), allow_resize)
    }

    /// Creates a buffer over shared storage.
    pub fn with_shared(shared: SharedBytes, allow_resize: bool) -> Self {
        Self::from_storage(Storage::Shared(shared), allow_resize)
    }

    fn from_storage(storage: Storage, allow_resize: bool) -> Self {
        let base_capacity = storage.len();
        Self {
            storage,
            write_offset: 0,
            read_offset: 0,
            write_bits: BitCursor::default(),
            read_bits: BitCursor::default(),
            commands_count: 0,
            allow_resize,
            base_capacity,
            write_dropped: false,
            dropped_writes: 0,
            warned_drop: false,
            in_flight: None,
            side_buffers: Vec::new(),
        }
    }

    /// Returns a shareable view of the storage, if this buffer is shared.
    pub fn share_view(&self) -> Option<SharedBytes> {
        match &self.storage {
            Storage::Shared(s) => Some(s.share_view()),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn written_len(&self) -> usize {
        self.write_offset
    }

    pub fn commands_count(&self) -> u32 {
        self.commands_count
    }

    /// Total writes dropped because growth was disabled.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    /// True when anything has been written since the last reset.
    pub fn is_dirty(&self) -> bool {
        self.write_offset > 0 || self.commands_count > 0 || !self.side_buffers.is_empty()
    }

    /// Rewinds all cursors to the start of the buffer. Memory is not
    /// cleared; stale bytes past the cursors are never read.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.read_offset = 0;
        self.write_bits = BitCursor::default();
        self.read_bits = BitCursor::default();
        self.commands_count = 0;
        self.write_dropped = false;
        self.warned_drop = false;
        self.side_buffers.clear();
    }

    // ------------------------------------------------------------------
    // Write side
    // ------------------------------------------------------------------

    /// Makes room for `additional` bytes at the write offset, growing the
    /// storage when permitted. Returns false when the write must be
    /// dropped instead.
    fn ensure(&mut self, additional: usize) -> bool {
        let needed = self.write_offset + additional;
        let capacity = self.storage.len();
        if needed <= capacity {
            return true;
        }
        let target = if self.allow_resize {
            let grown = capacity * GROWTH_NUM / GROWTH_DEN + 1;
            Some(needed.max(grown))
        } else if needed <= self.base_capacity {
            // The storage was handed off in flight and left a smaller
            // vec behind; regrowing to the configured capacity is not a
            // resize.
            Some(self.base_capacity)
        } else {
            None
        };
        if let Some(new_len) = target {
            if self.storage.grow(new_len).is_ok() {
                return true;
            }
        }
        self.write_dropped = true;
        self.dropped_writes += 1;
        if !self.warned_drop {
            warn!(
                needed,
                capacity, "command buffer full and resize disabled; dropping writes"
            );
            self.warned_drop = true;
        }
        false
    }

    fn raw_write(&mut self, src: &[u8]) {
        if !self.ensure(src.len()) {
            return;
        }
        let at = self.write_offset;
        let ok = self
            .storage
            .with_mut(|b| b[at..at + src.len()].copy_from_slice(src))
            .is_ok();
        debug_assert!(ok, "write against detached storage");
        if ok {
            self.write_offset += src.len();
        } else {
            self.write_dropped = true;
        }
    }

    /// Starts a new command frame addressed to the given subsystem.
    pub fn write_operator(&mut self, id: u8) {
        self.write_u8(id);
        self.commands_count += 1;
    }

    pub fn write_command(&mut self, id: u8) {
        self.write_u8(id);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.raw_write(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.raw_write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.raw_write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.raw_write(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.raw_write(&v.to_le_bytes());
    }

    pub fn write_vec3(&mut self, v: Vec3) {
        let mut out = [0u8; 12];
        for (i, c) in v.to_array().into_iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
        }
        self.raw_write(&out);
    }

    pub fn write_quat(&mut self, v: Quat) {
        let mut out = [0u8; 16];
        for (i, c) in v.to_array().into_iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
        }
        self.raw_write(&out);
    }

    pub fn write_plane(&mut self, v: Vec4) {
        let mut out = [0u8; 16];
        for (i, c) in v.to_array().into_iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
        }
        self.raw_write(&out);
    }

    /// Appends a packed boolean flag. The first flag reserves a byte at
    /// the write offset; the next seven share it.
    pub fn write_flag(&mut self, present: bool) {
        if !self.write_bits.open || self.write_bits.bit == 8 {
            let at = self.write_offset;
            if !self.ensure(1) {
                return;
            }
            let ok = self.storage.with_mut(|b| b[at] = 0).is_ok();
            debug_assert!(ok, "write against detached storage");
            if !ok {
                self.write_dropped = true;
                return;
            }
            self.write_offset += 1;
            self.write_bits = BitCursor {
                byte_offset: at,
                bit: 0,
                open: true,
            };
        }
        if present {
            let (off, bit) = (self.write_bits.byte_offset, self.write_bits.bit);
            let _ = self.storage.with_mut(|b| b[off] |= 1 << bit);
        }
        self.write_bits.bit += 1;
    }

    pub fn write_value(&mut self, v: &WireValue) {
        match *v {
            WireValue::U8(x) => self.write_u8(x),
            WireValue::U16(x) => self.write_u16(x),
            WireValue::U32(x) => self.write_u32(x),
            WireValue::I32(x) => self.write_i32(x),
            WireValue::F32(x) => self.write_f32(x),
            WireValue::Bool(x) => self.write_flag(x),
            WireValue::Vector3(x) => self.write_vec3(x),
            WireValue::Quaternion(x) => self.write_quat(x),
            WireValue::Plane(x) => self.write_plane(x),
        }
    }

    /// Rolls the write cursor back by `bytes`, undoing a partially
    /// written frame. Closes the packed-flag byte if it falls past the
    /// new cursor.
    pub fn decrement(&mut self, bytes: usize) {
        self.write_offset = self.write_offset.saturating_sub(bytes);
        if self.write_bits.open && self.write_bits.byte_offset >= self.write_offset {
            self.write_bits = BitCursor::default();
        }
    }

    pub(crate) fn mark(&self) -> WriteMark {
        WriteMark {
            write_offset: self.write_offset,
            write_bits: self.write_bits,
            commands_count: self.commands_count,
            write_dropped: self.write_dropped,
        }
    }

    pub(crate) fn truncate_to(&mut self, mark: WriteMark) {
        self.write_offset = mark.write_offset;
        self.write_bits = mark.write_bits;
        self.commands_count = mark.commands_count;
        self.write_dropped = mark.write_dropped;
    }

    /// True when a write since `mark` was dropped for lack of capacity.
    pub(crate) fn write_dropped_since(&self, mark: &WriteMark) -> bool {
        self.write_dropped && !mark.write_dropped
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    fn take_read<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        if self.read_offset + N > self.write_offset {
            debug_assert!(
                false,
                "read of {} bytes at {} passes write cursor {}",
                N, self.read_offset, self.write_offset
            );
            return Err(ProtocolError::StreamDesync {
                offset: self.read_offset,
                wanted: N,
                written: self.write_offset,
            });
        }
        let at = self.read_offset;
        let out = self.storage.with(|b| {
            let mut a = [0u8; N];
            a.copy_from_slice(&b[at..at + N]);
            a
        })?;
        self.read_offset += N;
        Ok(out)
    }

    /// Reads the operator id opening the next command frame.
    pub fn read_operator(&mut self) -> ProtocolResult<u8> {
        self.read_u8()
    }

    pub fn read_command(&mut self) -> ProtocolResult<u8> {
        self.read_u8()
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take_read::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        Ok(u16::from_le_bytes(self.take_read::<2>()?))
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        Ok(u32::from_le_bytes(self.take_read::<4>()?))
    }

    pub fn read_i32(&mut self) -> ProtocolResult<i32> {
        Ok(i32::from_le_bytes(self.take_read::<4>()?))
    }

    pub fn read_f32(&mut self) -> ProtocolResult<f32> {
        Ok(f32::from_le_bytes(self.take_read::<4>()?))
    }

    pub fn read_vec3(&mut self) -> ProtocolResult<Vec3> {
        let raw = self.take_read::<12>()?;
        let c = |i: usize| f32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        Ok(Vec3::new(c(0), c(1), c(2)))
    }

    pub fn read_quat(&mut self) -> ProtocolResult<Quat> {
        let raw = self.take_read::<16>()?;
        let c = |i: usize| f32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        Ok(Quat::from_xyzw(c(0), c(1), c(2), c(3)))
    }

    pub fn read_plane(&mut self) -> ProtocolResult<Vec4> {
        let raw = self.take_read::<16>()?;
        let c = |i: usize| f32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        Ok(Vec4::new(c(0), c(1), c(2), c(3)))
    }

    /// Reads the next packed boolean flag. Must be called exactly once
    /// per optional field, in declaration order.
    pub fn flag(&mut self) -> ProtocolResult<bool> {
        if !self.read_bits.open || self.read_bits.bit == 8 {
            let at = self.read_offset;
            if at + 1 > self.write_offset {
                debug_assert!(false, "flag read at {} passes write cursor {}", at, self.write_offset);
                return Err(ProtocolError::StreamDesync {
                    offset: at,
                    wanted: 1,
                    written: self.write_offset,
                });
            }
            self.read_offset += 1;
            self.read_bits = BitCursor {
                byte_offset: at,
                bit: 0,
                open: true,
            };
        }
        let byte = self.storage.with(|b| b[self.read_bits.byte_offset])?;
        let v = byte & (1 << self.read_bits.bit) != 0;
        self.read_bits.bit += 1;
        Ok(v)
    }

    pub fn read_value(&mut self, ty: WireType) -> ProtocolResult<WireValue> {
        Ok(match ty {
            WireType::U8 => WireValue::U8(self.read_u8()?),
            WireType::U16 => WireValue::U16(self.read_u16()?),
            WireType::U32 => WireValue::U32(self.read_u32()?),
            WireType::I32 => WireValue::I32(self.read_i32()?),
            WireType::F32 => WireValue::F32(self.read_f32()?),
            WireType::Bool => WireValue::Bool(self.flag()?),
            WireType::Vector3 => WireValue::Vector3(self.read_vec3()?),
            WireType::Quaternion => WireValue::Quaternion(self.read_quat()?),
            WireType::Plane => WireValue::Plane(self.read_plane()?),
        })
    }

    /// Advances the read cursor past `count` values of `element_size`
    /// bytes without materializing them.
    pub fn skip(&mut self, count: usize, element_size: usize) -> ProtocolResult<()> {
        let bytes = count * element_size;
        if self.read_offset + bytes > self.write_offset {
            return Err(ProtocolError::StreamDesync {
                offset: self.read_offset,
                wanted: bytes,
                written: self.write_offset,
            });
        }
        self.read_offset += bytes;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Side buffers
    // ------------------------------------------------------------------

    /// Attaches an auxiliary byte payload (e.g. mesh geometry) travelling
    /// alongside the framed command stream.
    pub fn add_buffer(&mut self, bytes: Bytes) {
        self.side_buffers.push(bytes);
    }

    /// Takes the auxiliary payloads collected since the last dispatch.
    pub fn take_side_buffers(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.side_buffers)
    }

    // ------------------------------------------------------------------
    // Boundary handoff
    // ------------------------------------------------------------------

    /// Packages the written commands for delivery.
    ///
    /// Owned storage moves out (transfer mode) and is replaced by an empty
    /// vec that later writes regrow to the configured capacity on demand;
    /// shared storage stays put and only cursor metadata crosses. Either
    /// way the written region is recorded as in flight until
    /// [`CommandBuffer::complete_flight`].
    pub fn to_payload(&mut self) -> ProtocolResult<BufferPayload> {
        match &self.storage {
            Storage::Shared(_) => {
                let payload = BufferPayload::Shared {
                    len: self.write_offset,
                    commands: self.commands_count,
                };
                self.in_flight = Some((self.write_offset, self.commands_count));
                // The open packed-flag byte belongs to the sent prefix;
                // close it so flags written mid-flight open a fresh byte
                // past the in-flight region.
                self.write_bits = BitCursor::default();
                Ok(payload)
            }
            Storage::Owned(_) => {
                let bytes = match std::mem::replace(&mut self.storage, Storage::Owned(Vec::new())) {
                    Storage::Owned(v) => v,
                    _ => unreachable!(),
                };
                let payload = BufferPayload::Transfer {
                    bytes,
                    len: self.write_offset,
                    commands: self.commands_count,
                };
                self.in_flight = Some((self.write_offset, self.commands_count));
                self.write_offset = 0;
                self.read_offset = 0;
                self.write_bits = BitCursor::default();
                self.read_bits = BitCursor::default();
                self.commands_count = 0;
                Ok(payload)
            }
            Storage::Detached => Err(ProtocolError::Detached),
        }
    }

    /// Completes the in-flight dispatch begun by [`CommandBuffer::to_payload`].
    ///
    /// In transfer mode, `returned` is the storage coming home via the
    /// response's `in_buffer`; it is re-adopted when nothing was written in
    /// the meantime, so steady-state ticks reuse one allocation. In shared
    /// mode the sent prefix is released and any commands appended while the
    /// round trip was in flight slide down to the front.
    pub fn complete_flight(&mut self, returned: Option<Vec<u8>>) {
        let Some((sent_len, sent_commands)) = self.in_flight.take() else {
            return;
        };
        let dirty = self.is_dirty();
        match &mut self.storage {
            Storage::Shared(shared) => {
                if self.write_offset > sent_len {
                    let tail = self.write_offset - sent_len;
                    shared.with_mut(|b| b.copy_within(sent_len..sent_len + tail, 0));
                    self.write_offset = tail;
                    self.commands_count -= sent_commands;
                    if self.write_bits.open {
                        if self.write_bits.byte_offset >= sent_len {
                            // Rebase the cursor along with the tail it
                            // points into.
                            self.write_bits.byte_offset -= sent_len;
                        } else {
                            self.write_bits = BitCursor::default();
                        }
                    }
                } else {
                    self.write_offset = 0;
                    self.commands_count = 0;
                    self.write_bits = BitCursor::default();
                }
                self.read_offset = 0;
                self.read_bits = BitCursor::default();
            }
            Storage::Owned(current) => {
                if let Some(returned) = returned {
                    if !dirty && current.len() < returned.len() {
                        *current = returned;
                    }
                }
            }
            Storage::Detached => {}
        }
    }

    /// Adopts a freshly delivered payload for decoding.
    pub fn adopt(&mut self, payload: BufferPayload) -> ProtocolResult<()> {
        let (len, commands) = match payload {
            BufferPayload::Transfer {
                bytes,
                len,
                commands,
            } => {
                self.storage = Storage::Owned(bytes);
                (len, commands)
            }
            BufferPayload::Shared { len, commands } => {
                if !matches!(self.storage, Storage::Shared(_)) {
                    return Err(ProtocolError::StorageMismatch);
                }
                (len, commands)
            }
        };
        self.write_offset = len;
        self.read_offset = 0;
        self.write_bits = BitCursor::default();
        self.read_bits = BitCursor::default();
        self.commands_count = commands;
        Ok(())
    }

    /// Extracts owned storage so it can be handed back to its sender via
    /// `in_buffer`. Returns `None` for shared storage.
    pub fn take_transfer(&mut self) -> Option<Vec<u8>> {
        match &self.storage {
            Storage::Owned(_) => {
                let bytes = match std::mem::replace(&mut self.storage, Storage::Owned(Vec::new())) {
                    Storage::Owned(v) => v,
                    _ => unreachable!(),
                };
                self.reset();
                Some(bytes)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("capacity", &self.capacity())
            .field("write_offset", &self.write_offset)
            .field("read_offset", &self.read_offset)
            .field("commands_count", &self.commands_count)
            .field("dropped_writes", &self.dropped_writes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_buffer() -> CommandBuffer {
        CommandBuffer::new(64, true)
    }

    #[test]
    fn test_scalar_roundtrip() {
        let mut cb = roundtrip_buffer();
        cb.write_u8(0);
        cb.write_u8(u8::MAX);
        cb.write_u16(u16::MAX);
        cb.write_u32(0);
        cb.write_u32(u32::MAX);
        cb.write_i32(i32::MIN);
        cb.write_f32(f32::MIN_POSITIVE);
        cb.write_f32(-3.4e38);

        assert_eq!(cb.read_u8().unwrap(), 0);
        assert_eq!(cb.read_u8().unwrap(), u8::MAX);
        assert_eq!(cb.read_u16().unwrap(), u16::MAX);
        assert_eq!(cb.read_u32().unwrap(), 0);
        assert_eq!(cb.read_u32().unwrap(), u32::MAX);
        assert_eq!(cb.read_i32().unwrap(), i32::MIN);
        assert_eq!(cb.read_f32().unwrap(), f32::MIN_POSITIVE);
        assert_eq!(cb.read_f32().unwrap(), -3.4e38);
    }

    #[test]
    fn test_composite_roundtrip() {
        let mut cb = roundtrip_buffer();
        let v = Vec3::new(1.0, -2.5, 1e-8);
        let q = Quat::from_xyzw(0.1, 0.2, 0.3, 0.9).normalize();
        let p = Vec4::new(0.0, 1.0, 0.0, -4.25);
        cb.write_vec3(v);
        cb.write_quat(q);
        cb.write_plane(p);
        assert_eq!(cb.read_vec3().unwrap(), v);
        assert_eq!(cb.read_quat().unwrap(), q);
        assert_eq!(cb.read_plane().unwrap(), p);
    }

    #[test]
    fn test_flag_packing_across_byte_boundaries() {
        for n in [1usize, 7, 8, 9, 64] {
            let mut cb = CommandBuffer::new(256, true);
            let flags: Vec<bool> = (0..n).map(|i| i % 3 == 0).collect();
            for &f in &flags {
                cb.write_flag(f);
            }
            // Flag bytes are shared: n flags use ceil(n/8) bytes.
            assert_eq!(cb.written_len(), n.div_ceil(8), "n = {n}");
            for (i, &f) in flags.iter().enumerate() {
                assert_eq!(cb.flag().unwrap(), f, "n = {n}, flag {i}");
            }
        }
    }

    #[test]
    fn test_flags_interleaved_with_values() {
        let mut cb = roundtrip_buffer();
        cb.write_flag(true);
        cb.write_u32(7);
        cb.write_flag(false);
        cb.write_flag(true);
        cb.write_f32(1.5);

        assert!(cb.flag().unwrap());
        assert_eq!(cb.read_u32().unwrap(), 7);
        assert!(!cb.flag().unwrap());
        assert!(cb.flag().unwrap());
        assert_eq!(cb.read_f32().unwrap(), 1.5);
    }

    #[test]
    fn test_growth_preserves_written_bytes() {
        let mut cb = CommandBuffer::new(8, true);
        let before = cb.capacity();
        for i in 0..16u32 {
            cb.write_u32(i);
        }
        assert!(cb.capacity() >= 64);
        assert!(cb.capacity() >= before * 3 / 2);
        for i in 0..16u32 {
            assert_eq!(cb.read_u32().unwrap(), i);
        }
    }

    #[test]
    fn test_growth_disabled_drops_writes_without_corruption() {
        let mut cb = CommandBuffer::new(8, false);
        cb.write_u32(11);
        cb.write_u32(22);
        cb.write_u32(33); // no room, dropped
        assert_eq!(cb.capacity(), 8);
        assert_eq!(cb.written_len(), 8);
        assert_eq!(cb.dropped_writes(), 1);
        assert_eq!(cb.read_u32().unwrap(), 11);
        assert_eq!(cb.read_u32().unwrap(), 22);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_read_past_write_cursor_is_desync() {
        let mut cb = roundtrip_buffer();
        cb.write_u8(1);
        cb.read_u8().unwrap();
        assert!(matches!(
            cb.read_u32(),
            Err(ProtocolError::StreamDesync { .. })
        ));
    }

    #[test]
    fn test_skip_and_decrement() {
        let mut cb = roundtrip_buffer();
        cb.write_u32(1);
        cb.write_f32(2.0);
        cb.write_u32(3);
        cb.skip(2, 4).unwrap();
        assert_eq!(cb.read_u32().unwrap(), 3);

        cb.decrement(4);
        assert_eq!(cb.written_len(), 8);
    }

    #[test]
    fn test_transfer_payload_round_trip() {
        let mut sender = CommandBuffer::new(32, true);
        sender.write_u32(99);
        let payload = sender.to_payload().unwrap();

        let mut receiver = CommandBuffer::new(0, true);
        receiver.adopt(payload).unwrap();
        assert_eq!(receiver.read_u32().unwrap(), 99);

        let home = receiver.take_transfer().unwrap();
        assert_eq!(home.len(), 32);
        sender.complete_flight(Some(home));
        // Original capacity was re-adopted.
        assert_eq!(sender.capacity(), 32);
    }

    #[test]
    fn test_shared_payload_round_trip() {
        let storage = SharedBytes::with_capacity(64);
        let mut sender = CommandBuffer::with_shared(storage.share_view(), true);
        let mut receiver = CommandBuffer::with_shared(storage, true);

        sender.write_u32(1234);
        let payload = sender.to_payload().unwrap();
        receiver.adopt(payload).unwrap();
        assert_eq!(receiver.read_u32().unwrap(), 1234);

        sender.complete_flight(None);
        assert_eq!(sender.written_len(), 0);
    }

    #[test]
    fn test_shared_mode_keeps_commands_appended_in_flight() {
        let storage = SharedBytes::with_capacity(64);
        let mut sender = CommandBuffer::with_shared(storage.share_view(), true);
        let mut receiver = CommandBuffer::with_shared(storage, true);

        sender.write_u32(1);
        let payload = sender.to_payload().unwrap();
        // A consumer issues a command while the round trip is in flight.
        sender.write_u32(2);

        receiver.adopt(payload).unwrap();
        assert_eq!(receiver.read_u32().unwrap(), 1);

        sender.complete_flight(None);
        assert_eq!(sender.written_len(), 4);
        let next = sender.to_payload().unwrap();
        receiver.adopt(next).unwrap();
        assert_eq!(receiver.read_u32().unwrap(), 2);
    }

    #[test]
    fn test_shared_mode_flags_written_in_flight_use_a_fresh_byte() {
        let storage = SharedBytes::with_capacity(64);
        let mut sender = CommandBuffer::with_shared(storage.share_view(), true);
        let mut receiver = CommandBuffer::with_shared(storage, true);

        sender.write_operator(1);
        sender.write_flag(true);
        sender.write_u32(7);
        let payload = sender.to_payload().unwrap();

        // Flags appended mid-flight must not touch the half-used flag
        // byte inside the sent prefix.
        sender.write_operator(1);
        sender.write_flag(false);
        sender.write_flag(true);
        sender.write_u32(9);

        receiver.adopt(payload).unwrap();
        assert_eq!(receiver.read_operator().unwrap(), 1);
        assert!(receiver.flag().unwrap());
        assert_eq!(receiver.read_u32().unwrap(), 7);

        sender.complete_flight(None);
        let next = sender.to_payload().unwrap();
        receiver.adopt(next).unwrap();
        assert_eq!(receiver.read_operator().unwrap(), 1);
        assert!(!receiver.flag().unwrap());
        assert!(receiver.flag().unwrap());
        assert_eq!(receiver.read_u32().unwrap(), 9);
    }

    #[test]
    fn test_transfer_mode_writes_in_flight_regrow_without_resize() {
        let mut sender = CommandBuffer::new(64, false);
        sender.write_operator(2);
        sender.write_u32(1);
        let payload = sender.to_payload().unwrap();
        let home = match payload {
            BufferPayload::Transfer { bytes, .. } => bytes,
            BufferPayload::Shared { .. } => unreachable!(),
        };

        // Commands issued while the round trip is in flight land in the
        // regrown buffer instead of being dropped.
        sender.write_operator(2);
        sender.write_u32(8);
        assert_eq!(sender.dropped_writes(), 0);
        assert_eq!(sender.commands_count(), 1);
        assert_eq!(sender.capacity(), 64);

        sender.complete_flight(Some(home));
        let next = sender.to_payload().unwrap();
        let mut receiver = CommandBuffer::new(0, true);
        receiver.adopt(next).unwrap();
        assert_eq!(receiver.read_operator().unwrap(), 2);
        assert_eq!(receiver.read_u32().unwrap(), 8);
    }

    #[test]
    fn test_side_buffers_collected_not_inlined() {
        let mut cb = roundtrip_buffer();
        cb.write_u32(5);
        cb.add_buffer(Bytes::from_static(b"mesh-data"));
        assert_eq!(cb.written_len(), 4);
        let side = cb.take_side_buffers();
        assert_eq!(side.len(), 1);
        assert_eq!(side[0].as_ref(), b"mesh-data");
        assert!(cb.take_side_buffers().is_empty());
    }
}
