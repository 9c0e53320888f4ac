//! Growable byte buffer with a single read/write cursor
//!
//! All multi-byte integers on the ed2k wire are little-endian. Strings are a
//! u16 length followed by raw bytes, hashes are exactly 16 raw bytes.

use bytes::{Buf, BufMut};
use anyhow::Result;

use crate::error::Ed2kError;

/// Default allocation for write cursors
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default factor used when a write does not fit
pub const GROW_FACTOR: f64 = 2.0;

/// Byte array plus position. Invariant: `position <= len()`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteCursor {
    buffer: Vec<u8>,
    position: usize,
}

impl ByteCursor {
    /// Create an empty write cursor with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty write cursor with `size` zeroed bytes allocated
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size],
            position: 0,
        }
    }

    /// Create a read cursor over a copy of `data`, positioned at 0
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Create a read cursor owning `data`, positioned at 0
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buffer: data,
            position: 0,
        }
    }

    /// Allocated length
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current position
    pub fn tell(&self) -> usize {
        self.position
    }

    /// Move the cursor. Seeking past the end is an error.
    pub fn seek(&mut self, position: usize) -> Result<&mut Self> {
        if position > self.buffer.len() {
            return Err(Ed2kError::protocol_error_with_source(
                "Seek beyond buffer end",
                format!("position {} > length {}", position, self.buffer.len()),
            )
            .into());
        }
        self.position = position;
        Ok(self)
    }

    /// Bytes between the cursor and the end of the allocation
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Reallocate to `ceil(len * factor)` bytes, keeping `[0, position)`.
    ///
    /// Returns the new length.
    pub fn grow(&mut self, factor: f64) -> usize {
        let current = self.buffer.len().max(1);
        let new_size = ((current as f64) * factor).ceil() as usize;
        let new_size = new_size.max(self.position);
        let mut grown = vec![0u8; new_size];
        grown[..self.position].copy_from_slice(&self.buffer[..self.position]);
        self.buffer = grown;
        self.buffer.len()
    }

    /// New cursor over a copy of `[from, from + len)`, positioned at 0
    pub fn slice(&self, from: usize, len: usize) -> Result<ByteCursor> {
        let end = from.checked_add(len).filter(|&end| end <= self.buffer.len());
        match end {
            Some(end) => Ok(ByteCursor::from_bytes(&self.buffer[from..end])),
            None => Err(Ed2kError::protocol_error_with_source(
                "Slice out of range",
                format!("from {} len {} buffer {}", from, len, self.buffer.len()),
            )
            .into()),
        }
    }

    /// Bytes written so far, `[0, position)`
    pub fn written(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    /// Unread bytes, `[position, len)`
    pub fn unread(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    /// Whole allocation regardless of position
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the cursor, keeping `[0, position)`
    pub fn into_written(mut self) -> Vec<u8> {
        self.buffer.truncate(self.position);
        self.buffer
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Ed2kError::protocol_error_with_source(
                "Read past end of message",
                format!("need {} bytes at {}, {} left", n, self.position, self.remaining()),
            )
            .into());
        }
        Ok(())
    }

    fn reserve(&mut self, n: usize) {
        while self.remaining() < n {
            self.grow(GROW_FACTOR);
        }
    }

    // ==================== Reads ====================

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let value = (&self.buffer[self.position..]).get_u16_le();
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let value = (&self.buffer[self.position..]).get_u32_le();
        self.position += 4;
        Ok(value)
    }

    /// 64-bit value sent as two little-endian u32 halves, low half first
    pub fn read_u64(&mut self) -> Result<u64> {
        let lo = self.read_u32()? as u64;
        let hi = self.read_u32()? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.require(n)?;
        let bytes = self.buffer[self.position..self.position + n].to_vec();
        self.position += n;
        Ok(bytes)
    }

    pub fn read_hash(&mut self) -> Result<[u8; 16]> {
        self.require(16)?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&self.buffer[self.position..self.position + 16]);
        self.position += 16;
        Ok(hash)
    }

    /// Read `n` raw bytes as a string
    pub fn read_string_exact(&mut self, n: usize) -> Result<String> {
        let raw = self.read_bytes(n)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// u16 length + bytes
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        self.read_string_exact(len)
    }

    /// Everything from the cursor to the end
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.buffer[self.position..].to_vec();
        self.position = self.buffer.len();
        rest
    }

    // ==================== Writes ====================

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.reserve(1);
        self.buffer[self.position] = value;
        self.position += 1;
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.reserve(2);
        (&mut self.buffer[self.position..]).put_u16_le(value);
        self.position += 2;
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.reserve(4);
        (&mut self.buffer[self.position..]).put_u32_le(value);
        self.position += 4;
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_u32(value as u32);
        self.write_u32((value >> 32) as u32)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.reserve(data.len());
        self.buffer[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
        self
    }

    pub fn write_hash(&mut self, hash: &[u8; 16]) -> &mut Self {
        self.write_bytes(hash)
    }

    /// u16 length + bytes. Strings longer than u16::MAX are truncated.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let raw = value.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.write_u16(len as u16);
        self.write_bytes(&raw[..len])
    }
}
