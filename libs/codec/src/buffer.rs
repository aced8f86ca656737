//! Cursor-based I/O buffer
//!
//! ## Purpose
//!
//! [`IoBuffer`] is the unit of I/O and of frame construction. It carries a
//! position/limit pair over a fixed-length backing vector:
//!
//! ```text
//! write mode:  [ written .......... | free ........................ ]
//!              0                 position                     limit = capacity
//!
//! read mode:   [ consumed | readable ............... | stale ...... ]
//!              0       position                    limit        capacity
//! ```
//!
//! `flip()` switches from write mode to read mode, exposing exactly the bytes
//! written. Writes grow the backing storage on demand; reads fail with
//! [`BufferError::Underflow`] instead of reading past the limit.
//!
//! ## Ownership
//!
//! A buffer is move-only. Whoever holds it owns it, and dropping it (or calling
//! [`IoBuffer::release`]) hands the storage back to the pool it came from.
//! Because ownership is tracked by the compiler a buffer cannot be released
//! twice through this API; the pool keeps guard counters for everything else.
//!
//! All multi-byte integers are big-endian.

use crate::error::BufferError;
use crate::pool::PoolShared;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::sync::Arc;

/// Size-prefix value marking an absent byte sequence
pub const NULL_LENGTH: i32 = -1;

/// Growable byte buffer with independent read/write cursors
pub struct IoBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
    pool: Option<Arc<PoolShared>>,
}

impl IoBuffer {
    /// Create an unpooled buffer; its storage is freed on drop
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
            pool: None,
        }
    }

    /// Wrap storage handed out by a pool. `data.len()` is the capacity.
    pub(crate) fn pooled(data: Vec<u8>, pool: Arc<PoolShared>) -> Self {
        let limit = data.len();
        Self {
            data,
            position: 0,
            limit,
            pool: Some(pool),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Whether dropping this buffer returns storage to a pool
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.limit {
            return Err(BufferError::IndexOutOfBounds {
                index: position,
                width: 0,
                capacity: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn set_limit(&mut self, limit: usize) -> Result<(), BufferError> {
        if limit > self.data.len() {
            return Err(BufferError::IndexOutOfBounds {
                index: limit,
                width: 0,
                capacity: self.data.len(),
            });
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(())
    }

    /// Switch to read mode over the bytes written so far
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Reset to an empty write-mode buffer
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Re-read from the start without touching the limit
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Move unread bytes to the front and switch back to write mode
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.data.len();
    }

    /// Readable bytes (position..limit)
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Skip `count` readable bytes
    pub fn advance(&mut self, count: usize) -> Result<(), BufferError> {
        self.ensure_readable(count)?;
        self.position += count;
        Ok(())
    }

    /// Return the storage to its pool; equivalent to dropping the buffer
    pub fn release(self) {}

    fn ensure_writable(&mut self, count: usize) {
        let needed = self.position + count;
        if needed > self.data.len() {
            let grown = (self.data.len() * 2).max(needed).max(16);
            self.data.resize(grown, 0);
        }
        if needed > self.limit {
            self.limit = self.data.len();
        }
    }

    fn ensure_readable(&self, count: usize) -> Result<(), BufferError> {
        if self.remaining() < count {
            return Err(BufferError::Underflow {
                needed: count,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn check_index(&self, index: usize, width: usize) -> Result<(), BufferError> {
        if index + width > self.data.len() {
            return Err(BufferError::IndexOutOfBounds {
                index,
                width,
                capacity: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) {
        self.ensure_writable(1);
        self.data[self.position] = value;
        self.position += 1;
    }

    pub fn write_i32(&mut self, value: i32) {
        self.ensure_writable(4);
        BigEndian::write_i32(&mut self.data[self.position..], value);
        self.position += 4;
    }

    pub fn write_u32(&mut self, value: u32) {
        self.ensure_writable(4);
        BigEndian::write_u32(&mut self.data[self.position..], value);
        self.position += 4;
    }

    pub fn write_i64(&mut self, value: i64) {
        self.ensure_writable(8);
        BigEndian::write_i64(&mut self.data[self.position..], value);
        self.position += 8;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    /// Write an i32 size prefix followed by the bytes; `None` writes [`NULL_LENGTH`]
    pub fn write_sized_bytes(&mut self, bytes: Option<&[u8]>) -> Result<(), BufferError> {
        match bytes {
            Some(bytes) => {
                self.write_i32(size_prefix(bytes.len())?);
                self.write_bytes(bytes);
            }
            None => self.write_i32(NULL_LENGTH),
        }
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), BufferError> {
        self.write_sized_bytes(Some(value.as_bytes()))
    }

    /// Overwrite four bytes at an absolute index without moving the cursor
    pub fn put_u32_at(&mut self, index: usize, value: u32) -> Result<(), BufferError> {
        self.check_index(index, 4)?;
        BigEndian::write_u32(&mut self.data[index..], value);
        Ok(())
    }

    pub fn put_i32_at(&mut self, index: usize, value: i32) -> Result<(), BufferError> {
        self.check_index(index, 4)?;
        BigEndian::write_i32(&mut self.data[index..], value);
        Ok(())
    }

    pub fn get_i32_at(&self, index: usize) -> Result<i32, BufferError> {
        self.check_index(index, 4)?;
        Ok(BigEndian::read_i32(&self.data[index..]))
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        self.ensure_readable(1)?;
        let value = self.data[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        self.ensure_readable(4)?;
        let value = BigEndian::read_i32(&self.data[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        self.ensure_readable(4)?;
        let value = BigEndian::read_u32(&self.data[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        self.ensure_readable(8)?;
        let value = BigEndian::read_i64(&self.data[self.position..]);
        self.position += 8;
        Ok(value)
    }

    /// Borrow the next `count` readable bytes and advance past them
    pub fn read_slice(&mut self, count: usize) -> Result<&[u8], BufferError> {
        self.ensure_readable(count)?;
        let start = self.position;
        self.position += count;
        Ok(&self.data[start..start + count])
    }

    /// Counterpart of [`IoBuffer::write_sized_bytes`]
    pub fn read_sized_bytes(&mut self) -> Result<Option<Vec<u8>>, BufferError> {
        let length = self.read_i32()?;
        if length == NULL_LENGTH {
            return Ok(None);
        }
        if length < 0 {
            return Err(BufferError::InvalidLength { length });
        }
        Ok(Some(self.read_slice(length as usize)?.to_vec()))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, BufferError> {
        match self.read_sized_bytes()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| BufferError::InvalidUtf8),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

fn size_prefix(length: usize) -> Result<i32, BufferError> {
    i32::try_from(length).map_err(|_| BufferError::TooLarge { length })
}
