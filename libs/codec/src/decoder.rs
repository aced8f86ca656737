//! Incremental frame reassembly
//!
//! Socket reads deliver arbitrary slices of the byte stream: half a header,
//! three frames at once, a frame split across many reads. [`FrameDecoder`]
//! accumulates bytes until a whole frame is present and only then copies it
//! into a pooled buffer. Header validation happens as soon as the 12 header
//! bytes arrive, so an oversized length is rejected before its payload is
//! buffered.

use crate::error::Result;
use crate::frame::{decode_header, Frame, DEFAULT_MAX_FRAME_SIZE};
use crate::pool::BufferAllocator;
use bytes::BytesMut;
use tracing::trace;

#[derive(Debug)]
pub struct FrameDecoder {
    pending: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Bytes received but not yet part of a decoded frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes are fed
    pub fn decode(&mut self, allocator: &dyn BufferAllocator) -> Result<Option<Frame>> {
        let header = match decode_header(&self.pending, self.max_frame_size)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let frame_len = header.frame_len();
        if self.pending.len() < frame_len {
            trace!(
                have = self.pending.len(),
                need = frame_len,
                "Partial frame buffered"
            );
            return Ok(None);
        }

        let bytes = self.pending.split_to(frame_len);
        let mut buffer = allocator.allocate(frame_len);
        buffer.write_bytes(&bytes);
        buffer.flip();
        Frame::from_buffer(buffer).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
