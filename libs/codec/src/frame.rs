//! Partition frame layout
//!
//! Every request and response on the wire is one frame:
//!
//! ```text
//! 0            4            8            12
//! +------------+------------+------------+---------------------+
//! | partition  |  opcode    |  length    |  payload (length)   |
//! |   u32 BE   |  i32 BE    |  i32 BE    |                     |
//! +------------+------------+------------+---------------------+
//! ```
//!
//! Producers call [`write_request_header`], append the payload, then
//! [`construct_complete`] which back-patches the length and flips the buffer
//! into read mode. A completed frame is read-only from then on.

use crate::buffer::IoBuffer;
use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const PARTITION_ID_OFFSET: usize = 0;
pub const OPCODE_OFFSET: usize = 4;
pub const LENGTH_OFFSET: usize = 8;
pub const HEADER_SIZE: usize = 12;

/// Largest payload accepted unless configured otherwise (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Operation carried by a frame
///
/// Values are permanent. New operations get new numbers; a retired number is
/// never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Opcode {
    Noop = 0,
    Get = 1,
    Set = 2,
    Query = 3,
    TableUpsert = 4,
}

impl Opcode {
    pub const ALL: [Opcode; 5] = [
        Opcode::Noop,
        Opcode::Get,
        Opcode::Set,
        Opcode::Query,
        Opcode::TableUpsert,
    ];

    pub fn from_wire(value: i32) -> Result<Self> {
        Opcode::try_from(value).map_err(|_| ProtocolError::UnknownOpcode { value })
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub partition_id: u32,
    pub opcode: Opcode,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Header plus payload
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }
}

/// Start a frame in an empty write-mode buffer, reserving the length field
pub fn write_request_header(buffer: &mut IoBuffer, partition_id: u32, opcode: Opcode) {
    debug_assert_eq!(buffer.position(), 0, "frame header must start the buffer");
    buffer.write_u32(partition_id);
    buffer.write_i32(opcode.into());
    buffer.write_i32(0);
}

/// Back-patch the payload length and flip the buffer into read mode
pub fn construct_complete(buffer: &mut IoBuffer) -> Result<()> {
    let written = buffer.position();
    if written < HEADER_SIZE {
        return Err(ProtocolError::IncompleteHeader {
            available: written,
            required: HEADER_SIZE,
        });
    }
    let payload_len = written - HEADER_SIZE;
    let length = i32::try_from(payload_len).map_err(|_| ProtocolError::FrameTooLarge {
        length: payload_len,
        max: i32::MAX as usize,
    })?;
    buffer.put_i32_at(LENGTH_OFFSET, length)?;
    buffer.flip();
    Ok(())
}

/// Decode a header from the front of `bytes`
///
/// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are available.
/// Only the header is validated; the payload may still be in flight.
pub fn decode_header(bytes: &[u8], max_frame_size: usize) -> Result<Option<FrameHeader>> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }
    let partition_id = BigEndian::read_u32(&bytes[PARTITION_ID_OFFSET..]);
    let opcode = Opcode::from_wire(BigEndian::read_i32(&bytes[OPCODE_OFFSET..]))?;
    let length = BigEndian::read_i32(&bytes[LENGTH_OFFSET..]);
    if length < 0 {
        return Err(ProtocolError::NegativeLength { length });
    }
    let payload_len = length as usize;
    if payload_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            length: payload_len,
            max: max_frame_size,
        });
    }
    Ok(Some(FrameHeader {
        partition_id,
        opcode,
        payload_len,
    }))
}

/// Consume the header of a complete frame held in a read-mode buffer
pub fn read_header(buffer: &mut IoBuffer) -> Result<FrameHeader> {
    let header = decode_header(buffer.as_slice(), usize::MAX)?.ok_or(
        ProtocolError::IncompleteHeader {
            available: buffer.remaining(),
            required: HEADER_SIZE,
        },
    )?;
    buffer.advance(HEADER_SIZE)?;
    if buffer.remaining() != header.payload_len {
        return Err(ProtocolError::LengthMismatch {
            declared: header.payload_len,
            available: buffer.remaining(),
        });
    }
    Ok(header)
}

/// A complete frame: decoded header plus the buffer holding it
///
/// The buffer cursor starts at the first payload byte, so typed reads through
/// [`Frame::buffer_mut`] walk the payload. Dropping the frame releases the
/// buffer.
#[derive(Debug)]
pub struct Frame {
    header: FrameHeader,
    buffer: IoBuffer,
}

impl Frame {
    /// Validate a completed frame buffer and position it at the payload
    pub fn from_buffer(mut buffer: IoBuffer) -> Result<Self> {
        let header = read_header(&mut buffer)?;
        Ok(Self { header, buffer })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn partition_id(&self) -> u32 {
        self.header.partition_id
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Unread payload bytes
    pub fn payload(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.buffer
    }

    /// Whole frame, header included, ready to be written back to the wire
    pub fn into_buffer(mut self) -> IoBuffer {
        self.buffer.rewind();
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn build(partition_id: u32, opcode: Opcode, payload: &[u8]) -> IoBuffer {
        let mut buf = IoBuffer::with_capacity(64);
        write_request_header(&mut buf, partition_id, opcode);
        buf.write_bytes(payload);
        construct_complete(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_layout() {
        let buf = build(3, Opcode::Get, &[0xAA, 0xBB]);
        assert_eq!(
            buf.as_slice(),
            &[0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 2, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_opcode_values_are_stable() {
        let values: Vec<i32> = Opcode::ALL.iter().map(|op| i32::from(*op)).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(
            Opcode::from_wire(5),
            Err(ProtocolError::UnknownOpcode { value: 5 })
        );
    }

    #[test]
    fn test_frame_payload_and_rewind() {
        let mut frame = Frame::from_buffer(build(9, Opcode::Set, &42i64.to_be_bytes())).unwrap();
        assert_eq!(frame.partition_id(), 9);
        assert_eq!(frame.opcode(), Opcode::Set);
        assert_eq!(frame.buffer_mut().read_i64().unwrap(), 42);

        let buf = frame.into_buffer();
        assert_eq!(buf.remaining(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_partial_header_waits() {
        let buf = build(1, Opcode::Noop, &[]);
        assert_eq!(decode_header(&buf.as_slice()[..11], 1024).unwrap(), None);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut bytes = build(1, Opcode::Noop, &[]).as_slice().to_vec();
        bytes[LENGTH_OFFSET..HEADER_SIZE].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(
            decode_header(&bytes, 1024),
            Err(ProtocolError::NegativeLength { length: -1 })
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let buf = build(1, Opcode::Set, &[0; 100]);
        assert_eq!(
            decode_header(buf.as_slice(), 64),
            Err(ProtocolError::FrameTooLarge {
                length: 100,
                max: 64
            })
        );
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut bytes = build(1, Opcode::Noop, &[]).as_slice().to_vec();
        bytes[OPCODE_OFFSET..LENGTH_OFFSET].copy_from_slice(&99i32.to_be_bytes());
        assert_eq!(
            decode_header(&bytes, 1024),
            Err(ProtocolError::UnknownOpcode { value: 99 })
        );
    }

    #[test]
    fn test_truncated_frame_mismatch() {
        let mut buf = IoBuffer::with_capacity(32);
        buf.write_bytes(&build(1, Opcode::Get, &[1, 2, 3, 4]).as_slice()[..14]);
        buf.flip();
        assert_eq!(
            read_header(&mut buf),
            Err(ProtocolError::LengthMismatch {
                declared: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_complete_requires_header() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.write_i32(1);
        assert!(matches!(
            construct_complete(&mut buf),
            Err(ProtocolError::IncompleteHeader { available: 4, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_header_survives_completion(
            partition_id in any::<u32>(),
            opcode_index in 0usize..Opcode::ALL.len(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let opcode = Opcode::ALL[opcode_index];
            let buf = build(partition_id, opcode, &payload);
            let header = decode_header(buf.as_slice(), DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
            prop_assert_eq!(header.partition_id, partition_id);
            prop_assert_eq!(header.opcode, opcode);
            prop_assert_eq!(header.payload_len, payload.len());

            let frame = Frame::from_buffer(buf).unwrap();
            prop_assert_eq!(frame.payload(), &payload[..]);
        }
    }
}
