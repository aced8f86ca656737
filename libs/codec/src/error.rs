//! Codec-level errors for buffer access and frame decoding
//!
//! Two layers: [`BufferError`] covers cursor and bounds violations on a single
//! [`IoBuffer`](crate::IoBuffer), [`ProtocolError`] covers malformed frames seen
//! on the wire. A protocol error always means the connection that produced the
//! bytes can no longer be trusted and must be closed.

use thiserror::Error;

/// Cursor and bounds violations on an I/O buffer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Fewer readable bytes than the read requires
    #[error("Buffer underflow: need {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    /// Absolute access outside the backing storage
    #[error("Index {index} out of bounds (width {width}, capacity {capacity})")]
    IndexOutOfBounds {
        index: usize,
        width: usize,
        capacity: usize,
    },

    /// Size prefix that cannot describe a byte sequence
    #[error("Invalid length prefix {length}")]
    InvalidLength { length: i32 },

    /// Field too long for its i32 size prefix
    #[error("Field of {length} bytes exceeds the i32 size prefix")]
    TooLarge { length: usize },

    /// Size-prefixed string that is not UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// Malformed frame errors; the offending connection is closed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Length field decoded as a negative number
    #[error("Negative frame length {length}")]
    NegativeLength { length: i32 },

    /// Declared payload exceeds the configured maximum frame size
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Opcode value not assigned to any operation
    #[error("Unknown opcode {value}")]
    UnknownOpcode { value: i32 },

    /// Buffer too short to hold a frame header
    #[error("Incomplete frame header: {available} of {required} bytes")]
    IncompleteHeader { available: usize, required: usize },

    /// Declared payload length disagrees with the bytes present
    #[error("Frame length mismatch: header declares {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Result alias for codec operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = ProtocolError::FrameTooLarge {
            length: 32,
            max: 16,
        };
        assert_eq!(err.to_string(), "Frame length 32 exceeds maximum 16");

        let err = BufferError::Underflow {
            needed: 4,
            remaining: 1,
        };
        assert!(err.to_string().contains("need 4 bytes"));
    }

    #[test]
    fn test_buffer_error_converts_to_protocol_error() {
        let err: ProtocolError = BufferError::InvalidUtf8.into();
        assert_eq!(err, ProtocolError::Buffer(BufferError::InvalidUtf8));
    }
}
