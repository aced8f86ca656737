//! # TPC Wire Codec
//!
//! ## Purpose
//!
//! Buffer and framing layer shared by the transport and RPC crates:
//! - [`IoBuffer`]: move-only cursor buffer, the unit of I/O
//! - [`BufferPool`]: concurrent free list with allocation accounting
//! - Frame header encoding (`partition id | opcode | length | payload`)
//! - [`FrameDecoder`]: reassembly of frames split across socket reads
//!
//! ## Architecture Role
//!
//! ```text
//! tpc-codec → tpc-network → tpc-rpc
//!     ↑            ↓            ↓
//! Buffers     Reactors      Partition routing
//! Frames      Sockets       Request correlation
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket or reactor logic (belongs in tpc-network)
//! - Request/response correlation (belongs in tpc-rpc)

pub mod buffer;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod pool;

pub use buffer::{IoBuffer, NULL_LENGTH};
pub use decoder::FrameDecoder;
pub use error::{BufferError, ProtocolError, Result};
pub use frame::{
    construct_complete, decode_header, read_header, write_request_header, Frame, FrameHeader,
    Opcode, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, LENGTH_OFFSET, OPCODE_OFFSET,
    PARTITION_ID_OFFSET,
};
pub use pool::{
    BufferAllocator, BufferPool, PoolStats, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_BLOCK_SIZE,
    DEFAULT_MAX_POOLED,
};
