//! Socket event handlers
//!
//! A [`ReadHandler`] receives raw bytes on the socket's reactor thread. Most
//! protocols want whole frames instead: [`FrameReadHandler`] reassembles them
//! with a [`FrameDecoder`] and passes each one to a [`FrameHandler`].
//!
//! Handler results are interpreted at the socket boundary. A protocol error
//! closes the connection; any other error or a panic is logged and the
//! socket stays open, leaving the decision to close to the handler.

use crate::error::Result;
use crate::socket::AsyncSocket;
use tpc_codec::{BufferPool, Frame, FrameDecoder};
use tracing::trace;

/// Byte-level socket callbacks, always invoked on the owning reactor thread
pub trait ReadHandler: Send + 'static {
    /// Connection established (and TLS handshake finished, if any)
    fn on_open(&mut self, _socket: &AsyncSocket) {}

    /// Bytes received; `data` is only valid for the duration of the call
    fn on_read(&mut self, data: &[u8], socket: &AsyncSocket) -> Result<()>;

    /// Connection gone; called once, after queued writes were discarded
    fn on_close(&mut self, _socket: &AsyncSocket) {}
}

/// Frame-level socket callbacks
pub trait FrameHandler: Send + 'static {
    fn on_frame(&mut self, frame: Frame, socket: &AsyncSocket) -> Result<()>;

    fn on_close(&mut self, _socket: &AsyncSocket) {}
}

/// Adapts a [`FrameHandler`] to the byte stream
pub struct FrameReadHandler<H> {
    decoder: FrameDecoder,
    pool: BufferPool,
    handler: H,
}

impl<H: FrameHandler> FrameReadHandler<H> {
    /// Frames are copied into buffers from `pool`; the size limit comes from
    /// the socket options once the connection opens
    pub fn new(handler: H, pool: BufferPool) -> Self {
        Self {
            decoder: FrameDecoder::default(),
            pool,
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: FrameHandler> ReadHandler for FrameReadHandler<H> {
    fn on_open(&mut self, socket: &AsyncSocket) {
        self.decoder
            .set_max_frame_size(socket.options().max_frame_size);
    }

    fn on_read(&mut self, data: &[u8], socket: &AsyncSocket) -> Result<()> {
        self.decoder.feed(data);
        while let Some(frame) = self.decoder.decode(&self.pool)? {
            trace!(
                socket = %socket,
                partition_id = frame.partition_id(),
                opcode = ?frame.opcode(),
                payload = frame.payload().len(),
                "Frame received"
            );
            self.handler.on_frame(frame, socket)?;
        }
        Ok(())
    }

    fn on_close(&mut self, socket: &AsyncSocket) {
        self.handler.on_close(socket);
    }
}

/// Closure-backed [`FrameHandler`]
pub struct FnFrameHandler<F>(F);

/// Wrap a closure as a [`FrameHandler`]
pub fn frame_handler_fn<F>(f: F) -> FnFrameHandler<F>
where
    F: FnMut(Frame, &AsyncSocket) -> Result<()> + Send + 'static,
{
    FnFrameHandler(f)
}

impl<F> FrameHandler for FnFrameHandler<F>
where
    F: FnMut(Frame, &AsyncSocket) -> Result<()> + Send + 'static,
{
    fn on_frame(&mut self, frame: Frame, socket: &AsyncSocket) -> Result<()> {
        (self.0)(frame, socket)
    }
}

/// Writes every frame back to its sender unmodified
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl FrameHandler for EchoHandler {
    fn on_frame(&mut self, frame: Frame, socket: &AsyncSocket) -> Result<()> {
        socket.write_and_flush(frame.into_buffer())
    }
}

/// Discards everything it reads
#[derive(Debug, Default)]
pub struct DevNullHandler {
    bytes_discarded: u64,
}

impl DevNullHandler {
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }
}

impl ReadHandler for DevNullHandler {
    fn on_read(&mut self, data: &[u8], _socket: &AsyncSocket) -> Result<()> {
        self.bytes_discarded += data.len() as u64;
        Ok(())
    }
}
