//! Thread-per-core networking
//!
//! Each [`Reactor`] owns one OS thread and every socket registered with it.
//! Sockets are plain TCP or TLS over TCP and deliver inbound bytes to a
//! [`ReadHandler`] on their reactor thread; [`FrameReadHandler`] turns that
//! byte stream into partition frames. Writes and closes may come from any
//! thread and are handed to the owning reactor.
//!
//! ```text
//!   caller threads             reactor thread (one per core)
//!  ─────────────────          ─────────────────────────────────────
//!   write_and_flush ──queue──▶ socket task ──▶ kernel
//!   offer(task)     ──inbox──▶ run task
//!                              kernel ──▶ ReadHandler::on_read
//! ```

pub mod error;
pub mod handler;
pub mod options;
pub mod reactor;
pub mod socket;
pub mod tls;

pub use error::{NetworkError, Result};
pub use handler::{
    frame_handler_fn, DevNullHandler, EchoHandler, FnFrameHandler, FrameHandler, FrameReadHandler,
    ReadHandler,
};
pub use options::SocketOptions;
pub use reactor::{
    panic_message, start_reactors, Closeable, CloseableId, Reactor, ReactorConfig, ReactorState,
    ReactorStats, Task,
};
pub use socket::{
    AcceptRequest, AsyncServerSocket, AsyncServerSocketBuilder, AsyncSocket, AsyncSocketBuilder,
    SocketState, SocketStats,
};
#[cfg(feature = "self-signed")]
pub use tls::SelfSignedEngineFactory;
pub use tls::{ring_provider, RustlsEngineFactory, TlsEngine, TlsEngineFactory, TlsRole, TlsState};
