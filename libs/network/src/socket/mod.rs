//! Reactor-owned sockets
//!
//! ## Model
//!
//! An [`AsyncSocket`] is a cheap, cloneable handle; the connection itself is a
//! task on its reactor's `LocalSet`. Only that task touches the stream and the
//! [`ReadHandler`]. Other threads interact through two thread-safe entry
//! points: [`AsyncSocket::write_and_flush`] queues a buffer on the socket's
//! outbound channel and [`AsyncSocket::close`] signals the task.
//!
//! ```text
//! Created ──connect()/start()──▶ Connecting ──▶ Open ──▶ Closing ──▶ Closed
//!    │                              │                        ▲
//!    └────────── close() ───────────┴────────────────────────┘
//! ```
//!
//! `Connecting` covers the TCP connect and, for TLS sockets, the handshake.
//! Buffers written before the socket opens are queued and flushed once it
//! does; buffers still queued at close are dropped, which returns them to
//! their pool.
//!
//! ## Ownership of written buffers
//!
//! `write_and_flush` takes the buffer by value. The socket releases it after
//! the bytes reach the kernel, or when the socket closes with it still
//! queued. A rejected write releases it immediately.

mod server;
mod stream;

pub use server::{AcceptRequest, AsyncServerSocket, AsyncServerSocketBuilder};
pub(crate) use stream::SocketStream;

use crate::error::{NetworkError, Result};
use crate::handler::{FrameHandler, FrameReadHandler, ReadHandler};
use crate::options::SocketOptions;
use crate::reactor::{panic_message, Closeable, CloseableId, Reactor};
use crate::tls::{TlsEngineFactory, TlsRole, TlsState};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tpc_codec::{BufferPool, IoBuffer};
use tracing::{debug, error, trace, warn};

/// Buffers written between flushes
const MAX_WRITE_BATCH: usize = 64;

/// Bound on the orderly TCP/TLS shutdown during close
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(0);

/// Connection lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocketState {
    Created = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl SocketState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketState::Created,
            1 => SocketState::Connecting,
            2 => SocketState::Open,
            3 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

/// Per-socket traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Buffers written to the stream
    pub writes: u64,
    /// Handler calls that returned an error or panicked
    pub handler_errors: u64,
}

/// Everything the connection task takes ownership of when it starts
struct Launch {
    outbound: mpsc::UnboundedReceiver<IoBuffer>,
    handler: Box<dyn ReadHandler>,
    accepted: Option<AcceptRequest>,
}

/// Handle to a client or accepted connection; clones share the connection
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: u64,
    reactor: Reactor,
    options: SocketOptions,
    state: AtomicU8,
    tls_state: AtomicU8,
    tls: Option<Arc<dyn TlsEngineFactory>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    outbound_tx: mpsc::UnboundedSender<IoBuffer>,
    launch: Mutex<Option<Launch>>,
    close_notify: Notify,
    closeable_id: Mutex<Option<CloseableId>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    writes: AtomicU64,
    handler_errors: AtomicU64,
}

impl AsyncSocket {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Reactor that owns this connection
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SocketState {
        self.inner.state()
    }

    pub fn tls_state(&self) -> TlsState {
        TlsState::from_u8(self.inner.tls_state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Whether a TLS engine is configured for this socket
    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock()
    }

    pub fn stats(&self) -> SocketStats {
        SocketStats {
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Connect a client socket; completes once the connection (and TLS
    /// session, if configured) is established
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let launch = self.take_launch(false)?;
        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner
            .reactor
            .offer(move || {
                tokio::task::spawn_local(connect_and_run(inner, addr, launch, done_tx));
            })
            .map_err(|e| {
                self.inner.set_state(SocketState::Closed);
                e
            })?;

        done_rx
            .await
            .map_err(|_| NetworkError::closed("socket task ended before the connection opened"))?
    }

    /// Start an accepted socket on its reactor; returns once the task is queued
    pub fn start(&self) -> Result<()> {
        let Launch {
            outbound,
            handler,
            accepted,
        } = self.take_launch(true)?;
        let request = accepted.ok_or_else(|| {
            NetworkError::configuration("socket has no accepted connection", Some("accept_request"))
        })?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .reactor
            .offer(move || {
                tokio::task::spawn_local(accept_and_run(inner, request, handler, outbound));
            })
            .map_err(|e| {
                self.inner.set_state(SocketState::Closed);
                e
            })
    }

    /// Queue a complete buffer for writing; callable from any thread
    pub fn write_and_flush(&self, buffer: IoBuffer) -> Result<()> {
        if self.state() >= SocketState::Closing {
            return Err(NetworkError::closed(format!("{} is closed", self.inner)));
        }
        self.inner
            .outbound_tx
            .send(buffer)
            .map_err(|_| NetworkError::closed(format!("{} is closed", self.inner)))
    }

    /// Close the connection; idempotent and callable from any thread
    pub fn close(&self) {
        self.inner.initiate_close();
    }

    fn take_launch(&self, accepted: bool) -> Result<Launch> {
        let mut slot = self.inner.launch.lock();
        let is_accepted = match slot.as_ref() {
            Some(launch) => launch.accepted.is_some(),
            None => {
                return Err(NetworkError::closed(format!(
                    "{} was already started or closed",
                    self.inner
                )))
            }
        };
        if is_accepted != accepted {
            let message = if is_accepted {
                "accepted sockets are started, not connected"
            } else {
                "client sockets are connected, not started"
            };
            return Err(NetworkError::configuration(message, None));
        }
        if !self
            .inner
            .transition(SocketState::Created, SocketState::Connecting)
        {
            return Err(NetworkError::closed(format!("{} is closed", self.inner)));
        }
        slot.take()
            .ok_or_else(|| NetworkError::closed(format!("{} is closed", self.inner)))
    }
}

impl fmt::Display for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("id", &self.inner.id)
            .field("reactor", &self.inner.reactor.name())
            .field("state", &self.state())
            .field("tls", &self.tls_state())
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

impl fmt::Display for SocketInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = |a: Option<SocketAddr>| a.map_or_else(|| "?".to_string(), |a| a.to_string());
        write!(
            f,
            "socket#{}[{}->{}]",
            self.id,
            addr(*self.local_addr.lock()),
            addr(*self.remote_addr.lock())
        )
    }
}

impl Closeable for SocketInner {
    fn close(&self) {
        self.initiate_close();
    }
}

impl SocketInner {
    fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_tls_state(&self, state: TlsState) {
        self.tls_state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SocketState, to: SocketState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn initiate_close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SocketState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                SocketState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.close_notify.notify_one();
        // Never launched: nothing on the reactor will finish the close
        let unlaunched = self.launch.lock().take();
        if let Some(launch) = unlaunched {
            drop(launch);
            self.set_state(SocketState::Closed);
            debug!(socket = %self, "Socket closed before it was started");
        }
    }

    fn register(self: &Arc<Self>) -> Result<()> {
        let closeable: Arc<dyn Closeable> = Arc::clone(self) as Arc<dyn Closeable>;
        let id = self.reactor.register_closeable(closeable)?;
        *self.closeable_id.lock() = Some(id);
        Ok(())
    }

    fn deregister(&self) {
        if let Some(id) = self.closeable_id.lock().take() {
            if let Err(e) = self.reactor.deregister_closeable(id) {
                trace!(socket = %self, error = %e, "Deregistration skipped");
            }
        }
    }

    fn configure_stream(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.options.tcp_nodelay) {
            warn!(socket = %self, error = %e, "Failed to set TCP_NODELAY");
        }
        if let Ok(local) = stream.local_addr() {
            *self.local_addr.lock() = Some(local);
        }
        if let Ok(peer) = stream.peer_addr() {
            *self.remote_addr.lock() = Some(peer);
        }
    }

    async fn establish_client(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketStream> {
        self.register()?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| NetworkError::connection_with_source("failed to create socket", Some(addr), e))?;
        self.options.apply(&socket)?;

        let timeout = self.options.connect_timeout;
        let stream = tokio::select! {
            biased;
            _ = self.close_notify.notified() => {
                return Err(NetworkError::closed("closed while connecting"));
            }
            result = tokio::time::timeout(timeout, socket.connect(addr)) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(NetworkError::connection_with_source(
                        format!("connect to {addr} failed"),
                        Some(addr),
                        e,
                    ));
                }
                Err(_) => {
                    return Err(NetworkError::timeout(
                        format!("connect to {addr}"),
                        timeout.as_millis() as u64,
                    ));
                }
            }
        };
        self.configure_stream(&stream);
        self.secure(stream, TlsRole::Client, addr).await
    }

    async fn establish_accepted(self: &Arc<Self>, request: AcceptRequest) -> Result<SocketStream> {
        self.register()?;
        let AcceptRequest {
            stream, peer_addr, ..
        } = request;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        self.configure_stream(&stream);
        self.secure(stream, TlsRole::Server, peer_addr).await
    }

    /// Run the TLS handshake when a factory is configured
    async fn secure(&self, stream: TcpStream, role: TlsRole, peer: SocketAddr) -> Result<SocketStream> {
        let Some(factory) = self.tls.as_ref() else {
            return Ok(SocketStream::Plain(stream));
        };
        let engine = factory.create(role, peer)?;
        self.set_tls_state(TlsState::Handshaking);

        let timeout = self.options.handshake_timeout;
        let tls = tokio::select! {
            biased;
            _ = self.close_notify.notified() => {
                return Err(NetworkError::closed("closed during TLS handshake"));
            }
            result = tokio::time::timeout(timeout, engine.handshake(stream)) => match result {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    return Err(NetworkError::handshake_with_source(
                        format!("{role:?} handshake failed"),
                        Some(peer),
                        e,
                    ));
                }
                Err(_) => {
                    return Err(NetworkError::timeout("TLS handshake", timeout.as_millis() as u64));
                }
            }
        };
        self.set_tls_state(TlsState::Established);
        debug!(socket = %self, role = ?role, "TLS session established");
        Ok(SocketStream::Tls(Box::new(tls)))
    }

    fn finish_without_io(&self) {
        self.set_state(SocketState::Closed);
        if self.tls.is_some() {
            self.set_tls_state(TlsState::None);
        }
        self.deregister();
    }

    async fn run_io(
        self: Arc<Self>,
        mut stream: SocketStream,
        mut handler: Box<dyn ReadHandler>,
        mut outbound: mpsc::UnboundedReceiver<IoBuffer>,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        if !self.transition(SocketState::Connecting, SocketState::Open) {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await;
            self.finish_without_io();
            if let Some(done) = done {
                let _ = done.send(Err(NetworkError::closed("closed before the connection opened")));
            }
            return;
        }

        let socket = AsyncSocket {
            inner: Arc::clone(&self),
        };
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        debug!(socket = %self, tls = stream.is_tls(), "Socket open");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_open(&socket))) {
            self.handler_errors.fetch_add(1, Ordering::Relaxed);
            error!(socket = %self, panic = %panic_message(panic.as_ref()), "Open handler panicked");
        }

        // Reads, writes and close are polled side by side; a stalled write blocks none of them
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(self.options.read_buffer_size);
        {
            let writes = self.write_loop(&mut writer, &mut outbound);
            tokio::pin!(writes);
            loop {
                tokio::select! {
                    biased;
                    _ = self.close_notify.notified() => break,
                    written = &mut writes => {
                        if let Err(e) = written {
                            debug!(socket = %self, error = %e, "Write failed; closing");
                        }
                        break;
                    }
                    read = reader.read_buf(&mut read_buf) => match read {
                        Ok(0) => {
                            debug!(socket = %self, "Peer closed the connection");
                            break;
                        }
                        Ok(n) => {
                            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                            let keep_open = self.dispatch_read(handler.as_mut(), &read_buf, &socket);
                            read_buf.clear();
                            if !keep_open {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(socket = %self, error = %e, "Read failed; closing");
                            break;
                        }
                    }
                }
            }
        }

        // A write cut short by close drops its buffer along with the future
        let stream = reader.unsplit(writer);
        self.teardown(stream, handler, outbound, &socket).await;
    }

    /// Drain the outbound queue into `writer` until a write fails
    async fn write_loop<W>(
        &self,
        writer: &mut W,
        outbound: &mut mpsc::UnboundedReceiver<IoBuffer>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(first) = outbound.recv().await {
            self.flush_outbound(writer, first, outbound).await?;
        }
        Ok(())
    }

    async fn flush_outbound<W>(
        &self,
        writer: &mut W,
        first: IoBuffer,
        outbound: &mut mpsc::UnboundedReceiver<IoBuffer>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut next = Some(first);
        let mut batch = 0usize;
        while let Some(buffer) = next.take() {
            writer.write_all(buffer.as_slice()).await?;
            self.bytes_written
                .fetch_add(buffer.remaining() as u64, Ordering::Relaxed);
            self.writes.fetch_add(1, Ordering::Relaxed);
            drop(buffer);

            batch += 1;
            if batch < MAX_WRITE_BATCH {
                next = outbound.try_recv().ok();
            }
        }
        writer.flush().await
    }

    /// Returns whether the connection stays open
    fn dispatch_read(&self, handler: &mut dyn ReadHandler, data: &[u8], socket: &AsyncSocket) -> bool {
        match catch_unwind(AssertUnwindSafe(|| handler.on_read(data, socket))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_protocol() => {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(socket = %self, error = %e, "Protocol error; closing connection");
                false
            }
            Ok(Err(e)) => {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(socket = %self, error = %e, category = e.category(), "Read handler failed");
                true
            }
            Err(panic) => {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(socket = %self, panic = %panic_message(panic.as_ref()), "Read handler panicked");
                true
            }
        }
    }

    async fn teardown(
        &self,
        mut stream: SocketStream,
        mut handler: Box<dyn ReadHandler>,
        mut outbound: mpsc::UnboundedReceiver<IoBuffer>,
        socket: &AsyncSocket,
    ) {
        self.set_state(SocketState::Closing);
        if stream.is_tls() {
            self.set_tls_state(TlsState::Closing);
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown())
            .await
            .is_err()
        {
            trace!(socket = %self, "Stream shutdown timed out");
        }
        drop(stream);

        outbound.close();
        let mut discarded = 0usize;
        while let Ok(buffer) = outbound.try_recv() {
            drop(buffer);
            discarded += 1;
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_close(socket))) {
            error!(socket = %self, panic = %panic_message(panic.as_ref()), "Close handler panicked");
        }
        self.set_state(SocketState::Closed);
        self.deregister();
        debug!(
            socket = %self,
            bytes_read = self.bytes_read.load(Ordering::Relaxed),
            bytes_written = self.bytes_written.load(Ordering::Relaxed),
            discarded,
            "Socket closed"
        );
    }
}

async fn connect_and_run(
    inner: Arc<SocketInner>,
    addr: SocketAddr,
    launch: Launch,
    done: oneshot::Sender<Result<()>>,
) {
    *inner.remote_addr.lock() = Some(addr);
    match inner.establish_client(addr).await {
        Ok(stream) => {
            let Launch {
                outbound, handler, ..
            } = launch;
            inner.run_io(stream, handler, outbound, Some(done)).await;
        }
        Err(e) => {
            debug!(socket = %inner, error = %e, "Connect failed");
            drop(launch);
            inner.finish_without_io();
            let _ = done.send(Err(e));
        }
    }
}

async fn accept_and_run(
    inner: Arc<SocketInner>,
    request: AcceptRequest,
    handler: Box<dyn ReadHandler>,
    outbound: mpsc::UnboundedReceiver<IoBuffer>,
) {
    match inner.establish_accepted(request).await {
        Ok(stream) => inner.run_io(stream, handler, outbound, None).await,
        Err(e) => {
            // A failed accept is the peer's problem; drop it quietly
            debug!(socket = %inner, error = %e, "Accepted connection dropped");
            drop(handler);
            drop(outbound);
            inner.finish_without_io();
        }
    }
}

/// Builder for [`AsyncSocket`]
pub struct AsyncSocketBuilder {
    reactor: Reactor,
    options: SocketOptions,
    handler: Option<Box<dyn ReadHandler>>,
    tls: Option<Arc<dyn TlsEngineFactory>>,
    accept_request: Option<AcceptRequest>,
}

impl AsyncSocketBuilder {
    pub(crate) fn new(reactor: Reactor) -> Self {
        let options = reactor.socket_options().clone();
        Self {
            reactor,
            options,
            handler: None,
            tls: None,
            accept_request: None,
        }
    }

    /// Override the reactor's default socket options
    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    pub fn read_handler(mut self, handler: impl ReadHandler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Shorthand for a [`FrameReadHandler`] around `handler`
    pub fn frame_handler(self, handler: impl FrameHandler, pool: BufferPool) -> Self {
        self.read_handler(FrameReadHandler::new(handler, pool))
    }

    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>) -> Self {
        self.tls = Some(factory);
        self
    }

    /// Adopt a connection accepted by an [`AsyncServerSocket`]; the socket
    /// inherits the server's TLS factory unless one is set explicitly
    pub fn accept_request(mut self, request: AcceptRequest) -> Self {
        self.accept_request = Some(request);
        self
    }

    pub fn build(self) -> Result<AsyncSocket> {
        let handler = self.handler.ok_or_else(|| {
            NetworkError::configuration("a read handler is required", Some("read_handler"))
        })?;
        let tls = self
            .tls
            .or_else(|| self.accept_request.as_ref().and_then(|r| r.tls.clone()));
        let (local_addr, remote_addr) = match &self.accept_request {
            Some(request) => (Some(request.local_addr), Some(request.peer_addr)),
            None => (None, None),
        };
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        Ok(AsyncSocket {
            inner: Arc::new(SocketInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                reactor: self.reactor,
                options: self.options,
                state: AtomicU8::new(SocketState::Created as u8),
                tls_state: AtomicU8::new(TlsState::None as u8),
                tls,
                local_addr: Mutex::new(local_addr),
                remote_addr: Mutex::new(remote_addr),
                outbound_tx,
                launch: Mutex::new(Some(Launch {
                    outbound,
                    handler,
                    accepted: self.accept_request,
                })),
                close_notify: Notify::new(),
                closeable_id: Mutex::new(None),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
            }),
        })
    }
}
