//! Partition server
//!
//! One listening socket lives on an acceptor reactor. Accepted connections
//! are handed round-robin to worker reactors, where a dispatcher decodes
//! request frames, validates the partition id and runs the
//! [`RequestHandler`]. The response frame carries the request's partition id
//! and opcode.
//!
//! The wire format has no error status, and clients correlate responses by
//! order. A request that cannot be answered therefore closes its connection,
//! which fails every request still pending on the client side instead of
//! shifting later responses onto the wrong callers.

use crate::error::{Result, RpcError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tpc_codec::{
    construct_complete, write_request_header, BufferAllocator, BufferPool, Frame, FrameHeader,
    IoBuffer, HEADER_SIZE,
};
use tpc_network::{
    panic_message, AcceptRequest, AsyncServerSocket, AsyncSocket, FrameHandler, Reactor,
    SocketOptions, SocketState, TlsEngineFactory,
};
use tracing::{debug, info, warn};

const RESPONSE_CAPACITY: usize = HEADER_SIZE + 64;

/// Per-partition request processing
///
/// Called on worker reactor threads, possibly several at once for different
/// connections. `payload` is positioned at the first payload byte;
/// `response` already holds the response header and only needs the payload.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, header: &FrameHeader, payload: &mut IoBuffer, response: &mut IoBuffer) -> Result<()>;
}

struct PartitionDispatcher {
    handler: Arc<dyn RequestHandler>,
    pool: BufferPool,
    partition_count: u32,
    connections: Arc<Mutex<Vec<AsyncSocket>>>,
}

impl PartitionDispatcher {
    fn respond(&self, frame: &mut Frame) -> Result<IoBuffer> {
        let header = *frame.header();
        if header.partition_id >= self.partition_count {
            return Err(RpcError::invalid_partition(
                header.partition_id,
                self.partition_count,
            ));
        }

        let mut response = self.pool.allocate(RESPONSE_CAPACITY);
        write_request_header(&mut response, header.partition_id, header.opcode);
        let handled = catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle(&header, frame.buffer_mut(), &mut response)
        }));
        match handled {
            Ok(result) => result?,
            Err(panic) => {
                return Err(RpcError::malformed(format!(
                    "request handler panicked: {}",
                    panic_message(panic.as_ref())
                )));
            }
        }
        construct_complete(&mut response)?;
        Ok(response)
    }
}

impl FrameHandler for PartitionDispatcher {
    fn on_frame(&mut self, mut frame: Frame, socket: &AsyncSocket) -> tpc_network::Result<()> {
        match self.respond(&mut frame) {
            Ok(response) => {
                drop(frame);
                socket.write_and_flush(response)
            }
            Err(e) => {
                warn!(
                    socket = %socket,
                    partition_id = frame.partition_id(),
                    opcode = ?frame.opcode(),
                    error = %e,
                    "Request failed; closing connection"
                );
                socket.close();
                Ok(())
            }
        }
    }

    fn on_close(&mut self, socket: &AsyncSocket) {
        self.connections.lock().retain(|open| open.id() != socket.id());
        debug!(socket = %socket, "Partition connection closed");
    }
}

/// Configures and binds a [`PartitionServer`]
pub struct PartitionServerBuilder {
    acceptor: Reactor,
    handler: Arc<dyn RequestHandler>,
    workers: Vec<Reactor>,
    partition_count: u32,
    pool: BufferPool,
    options: Option<SocketOptions>,
    tls: Option<Arc<dyn TlsEngineFactory>>,
}

impl PartitionServerBuilder {
    /// Connections go to these reactors in turn; defaults to the acceptor
    pub fn workers(mut self, workers: Vec<Reactor>) -> Self {
        self.workers = workers;
        self
    }

    pub fn partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    /// Options for the listener and every accepted connection
    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>) -> Self {
        self.tls = Some(factory);
        self
    }

    /// Bind, start accepting and return the running server
    pub async fn bind(self, addr: SocketAddr) -> Result<PartitionServer> {
        if self.partition_count == 0 {
            return Err(RpcError::Network(tpc_network::NetworkError::configuration(
                "partition count must be positive",
                Some("partition_count"),
            )));
        }

        let mut socket_builder = self.acceptor.server_socket_builder();
        if let Some(options) = &self.options {
            socket_builder = socket_builder.options(options.clone());
        }
        if let Some(tls) = &self.tls {
            socket_builder = socket_builder.tls(Arc::clone(tls));
        }
        let listener = socket_builder.build();
        let local_addr = listener.bind(addr).await?;

        let workers = if self.workers.is_empty() {
            vec![self.acceptor.clone()]
        } else {
            self.workers
        };
        let connections: Arc<Mutex<Vec<AsyncSocket>>> = Arc::new(Mutex::new(Vec::new()));
        let acceptor = Acceptor {
            workers,
            next: AtomicUsize::new(0),
            handler: self.handler,
            pool: self.pool,
            options: self.options,
            partition_count: self.partition_count,
            connections: Arc::clone(&connections),
        };
        if let Err(e) = listener.accept(move |request| acceptor.dispatch(request)) {
            listener.close();
            return Err(e.into());
        }

        info!(
            addr = %local_addr,
            partitions = self.partition_count,
            tls = self.tls.is_some(),
            "Partition server listening"
        );
        Ok(PartitionServer {
            listener,
            local_addr,
            connections,
        })
    }
}

struct Acceptor {
    workers: Vec<Reactor>,
    next: AtomicUsize,
    handler: Arc<dyn RequestHandler>,
    pool: BufferPool,
    options: Option<SocketOptions>,
    partition_count: u32,
    connections: Arc<Mutex<Vec<AsyncSocket>>>,
}

impl Acceptor {
    fn dispatch(&self, request: AcceptRequest) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        let peer = request.peer_addr();

        let mut builder = worker.socket_builder();
        if let Some(options) = &self.options {
            builder = builder.options(options.clone());
        }
        let dispatcher = PartitionDispatcher {
            handler: Arc::clone(&self.handler),
            pool: self.pool.clone(),
            partition_count: self.partition_count,
            connections: Arc::clone(&self.connections),
        };
        let started = builder
            .frame_handler(dispatcher, self.pool.clone())
            .accept_request(request)
            .build()
            .and_then(|socket| socket.start().map(|()| socket));

        match started {
            Ok(socket) => {
                debug!(peer = %peer, worker = %worker.name(), "Connection assigned");
                let mut connections = self.connections.lock();
                // Covers a connection that closed before it was recorded
                connections.retain(|open| open.state() < SocketState::Closing);
                connections.push(socket);
            }
            Err(e) => warn!(peer = %peer, worker = %worker.name(), error = %e, "Failed to start connection"),
        }
    }
}

/// Running partition server
pub struct PartitionServer {
    listener: AsyncServerSocket,
    local_addr: SocketAddr,
    connections: Arc<Mutex<Vec<AsyncSocket>>>,
}

impl PartitionServer {
    pub fn builder(acceptor: Reactor, handler: Arc<dyn RequestHandler>) -> PartitionServerBuilder {
        PartitionServerBuilder {
            acceptor,
            handler,
            workers: Vec::new(),
            partition_count: 271,
            pool: BufferPool::default(),
            options: None,
            tls: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accepted_count(&self) -> u64 {
        self.listener.accepted_count()
    }

    /// Accepted connections that have not closed yet
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Stop listening and close every accepted connection
    pub fn close(&self) {
        self.listener.close();
        let connections: Vec<AsyncSocket> = self.connections.lock().drain(..).collect();
        for connection in connections {
            connection.close();
        }
    }
}

impl std::fmt::Debug for PartitionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionServer")
            .field("local_addr", &self.local_addr)
            .field("accepted", &self.accepted_count())
            .finish()
    }
}
