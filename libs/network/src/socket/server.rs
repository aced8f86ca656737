//! Listening sockets
//!
//! An [`AsyncServerSocket`] binds and listens on its reactor thread, then runs
//! an accept loop there. Every accepted connection is detached from the
//! listener's reactor and handed to the consumer as an [`AcceptRequest`];
//! the consumer decides which reactor adopts it through
//! [`AsyncSocketBuilder::accept_request`](super::AsyncSocketBuilder::accept_request).

use super::SocketState;
use crate::error::{NetworkError, Result};
use crate::options::SocketOptions;
use crate::reactor::{panic_message, Closeable, CloseableId, Reactor};
use crate::tls::TlsEngineFactory;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(0);

/// A connection accepted by a server socket, not yet owned by any reactor
pub struct AcceptRequest {
    pub(crate) stream: std::net::TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) tls: Option<Arc<dyn TlsEngineFactory>>,
}

impl AcceptRequest {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the listening socket was configured for TLS
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Debug for AcceptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptRequest")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("tls", &self.is_tls())
            .finish()
    }
}

/// Builder for [`AsyncServerSocket`]
pub struct AsyncServerSocketBuilder {
    reactor: Reactor,
    options: SocketOptions,
    tls: Option<Arc<dyn TlsEngineFactory>>,
}

impl AsyncServerSocketBuilder {
    pub(crate) fn new(reactor: Reactor) -> Self {
        let options = reactor.socket_options().clone();
        Self {
            reactor,
            options,
            tls: None,
        }
    }

    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// TLS factory handed to every accepted connection
    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>) -> Self {
        self.tls = Some(factory);
        self
    }

    pub fn build(self) -> AsyncServerSocket {
        AsyncServerSocket {
            inner: Arc::new(ServerInner {
                id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
                reactor: self.reactor,
                options: self.options,
                tls: self.tls,
                state: AtomicU8::new(SocketState::Created as u8),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                accepting: AtomicBool::new(false),
                close_notify: Notify::new(),
                closeable_id: Mutex::new(None),
                accepted: AtomicU64::new(0),
            }),
        }
    }
}

/// Handle to a listening socket; clones share the listener
#[derive(Clone)]
pub struct AsyncServerSocket {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    id: u64,
    reactor: Reactor,
    options: SocketOptions,
    tls: Option<Arc<dyn TlsEngineFactory>>,
    state: AtomicU8,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accepting: AtomicBool,
    close_notify: Notify,
    closeable_id: Mutex<Option<CloseableId>>,
    accepted: AtomicU64,
}

impl AsyncServerSocket {
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// `Open` while bound, whether or not accepting has started
    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Bound address; resolves an ephemeral port
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Connections accepted so far
    pub fn accepted_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Bind and listen on the owning reactor; returns the bound address
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if !self.inner.transition(SocketState::Created, SocketState::Connecting) {
            return Err(NetworkError::configuration(
                format!("{} is already bound or closed", self.inner),
                None,
            ));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        if let Err(e) = self.inner.reactor.offer(move || {
            let _ = done_tx.send(inner.bind_on_reactor(addr));
        }) {
            self.inner.set_state(SocketState::Created);
            return Err(e);
        }

        done_rx
            .await
            .map_err(|_| NetworkError::closed("reactor dropped the bind task"))?
    }

    /// Start accepting; `consumer` runs on the reactor thread once per
    /// connection and must not block
    pub fn accept<F>(&self, consumer: F) -> Result<()>
    where
        F: FnMut(AcceptRequest) + Send + 'static,
    {
        if self.state() != SocketState::Open {
            return Err(NetworkError::configuration(
                format!("{} is not bound", self.inner),
                None,
            ));
        }
        if self.inner.accepting.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::configuration(
                format!("{} is already accepting", self.inner),
                None,
            ));
        }

        let inner = Arc::clone(&self.inner);
        self.inner.reactor.offer(move || {
            let listener = inner.listener.lock().take();
            match listener {
                Some(listener) => {
                    tokio::task::spawn_local(accept_loop(inner, listener, consumer));
                }
                None => warn!(server = %inner, "Listener gone before accepting started"),
            }
        })
    }

    /// Stop listening; idempotent
    pub fn close(&self) {
        self.inner.initiate_close();
    }
}

impl fmt::Debug for AsyncServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncServerSocket")
            .field("id", &self.inner.id)
            .field("reactor", &self.inner.reactor.name())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl fmt::Display for ServerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.local_addr.lock() {
            Some(addr) => write!(f, "server#{}[{}]", self.id, addr),
            None => write!(f, "server#{}[unbound]", self.id),
        }
    }
}

impl Closeable for ServerInner {
    fn close(&self) {
        self.initiate_close();
    }
}

impl ServerInner {
    fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SocketState, to: SocketState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn bind_on_reactor(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let bound = self.listen(addr).and_then(|listener| {
            let local = listener.local_addr()?;
            let closeable: Arc<dyn Closeable> = Arc::clone(self) as Arc<dyn Closeable>;
            let id = self.reactor.register_closeable(closeable)?;
            *self.closeable_id.lock() = Some(id);
            *self.local_addr.lock() = Some(local);
            *self.listener.lock() = Some(listener);
            Ok(local)
        });

        match bound {
            Ok(local) => {
                if !self.transition(SocketState::Connecting, SocketState::Open) {
                    // Closed while binding
                    self.listener.lock().take();
                    self.finish_close();
                    return Err(NetworkError::closed(format!("{self} closed while binding")));
                }
                info!(
                    server = %self,
                    reactor = %self.reactor.name(),
                    tls = self.tls.is_some(),
                    backlog = self.options.backlog,
                    "Server socket listening"
                );
                Ok(local)
            }
            Err(e) => {
                warn!(server = %self, addr = %addr, error = %e, "Bind failed");
                self.set_state(SocketState::Created);
                Err(e)
            }
        }
    }

    fn listen(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;
        self.options.apply(&socket)?;
        socket.bind(addr).map_err(|e| {
            NetworkError::connection_with_source(format!("bind to {addr} failed"), None, e)
        })?;
        Ok(socket.listen(self.options.backlog)?)
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
        if current == SocketState::Connecting as u8 {
            // bind_on_reactor sees Closing and finishes the close
            return;
        }
        if !self.accepting.load(Ordering::Acquire) {
            let listener = self.listener.lock().take();
            drop(listener);
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        self.set_state(SocketState::Closed);
        if let Some(id) = self.closeable_id.lock().take() {
            if let Err(e) = self.reactor.deregister_closeable(id) {
                trace!(server = %self, error = %e, "Deregistration skipped");
            }
        }
        info!(
            server = %self,
            accepted = self.accepted.load(Ordering::Relaxed),
            "Server socket closed"
        );
    }
}

async fn accept_loop<F>(inner: Arc<ServerInner>, listener: TcpListener, mut consumer: F)
where
    F: FnMut(AcceptRequest) + Send + 'static,
{
    let local_addr = listener.local_addr().ok().or(*inner.local_addr.lock());
    loop {
        tokio::select! {
            biased;
            _ = inner.close_notify.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    inner.accepted.fetch_add(1, Ordering::Relaxed);
                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(server = %inner, peer = %peer_addr, error = %e, "Failed to detach accepted connection");
                            continue;
                        }
                    };
                    let request = AcceptRequest {
                        stream,
                        peer_addr,
                        local_addr: local_addr.unwrap_or(peer_addr),
                        tls: inner.tls.clone(),
                    };
                    debug!(server = %inner, peer = %peer_addr, "Connection accepted");
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer(request))) {
                        error!(
                            server = %inner,
                            panic = %panic_message(panic.as_ref()),
                            "Accept consumer panicked"
                        );
                    }
                }
                Err(e) => {
                    warn!(server = %inner, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    inner.finish_close();
}
