//! One connection to a partition server, shared by every partition it serves

use crate::error::{Result, RpcError};
use crate::pending::{PendingRequest, PendingRequests, Reply, ResponseHandler};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tpc_codec::{BufferPool, IoBuffer};
use tpc_network::{AsyncSocket, Reactor, SocketOptions, TlsEngineFactory};
use tracing::{debug, trace};

pub(crate) struct RequestChannel {
    address: SocketAddr,
    reactor: Reactor,
    socket: AsyncSocket,
    pending: Arc<PendingRequests>,
}

impl RequestChannel {
    /// Open the connection on `reactor`, through TLS when `tls` is set;
    /// response frames are decoded into buffers from `pool`
    pub(crate) async fn connect(
        address: SocketAddr,
        reactor: Reactor,
        options: SocketOptions,
        tls: Option<Arc<dyn TlsEngineFactory>>,
        pool: BufferPool,
    ) -> Result<Self> {
        let pending = Arc::new(PendingRequests::default());
        let mut builder = reactor.socket_builder().options(options);
        if let Some(tls) = tls {
            builder = builder.tls(tls);
        }
        let socket = builder
            .frame_handler(ResponseHandler::new(Arc::clone(&pending)), pool)
            .build()?;
        socket.connect(address).await?;
        debug!(socket = %socket, reactor = %reactor.name(), "Request channel connected");

        Ok(Self {
            address,
            reactor,
            socket,
            pending,
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Hand a complete request to the owning reactor
    ///
    /// Only a reactor that is not running is reported here. Everything else
    /// (closed connection, abandoned request) is resolved through `reply`.
    pub(crate) fn submit(&self, partition_id: u32, request: IoBuffer, reply: Reply) -> Result<()> {
        let socket = self.socket.clone();
        let pending = Arc::clone(&self.pending);
        self.reactor
            .offer(move || {
                if reply.is_closed() {
                    trace!(partition_id, "Request abandoned before it was written");
                    drop(request);
                    return;
                }
                pending.push(PendingRequest {
                    partition_id,
                    reply,
                    submitted_at: Instant::now(),
                });
                if let Err(e) = socket.write_and_flush(request) {
                    debug!(socket = %socket, partition_id, error = %e, "Request rejected by closed connection");
                    if let Some(rejected) = pending.pop_back() {
                        let _ = rejected.reply.send(Err(RpcError::ConnectionClosed {
                            partition_id: rejected.partition_id,
                        }));
                    }
                }
            })
            .map_err(RpcError::from)
    }

    pub(crate) fn close(&self) {
        self.socket.close();
    }
}

impl fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestChannel")
            .field("address", &self.address)
            .field("reactor", &self.reactor.name())
            .field("state", &self.socket.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}
