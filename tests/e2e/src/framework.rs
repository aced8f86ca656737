//! Core E2E testing framework
//!
//! Starts real reactors, a partition server over [`MemoryStore`] and a
//! connected [`RpcClient`] on `127.0.0.1:0`. Server and client get separate
//! buffer pools so each side's accounting can be checked on its own.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tpc_codec::{construct_complete, write_request_header, BufferAllocator, BufferPool, IoBuffer, Opcode};
use tpc_network::{
    AsyncServerSocket, EchoHandler, Reactor, ReactorConfig, SelfSignedEngineFactory, TlsEngineFactory,
};
use tpc_rpc::{
    Destination, MemoryStore, PartitionServer, RoundRobinResolver, RpcClient, RpcConfig, Table,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound for anything that should happen "promptly"
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Route test logs through the test harness; `RUST_LOG` overrides `warn`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn start_reactor(name: &str) -> Result<Reactor> {
    let reactor = Reactor::new(
        ReactorConfig::new(name).with_shutdown_grace(Duration::from_millis(500)),
    );
    reactor
        .start()
        .with_context(|| format!("Failed to start reactor {name}"))?;
    Ok(reactor)
}

/// Shut every reactor down, then wait for each thread to exit
pub fn stop_reactors(reactors: &[Reactor]) -> Result<()> {
    for reactor in reactors {
        reactor.shutdown();
    }
    for reactor in reactors {
        if !reactor.await_termination(WAIT) {
            bail!("reactor {} did not terminate", reactor.name());
        }
    }
    Ok(())
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Complete GET frame carrying one i64
pub fn get_request(pool: &BufferPool, partition_id: u32, value: i64) -> Result<IoBuffer> {
    let mut buffer = pool.allocate(32);
    write_request_header(&mut buffer, partition_id, Opcode::Get);
    buffer.write_i64(value);
    construct_complete(&mut buffer)?;
    Ok(buffer)
}

/// Fresh self-signed factory used by both ends of a TLS scenario
pub fn self_signed_tls() -> Result<Arc<dyn TlsEngineFactory>> {
    Ok(Arc::new(SelfSignedEngineFactory::for_hosts(&["localhost", "127.0.0.1"])?))
}

/// Echo server on `reactor`; accepted connections live on the same reactor
pub async fn echo_server(
    reactor: &Reactor,
    pool: &BufferPool,
    tls: Option<Arc<dyn TlsEngineFactory>>,
) -> Result<(AsyncServerSocket, SocketAddr)> {
    let mut builder = reactor.server_socket_builder();
    if let Some(tls) = tls {
        builder = builder.tls(tls);
    }
    let server = builder.build();
    let addr = server.bind("127.0.0.1:0".parse()?).await?;

    let worker = reactor.clone();
    let pool = pool.clone();
    server.accept(move |request| {
        let peer = request.peer_addr();
        let started = worker
            .socket_builder()
            .frame_handler(EchoHandler, pool.clone())
            .accept_request(request)
            .build()
            .and_then(|socket| socket.start());
        if let Err(e) = started {
            warn!(peer = %peer, error = %e, "Echo connection failed to start");
        }
    })?;
    debug!(addr = %addr, "Echo server listening");
    Ok((server, addr))
}

/// Client resolving every partition to one address over one reactor
pub async fn single_destination_client(
    addr: SocketAddr,
    reactor: &Reactor,
    config: RpcConfig,
    pool: BufferPool,
) -> Result<RpcClient> {
    let reactor = reactor.clone();
    let resolver = move |_: u32| -> tpc_rpc::Result<Destination> {
        Ok(Destination {
            address: addr,
            reactor: reactor.clone(),
        })
    };
    Ok(RpcClient::connect(config, &resolver, pool).await?)
}

/// Blocks a reactor thread until released or dropped
pub struct Stall {
    release: Option<std_mpsc::Sender<()>>,
}

impl Stall {
    /// Occupy `reactor` with a blocking task; returns once the task runs
    pub fn begin(reactor: &Reactor) -> Result<Self> {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        reactor.offer(move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
        })?;
        entered_rx
            .recv_timeout(WAIT)
            .context("Reactor never picked up the stall task")?;
        Ok(Self {
            release: Some(release_tx),
        })
    }

    pub fn release(mut self) {
        self.release.take();
    }
}

impl Drop for Stall {
    fn drop(&mut self) {
        self.release.take();
    }
}

/// Cluster shape
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub server_reactors: usize,
    pub client_reactors: usize,
    pub partition_count: u32,
    pub request_timeout: Duration,
    pub tls: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_reactors: 2,
            client_reactors: 2,
            partition_count: 16,
            request_timeout: WAIT,
            tls: false,
        }
    }
}

impl ClusterConfig {
    pub fn with_client_reactors(mut self, count: usize) -> Self {
        self.client_reactors = count;
        self
    }

    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }
}

/// Partition server plus a connected client, all on dedicated reactors
///
/// Partition `p` is served over a connection owned by client reactor
/// `p % client_reactors`.
pub struct TestCluster {
    server_reactors: Vec<Reactor>,
    client_reactors: Vec<Reactor>,
    server: PartitionServer,
    store: Arc<MemoryStore>,
    client: Arc<RpcClient>,
    client_pool: BufferPool,
    server_pool: BufferPool,
}

impl TestCluster {
    pub async fn start(name: &str, config: ClusterConfig) -> Result<Self> {
        init_tracing();
        if config.server_reactors == 0 || config.client_reactors == 0 {
            bail!("a cluster needs at least one server and one client reactor");
        }

        let server_reactors = (0..config.server_reactors)
            .map(|i| start_reactor(&format!("{name}-server-{i}")))
            .collect::<Result<Vec<_>>>()?;
        let client_reactors = (0..config.client_reactors)
            .map(|i| start_reactor(&format!("{name}-client-{i}")))
            .collect::<Result<Vec<_>>>()?;
        let tls = if config.tls { Some(self_signed_tls()?) } else { None };

        let store = Arc::new(MemoryStore::new(config.partition_count));
        let server_pool = BufferPool::default();
        let mut server_builder = PartitionServer::builder(server_reactors[0].clone(), store.clone())
            .workers(server_reactors.clone())
            .partition_count(config.partition_count)
            .pool(server_pool.clone());
        if let Some(tls) = &tls {
            server_builder = server_builder.tls(Arc::clone(tls));
        }
        let server = server_builder.bind("127.0.0.1:0".parse()?).await?;

        let resolver = RoundRobinResolver::new(vec![server.local_addr()], client_reactors.clone())?;
        let mut rpc_config = RpcConfig::default()
            .with_partition_count(config.partition_count)
            .with_request_timeout(config.request_timeout);
        if let Some(tls) = tls {
            rpc_config = rpc_config.with_tls(tls);
        }
        let client_pool = BufferPool::default();
        let client = RpcClient::connect(rpc_config, &resolver, client_pool.clone()).await?;
        info!(
            cluster = name,
            addr = %server.local_addr(),
            connections = client.connection_count(),
            "Test cluster running"
        );

        Ok(Self {
            server_reactors,
            client_reactors,
            server,
            store,
            client: Arc::new(client),
            client_pool,
            server_pool,
        })
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn table(&self, name: &str) -> Table {
        Table::new(name, Arc::clone(&self.client))
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn server(&self) -> &PartitionServer {
        &self.server
    }

    pub fn client_reactors(&self) -> &[Reactor] {
        &self.client_reactors
    }

    pub fn client_pool(&self) -> &BufferPool {
        &self.client_pool
    }

    pub fn server_pool(&self) -> &BufferPool {
        &self.server_pool
    }

    /// Close client and server, then stop every reactor
    pub fn shutdown(self) -> Result<()> {
        self.client.close();
        self.server.close();
        stop_reactors(&self.client_reactors)?;
        stop_reactors(&self.server_reactors)
    }
}
