//! Partition-routing client
//!
//! [`RpcClient::connect`] resolves every partition once, opens one
//! connection per distinct `(server address, client reactor)` pair and builds
//! the fixed table of [`PartitionActorRef`]s. Requests for partitions that
//! share a destination share its connection; response order on a connection
//! matches request order, which is what correlation relies on.

use crate::actor_ref::PartitionActorRef;
use crate::channel::RequestChannel;
use crate::error::{Result, RpcError};
use crate::partition::{partition_for, PartitionKey};
use crate::resolver::DestinationResolver;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tpc_codec::BufferPool;
use tpc_config::EngineConfig;
use tpc_network::{NetworkError, SocketOptions, TlsEngineFactory};
use tracing::info;

/// Client settings
#[derive(Clone)]
pub struct RpcConfig {
    /// Fixed for the life of the client
    pub partition_count: u32,
    /// Default wait budget of every request
    pub request_timeout: Duration,
    /// Options of the client connections
    pub socket_options: SocketOptions,
    /// Upgrade every connection to TLS when set
    pub tls: Option<Arc<dyn TlsEngineFactory>>,
}

impl std::fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConfig")
            .field("partition_count", &self.partition_count)
            .field("request_timeout", &self.request_timeout)
            .field("socket_options", &self.socket_options)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            request_timeout: Duration::from_secs(120),
            socket_options: SocketOptions::default(),
            tls: None,
        }
    }
}

impl From<&EngineConfig> for RpcConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            partition_count: config.rpc.partition_count,
            request_timeout: Duration::from_millis(config.rpc.request_timeout_ms),
            socket_options: SocketOptions::from(&config.socket),
            tls: None,
        }
    }
}

impl RpcConfig {
    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, factory: Arc<dyn TlsEngineFactory>) -> Self {
        self.tls = Some(factory);
        self
    }
}

/// Connected client holding one actor ref per partition
pub struct RpcClient {
    config: RpcConfig,
    refs: Vec<PartitionActorRef>,
    channels: Vec<Arc<RequestChannel>>,
    pool: BufferPool,
}

impl RpcClient {
    /// Resolve and connect every partition; fails if any destination is
    /// unreachable, closing the connections opened so far
    pub async fn connect(
        config: RpcConfig,
        resolver: &dyn DestinationResolver,
        pool: BufferPool,
    ) -> Result<Self> {
        if config.partition_count == 0 {
            return Err(RpcError::Network(NetworkError::configuration(
                "partition count must be positive",
                Some("partition_count"),
            )));
        }

        let mut by_destination: HashMap<(SocketAddr, usize), Arc<RequestChannel>> = HashMap::new();
        let mut channels: Vec<Arc<RequestChannel>> = Vec::new();
        let mut refs = Vec::with_capacity(config.partition_count as usize);

        for partition_id in 0..config.partition_count {
            let destination = resolver.resolve(partition_id)?;
            let key = (destination.address, destination.reactor.id());
            let channel = match by_destination.get(&key) {
                Some(channel) => Arc::clone(channel),
                None => {
                    let connected = RequestChannel::connect(
                        destination.address,
                        destination.reactor,
                        config.socket_options.clone(),
                        config.tls.clone(),
                        pool.clone(),
                    )
                    .await;
                    let channel = match connected {
                        Ok(channel) => Arc::new(channel),
                        Err(e) => {
                            for opened in &channels {
                                opened.close();
                            }
                            return Err(e);
                        }
                    };
                    by_destination.insert(key, Arc::clone(&channel));
                    channels.push(Arc::clone(&channel));
                    channel
                }
            };
            refs.push(PartitionActorRef::new(
                partition_id,
                channel,
                config.request_timeout,
            ));
        }

        info!(
            partitions = config.partition_count,
            connections = channels.len(),
            timeout_ms = config.request_timeout.as_millis() as u64,
            "RPC client connected"
        );
        Ok(Self {
            config,
            refs,
            channels,
            pool,
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn partition_count(&self) -> u32 {
        self.config.partition_count
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Distinct connections held by the client
    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }

    /// Pool request and response buffers are drawn from
    pub fn allocator(&self) -> &BufferPool {
        &self.pool
    }

    pub fn partition_ref(&self, partition_id: u32) -> Result<&PartitionActorRef> {
        self.refs
            .get(partition_id as usize)
            .ok_or_else(|| RpcError::invalid_partition(partition_id, self.config.partition_count))
    }

    pub fn partition_for_key<K: PartitionKey + ?Sized>(&self, key: &K) -> u32 {
        partition_for(key, self.config.partition_count)
    }

    /// Actor ref of the partition owning `key`
    pub fn ref_for_key<K: PartitionKey + ?Sized>(&self, key: &K) -> &PartitionActorRef {
        // partition_for never exceeds the table built in connect
        &self.refs[self.partition_for_key(key) as usize]
    }

    /// Close every connection; outstanding requests fail with
    /// [`RpcError::ConnectionClosed`]
    pub fn close(&self) {
        for channel in &self.channels {
            channel.close();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("partitions", &self.config.partition_count)
            .field("channels", &self.channels)
            .finish()
    }
}
