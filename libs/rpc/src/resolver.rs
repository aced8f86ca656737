//! Partition destinations
//!
//! The partition to destination mapping is resolved once, when the client
//! connects, and never changes afterwards.

use crate::error::{Result, RpcError};
use std::net::SocketAddr;
use tpc_network::{NetworkError, Reactor};

/// Where a partition's requests go: the server address and the client
/// reactor that owns the connection to it
#[derive(Debug, Clone)]
pub struct Destination {
    pub address: SocketAddr,
    pub reactor: Reactor,
}

/// Maps partition ids to destinations
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, partition_id: u32) -> Result<Destination>;
}

impl<F> DestinationResolver for F
where
    F: Fn(u32) -> Result<Destination> + Send + Sync,
{
    fn resolve(&self, partition_id: u32) -> Result<Destination> {
        self(partition_id)
    }
}

/// Spreads partitions over servers and client reactors by partition id
///
/// Partition `p` goes to `addresses[p % addresses.len()]` over a connection
/// owned by `reactors[p % reactors.len()]`.
#[derive(Debug, Clone)]
pub struct RoundRobinResolver {
    addresses: Vec<SocketAddr>,
    reactors: Vec<Reactor>,
}

impl RoundRobinResolver {
    pub fn new(addresses: Vec<SocketAddr>, reactors: Vec<Reactor>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(RpcError::Network(NetworkError::configuration(
                "at least one server address is required",
                Some("addresses"),
            )));
        }
        if reactors.is_empty() {
            return Err(RpcError::Network(NetworkError::configuration(
                "at least one client reactor is required",
                Some("reactors"),
            )));
        }
        Ok(Self {
            addresses,
            reactors,
        })
    }
}

impl DestinationResolver for RoundRobinResolver {
    fn resolve(&self, partition_id: u32) -> Result<Destination> {
        let index = partition_id as usize;
        Ok(Destination {
            address: self.addresses[index % self.addresses.len()],
            reactor: self.reactors[index % self.reactors.len()].clone(),
        })
    }
}
