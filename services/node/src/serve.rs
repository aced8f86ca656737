//! `serve`: partition server over the in-memory store

use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tpc_codec::BufferPool;
use tpc_config::EngineConfig;
use tpc_network::{start_reactors, Reactor, SocketOptions};
use tpc_rpc::{MemoryStore, PartitionServer};
use tracing::{info, warn};

const TERMINATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:5701")]
    bind: SocketAddr,
}

pub async fn run(config: &EngineConfig, args: ServeArgs) -> Result<()> {
    let options = SocketOptions::from(&config.socket);
    let reactors = start_reactors("tpc-server", &config.reactor, &options)
        .context("Failed to start reactors")?;
    let acceptor = reactors
        .first()
        .cloned()
        .context("Reactor count resolved to zero")?;

    let pool = BufferPool::with_limits(
        config.buffer.initial_capacity,
        config.buffer.max_pooled,
        config.buffer.max_block_size,
    );
    let store = Arc::new(MemoryStore::new(config.rpc.partition_count));
    let server = PartitionServer::builder(acceptor, store)
        .workers(reactors.clone())
        .partition_count(config.rpc.partition_count)
        .pool(pool.clone())
        .options(options)
        .bind(args.bind)
        .await
        .context("Failed to bind partition server")?;
    info!(addr = %server.local_addr(), reactors = reactors.len(), "Serving partitions; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    info!("Received shutdown signal");

    server.close();
    shutdown(&reactors);
    info!(
        accepted = server.accepted_count(),
        outstanding_buffers = pool.outstanding(),
        "Server stopped"
    );
    Ok(())
}

pub(crate) fn shutdown(reactors: &[Reactor]) {
    for reactor in reactors {
        reactor.shutdown();
    }
    for reactor in reactors {
        if !reactor.await_termination(TERMINATION_TIMEOUT) {
            warn!(reactor = %reactor.name(), "Reactor did not terminate in time");
        }
    }
}
