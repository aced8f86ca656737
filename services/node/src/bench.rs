//! `bench`: latency of noop/set/get rounds against a running server

use crate::serve::shutdown;
use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tpc_codec::BufferPool;
use tpc_config::EngineConfig;
use tpc_network::{start_reactors, SocketOptions};
use tpc_rpc::{RoundRobinResolver, RpcClient, RpcConfig, Table};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:5701")]
    server: SocketAddr,

    /// Rounds of noop, set and get
    #[arg(short, long, default_value_t = 10_000)]
    rounds: usize,

    /// Noops kept in flight per concurrent round
    #[arg(long, default_value_t = 64)]
    concurrency: usize,

    /// Table the set/get rounds write to
    #[arg(long, default_value = "bench")]
    table: String,
}

#[derive(Default)]
struct Latencies {
    samples: Vec<Duration>,
    failures: usize,
}

impl Latencies {
    fn record<T>(&mut self, started: Instant, result: tpc_rpc::Result<T>) {
        match result {
            Ok(_) => self.samples.push(started.elapsed()),
            Err(e) => {
                self.failures += 1;
                if self.failures == 1 {
                    warn!(error = %e, category = e.category(), "First request failure");
                }
            }
        }
    }

    fn report(mut self, operation: &str) {
        if self.samples.is_empty() {
            warn!(operation, failures = self.failures, "No successful requests");
            return;
        }
        self.samples.sort_unstable();
        let percentile = |p: f64| {
            let index = ((self.samples.len() - 1) as f64 * p).round() as usize;
            self.samples[index].as_micros() as u64
        };
        info!(
            operation,
            ok = self.samples.len(),
            failures = self.failures,
            p50_us = percentile(0.50),
            p99_us = percentile(0.99),
            max_us = percentile(1.0),
            "Latency"
        );
    }
}

pub async fn run(config: &EngineConfig, args: BenchArgs) -> Result<()> {
    let options = SocketOptions::from(&config.socket);
    let reactors = start_reactors("tpc-client", &config.reactor, &options)
        .context("Failed to start client reactors")?;
    let result = drive(config, &args, &reactors).await;
    shutdown(&reactors);
    result
}

async fn drive(config: &EngineConfig, args: &BenchArgs, reactors: &[tpc_network::Reactor]) -> Result<()> {
    let resolver = RoundRobinResolver::new(vec![args.server], reactors.to_vec())?;
    let pool = BufferPool::with_limits(
        config.buffer.initial_capacity,
        config.buffer.max_pooled,
        config.buffer.max_block_size,
    );
    let client = RpcClient::connect(RpcConfig::from(config), &resolver, pool)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;
    let table = Table::new(args.table.as_str(), Arc::new(client));
    info!(server = %args.server, rounds = args.rounds, "Benchmark started");

    let mut noop = Latencies::default();
    let mut set = Latencies::default();
    let mut get = Latencies::default();
    let mut concurrent = Latencies::default();
    let started = Instant::now();

    for round in 0..args.rounds {
        let key = format!("key-{round}");

        let at = Instant::now();
        noop.record(at, table.noop_random().await);

        let at = Instant::now();
        set.record(at, table.set(key.as_bytes(), &round.to_be_bytes()).await);

        let at = Instant::now();
        get.record(at, table.get(key.as_bytes()).await);

        if round % 100 == 0 {
            let partition_id = table.client().partition_for_key(key.as_str());
            let at = Instant::now();
            concurrent.record(at, table.concurrent_noop(args.concurrency, partition_id).await);
        }
    }

    let elapsed = started.elapsed();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        rounds_per_sec = (args.rounds as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "Benchmark finished"
    );
    noop.report("noop");
    set.report("set");
    get.report("get");
    concurrent.report("concurrent_noop");

    match table.query_all().await {
        Ok(entries) => info!(table = %table.name(), entries, "Table size"),
        Err(e) => warn!(error = %e, "Query failed"),
    }
    table.client().close();
    Ok(())
}
