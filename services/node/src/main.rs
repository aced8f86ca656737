//! TPC node binary
//!
//! Usage:
//!   tpc-node --config config/node.toml serve --bind 0.0.0.0:5701
//!   tpc-node bench --server 127.0.0.1:5701 --rounds 10000

mod bench;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tpc_config::EngineConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tpc-node")]
#[command(about = "Thread-per-core partition server and RPC benchmark")]
#[command(version)]
struct Args {
    /// Path to configuration file; TPC__ environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve partitions from an in-memory store until Ctrl-C
    Serve(serve::ServeArgs),
    /// Drive noop/set/get rounds against a server and report latency
    Bench(bench::BenchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = EngineConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;
    info!(
        reactors = config.reactor.effective_count(),
        partitions = config.rpc.partition_count,
        "Configuration loaded"
    );

    match args.command {
        Command::Serve(serve_args) => serve::run(&config, serve_args).await,
        Command::Bench(bench_args) => bench::run(&config, bench_args).await,
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
