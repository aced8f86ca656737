//! # TPC Engine Configuration
//!
//! Serde-backed settings shared by reactors, sockets, the buffer pool and the
//! partition client. Every field has a default, so an empty file (or no file)
//! yields a runnable configuration.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tpc_config::EngineConfig;
//!
//! let config = EngineConfig::load(Some(std::path::Path::new("config/node.toml")))?;
//! println!("{} partitions", config.rpc.partition_count);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod engine_config;

// Re-export commonly used types
pub use engine_config::{
    BufferSettings, EngineConfig, ReactorSettings, RpcSettings, SocketSettings, ENV_PREFIX,
};
