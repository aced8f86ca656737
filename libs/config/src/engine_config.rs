//! Engine Configuration Module
//!
//! Provides configuration loading for TPC nodes and clients.
//! Supports an optional TOML file with `TPC__SECTION__KEY` environment overrides.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Prefix for environment overrides, e.g. `TPC__RPC__REQUEST_TIMEOUT_MS=250`
pub const ENV_PREFIX: &str = "TPC";

/// Smallest meaningful frame: header only
const MIN_FRAME_SIZE: usize = 12;

/// Main engine configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub reactor: ReactorSettings,
    pub socket: SocketSettings,
    pub rpc: RpcSettings,
    pub buffer: BufferSettings,
}

/// Reactor thread settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReactorSettings {
    /// Number of reactors; `0` means one per available core
    pub count: usize,
    pub pin_to_cores: bool,
    /// Time allowed for socket tasks to finish closing on shutdown
    pub shutdown_grace_ms: u64,
}

/// Socket options applied to every socket a reactor opens
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SocketSettings {
    pub reuse_address: bool,
    /// Best effort; ignored where the platform lacks SO_REUSEPORT
    pub reuse_port: bool,
    pub receive_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    pub tcp_nodelay: bool,
    /// Listen backlog for server sockets (advisory)
    pub backlog: u32,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
}

/// Partition routing settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RpcSettings {
    pub partition_count: u32,
    pub request_timeout_ms: u64,
}

/// Buffer pool settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BufferSettings {
    pub initial_capacity: usize,
    pub max_pooled: usize,
    /// Grown blocks are shrunk to this size before going back on the free list
    pub max_block_size: usize,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            count: 0,
            pin_to_cores: false,
            shutdown_grace_ms: 1_000,
        }
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            reuse_address: true,
            reuse_port: false,
            receive_buffer_size: None,
            send_buffer_size: None,
            tcp_nodelay: true,
            backlog: 1024,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            read_buffer_size: 64 * 1024,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            partition_count: 271,
            request_timeout_ms: 120_000,
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 128,
            max_pooled: 1024,
            max_block_size: 64 * 1024,
        }
    }
}

impl ReactorSettings {
    /// Concrete reactor count, resolving `0` to the number of cores
    pub fn effective_count(&self) -> usize {
        if self.count > 0 {
            return self.count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl EngineConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading engine config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (TPC__ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "Engine configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Reject settings no engine can run with
    pub fn validate(&self) -> Result<()> {
        if self.rpc.partition_count == 0 {
            bail!("rpc.partition_count must be greater than zero");
        }
        if self.rpc.request_timeout_ms == 0 {
            bail!("rpc.request_timeout_ms must be greater than zero");
        }
        if self.socket.connect_timeout_ms == 0 || self.socket.handshake_timeout_ms == 0 {
            bail!("socket timeouts must be greater than zero");
        }
        if self.socket.max_frame_size < MIN_FRAME_SIZE {
            bail!(
                "socket.max_frame_size {} is smaller than the {} byte frame header",
                self.socket.max_frame_size,
                MIN_FRAME_SIZE
            );
        }
        if self.socket.read_buffer_size == 0 {
            bail!("socket.read_buffer_size must be greater than zero");
        }
        if self.buffer.initial_capacity == 0 {
            bail!("buffer.initial_capacity must be greater than zero");
        }
        if self.buffer.max_block_size < self.buffer.initial_capacity {
            bail!(
                "buffer.max_block_size {} is smaller than buffer.initial_capacity {}",
                self.buffer.max_block_size,
                self.buffer.initial_capacity
            );
        }
        Ok(())
    }
}
