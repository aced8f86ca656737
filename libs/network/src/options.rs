//! Socket options
//!
//! Pass-through configuration applied to every `TcpSocket` before bind or
//! connect. Reuse-port is best effort: where the platform has no
//! `SO_REUSEPORT` the option is ignored and a warning is logged once per
//! process.

use crate::error::{NetworkError, Result};
use std::time::Duration;
use tokio::net::TcpSocket;
use tpc_codec::DEFAULT_MAX_FRAME_SIZE;
use tpc_config::SocketSettings;

#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
static REUSE_PORT_WARNED: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

/// Options for server and client sockets
#[derive(Debug, Clone, PartialEq)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub receive_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    pub tcp_nodelay: bool,
    /// Listen backlog, server sockets only
    pub backlog: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Initial capacity of the per-connection read buffer
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            reuse_port: false,
            receive_buffer_size: None,
            send_buffer_size: None,
            tcp_nodelay: true,
            backlog: 1024,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            read_buffer_size: 64 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl From<&SocketSettings> for SocketOptions {
    fn from(settings: &SocketSettings) -> Self {
        Self {
            reuse_address: settings.reuse_address,
            reuse_port: settings.reuse_port,
            receive_buffer_size: settings.receive_buffer_size,
            send_buffer_size: settings.send_buffer_size,
            tcp_nodelay: settings.tcp_nodelay,
            backlog: settings.backlog,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            read_buffer_size: settings.read_buffer_size,
            max_frame_size: settings.max_frame_size,
        }
    }
}

impl SocketOptions {
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn with_reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    pub fn with_receive_buffer_size(mut self, bytes: u32) -> Self {
        self.receive_buffer_size = Some(bytes);
        self
    }

    pub fn with_send_buffer_size(mut self, bytes: u32) -> Self {
        self.send_buffer_size = Some(bytes);
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Apply the options to an unbound socket
    pub(crate) fn apply(&self, socket: &TcpSocket) -> Result<()> {
        socket
            .set_reuseaddr(self.reuse_address)
            .map_err(|e| option_error("reuse_address", e))?;
        if self.reuse_port {
            apply_reuse_port(socket)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .map_err(|e| option_error("receive_buffer_size", e))?;
        }
        if let Some(size) = self.send_buffer_size {
            socket
                .set_send_buffer_size(size)
                .map_err(|e| option_error("send_buffer_size", e))?;
        }
        Ok(())
    }
}

fn option_error(field: &str, error: std::io::Error) -> NetworkError {
    NetworkError::configuration(format!("failed to set {field}: {error}"), Some(field))
}

#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
fn apply_reuse_port(socket: &TcpSocket) -> Result<()> {
    socket
        .set_reuseport(true)
        .map_err(|e| option_error("reuse_port", e))
}

#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
fn apply_reuse_port(_socket: &TcpSocket) -> Result<()> {
    if !REUSE_PORT_WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
        tracing::warn!("SO_REUSEPORT is not supported on this platform; ignoring reuse_port");
    }
    Ok(())
}
