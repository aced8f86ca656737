//! TLS upgrade for reactor sockets
//!
//! A [`TlsEngineFactory`] is consulted once per connection: on connect for
//! client sockets, on accept for server-side sockets. The engine it returns
//! runs the handshake on the reactor thread in front of the plain byte
//! stream; once established, reads and writes go through the TLS session
//! transparently.
//!
//! ```text
//! None ──▶ Handshaking ──▶ Established ──▶ Closing
//!               │
//!               └── failure: client connect future fails,
//!                   accepted connection is dropped quietly
//! ```
//!
//! The stock implementation is [`RustlsEngineFactory`] over rustls with the
//! ring provider. With the `self-signed` feature, [`SelfSignedEngineFactory`]
//! generates a throwaway certificate trusted by its own client side.

use crate::error::{NetworkError, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Which end of the handshake an engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// TLS session state of a socket
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Plain socket, or TLS not started yet
    None = 0,
    Handshaking = 1,
    Established = 2,
    Closing = 3,
}

impl TlsState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => TlsState::Handshaking,
            2 => TlsState::Established,
            3 => TlsState::Closing,
            _ => TlsState::None,
        }
    }
}

/// Per-connection handshake engine
pub enum TlsEngine {
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Server(TlsAcceptor),
}

impl TlsEngine {
    pub fn role(&self) -> TlsRole {
        match self {
            TlsEngine::Client { .. } => TlsRole::Client,
            TlsEngine::Server(_) => TlsRole::Server,
        }
    }

    pub(crate) async fn handshake(self, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        match self {
            TlsEngine::Client {
                connector,
                server_name,
            } => connector
                .connect(server_name, stream)
                .await
                .map(TlsStream::from),
            TlsEngine::Server(acceptor) => acceptor.accept(stream).await.map(TlsStream::from),
        }
    }
}

/// Pluggable source of TLS engines
pub trait TlsEngineFactory: Send + Sync + 'static {
    fn create(&self, role: TlsRole, peer: SocketAddr) -> Result<TlsEngine>;
}

/// rustls-backed factory
///
/// Client engines verify the peer against `server_name` when set, otherwise
/// against the peer IP address.
#[derive(Clone, Default)]
pub struct RustlsEngineFactory {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<ServerName<'static>>,
}

impl RustlsEngineFactory {
    pub fn new(client: Option<Arc<ClientConfig>>, server: Option<Arc<ServerConfig>>) -> Self {
        Self {
            client,
            server,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(name.to_string()).map_err(|e| {
            NetworkError::configuration(format!("invalid TLS server name '{name}': {e}"), Some("server_name"))
        })?;
        self.server_name = Some(server_name);
        Ok(self)
    }
}

impl TlsEngineFactory for RustlsEngineFactory {
    fn create(&self, role: TlsRole, peer: SocketAddr) -> Result<TlsEngine> {
        match role {
            TlsRole::Client => {
                let config = self.client.clone().ok_or_else(|| {
                    NetworkError::configuration("no TLS client configuration", Some("client"))
                })?;
                let server_name = self
                    .server_name
                    .clone()
                    .unwrap_or_else(|| ServerName::from(peer.ip()));
                Ok(TlsEngine::Client {
                    connector: TlsConnector::from(config),
                    server_name,
                })
            }
            TlsRole::Server => {
                let config = self.server.clone().ok_or_else(|| {
                    NetworkError::configuration("no TLS server configuration", Some("server"))
                })?;
                Ok(TlsEngine::Server(TlsAcceptor::from(config)))
            }
        }
    }
}

/// Crypto provider used by every config this crate builds
pub fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(feature = "self-signed")]
pub use self_signed::SelfSignedEngineFactory;

#[cfg(feature = "self-signed")]
mod self_signed {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::RootCertStore;
    use tracing::debug;

    fn tls_config_error(error: impl std::fmt::Display) -> NetworkError {
        NetworkError::configuration(format!("TLS setup failed: {error}"), None)
    }

    /// Test factory: a fresh self-signed certificate that its own clients trust
    #[derive(Clone)]
    pub struct SelfSignedEngineFactory {
        inner: RustlsEngineFactory,
        certificate: CertificateDer<'static>,
    }

    impl SelfSignedEngineFactory {
        /// Certificate for `localhost`
        pub fn new() -> Result<Self> {
            Self::for_hosts(&["localhost"])
        }

        /// Certificate whose subject alternative names are `hosts`; clients
        /// verify against the first entry
        pub fn for_hosts(hosts: &[&str]) -> Result<Self> {
            let primary = hosts
                .first()
                .ok_or_else(|| NetworkError::configuration("at least one host is required", Some("hosts")))?;
            let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
            let certified = rcgen::generate_simple_self_signed(names).map_err(tls_config_error)?;
            let certificate = certified.cert.der().clone();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.key_pair.serialize_der(),
            ));

            let server = ServerConfig::builder_with_provider(ring_provider())
                .with_safe_default_protocol_versions()
                .map_err(tls_config_error)?
                .with_no_client_auth()
                .with_single_cert(vec![certificate.clone()], key)
                .map_err(tls_config_error)?;

            let mut roots = RootCertStore::empty();
            roots.add(certificate.clone()).map_err(tls_config_error)?;
            let client = ClientConfig::builder_with_provider(ring_provider())
                .with_safe_default_protocol_versions()
                .map_err(tls_config_error)?
                .with_root_certificates(roots)
                .with_no_client_auth();

            debug!(hosts = ?hosts, "Generated self-signed TLS certificate");
            let inner = RustlsEngineFactory::new(Some(Arc::new(client)), Some(Arc::new(server)))
                .with_server_name(primary)?;
            Ok(Self { inner, certificate })
        }

        /// DER encoding of the generated certificate
        pub fn certificate(&self) -> &CertificateDer<'static> {
            &self.certificate
        }
    }

    impl TlsEngineFactory for SelfSignedEngineFactory {
        fn create(&self, role: TlsRole, peer: SocketAddr) -> Result<TlsEngine> {
            self.inner.create(role, peer)
        }
    }
}
