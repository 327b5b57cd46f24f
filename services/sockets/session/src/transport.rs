//! Transport capability consumed by sessions, with a TCP and TLS adapter.
//!
//! Sessions only see the [`Transport`] and [`Acceptor`] traits. The default
//! [`TcpTransport`] resolves hosts with tokio, connects with [`TcpSocket`]
//! so that keepalive and local binding can be applied, and upgrades streams
//! to TLS with tokio-rustls when the `tls` feature is enabled.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::error::SocketError;

/// Any duplex byte stream a transport can hand to a session
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Unified stream type that can be plain TCP, an arbitrary boxed stream, or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Stream supplied by a non-TCP transport
    Boxed(Box<dyn AsyncStream>),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<IoStream>>),
    /// TLS server stream
    #[cfg(feature = "tls")]
    TlsServer(Box<tokio_rustls::server::TlsStream<IoStream>>),
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            IoStream::Boxed(_) => f.write_str("Boxed"),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) => f.write_str("TlsClient"),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(_) => f.write_str("TlsServer"),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Wrap an arbitrary duplex stream
    pub fn boxed<S: AsyncStream>(stream: S) -> Self {
        IoStream::Boxed(Box::new(stream))
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Boxed(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "boxed stream has no socket address",
            )),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsServer(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Whether the stream is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        match self {
            IoStream::Plain(_) | IoStream::Boxed(_) => false,
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) | IoStream::TlsServer(_) => true,
        }
    }
}

/// An established connection handed over by a transport
#[derive(Debug)]
pub struct Link {
    /// Byte stream
    pub stream: IoStream,
    /// Local endpoint, if known
    pub local_addr: Option<SocketAddr>,
    /// Remote endpoint, if known
    pub peer_addr: Option<SocketAddr>,
}

impl Link {
    /// Link over a connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream: IoStream::Plain(stream),
            local_addr,
            peer_addr,
        }
    }
}

/// Socket-level options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Disable Nagle's algorithm
    pub no_delay: bool,
    /// Enable TCP keepalive probes
    pub keep_alive: bool,
    /// Bind the outbound socket to this local address before connecting
    pub local_address: Option<SocketAddr>,
}

/// Which side of the TLS handshake this end plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    /// Initiate the handshake and verify the server
    Client,
    /// Answer the handshake with a certificate
    Server,
}

/// PEM-encoded certificate chain and private key
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate chain, leaf first
    pub cert_chain_pem: String,
    /// Private key (PKCS#8, PKCS#1 or SEC1)
    pub private_key_pem: String,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain_pem", &format_args!("{} bytes", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Parameters of a TLS upgrade
#[derive(Clone, Debug)]
pub struct TlsOptions {
    /// Handshake role
    pub role: TlsRole,
    /// SNI and verification name (client role)
    pub server_name: Option<String>,
    /// Trusted roots (client role) or client CA for mTLS (server role)
    pub ca_pem: Option<String>,
    /// Own certificate: required for servers, optional client auth for clients
    pub identity: Option<TlsIdentity>,
    /// ALPN protocols in preference order
    pub alpn: Vec<String>,
}

impl TlsOptions {
    /// Client upgrade verifying `server_name` against `ca_pem`
    pub fn client(server_name: impl Into<String>, ca_pem: impl Into<String>) -> Self {
        Self {
            role: TlsRole::Client,
            server_name: Some(server_name.into()),
            ca_pem: Some(ca_pem.into()),
            identity: None,
            alpn: Vec::new(),
        }
    }

    /// Server upgrade presenting `identity`
    pub fn server(identity: TlsIdentity) -> Self {
        Self {
            role: TlsRole::Server,
            server_name: None,
            ca_pem: None,
            identity: Some(identity),
            alpn: Vec::new(),
        }
    }

    /// Syntactic checks done before a session accepts the upgrade
    pub fn validate(&self) -> Result<(), SocketError> {
        match self.role {
            TlsRole::Client => {
                match self.server_name.as_deref() {
                    Some(name) if !name.trim().is_empty() => {}
                    _ => return Err(SocketError::invalid("tls client requires a server name")),
                }
                if self.ca_pem.as_deref().map_or(true, |pem| pem.trim().is_empty()) {
                    return Err(SocketError::invalid("tls client requires CA certificates"));
                }
            }
            TlsRole::Server => {
                if self.identity.is_none() {
                    return Err(SocketError::invalid("tls server requires an identity"));
                }
            }
        }
        if self.alpn.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(SocketError::invalid("alpn protocol names must be 1..=255 bytes"));
        }
        Ok(())
    }
}

/// Failures reported by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host name did not resolve
    #[error("address resolution failed for {host}: {source}")]
    Resolve {
        /// Host that failed to resolve
        host: String,
        /// Resolver error
        #[source]
        source: io::Error,
    },

    /// Connect refused, unreachable or reset
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// Local bind or listen failed
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// TLS configuration or handshake failed
    #[error("{0}")]
    Tls(String),

    /// I/O error on an established stream
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Operation this transport cannot perform
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<TransportError> for SocketError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Resolve { .. } | TransportError::Connect(_) => {
                SocketError::ConnectFailure(e.to_string())
            }
            TransportError::Tls(msg) => SocketError::TlsFailure(msg),
            TransportError::Bind(_) | TransportError::Io(_) | TransportError::Unsupported(_) => {
                SocketError::Transport(e.to_string())
            }
        }
    }
}

/// Source of inbound links for a listener
#[async_trait]
pub trait Acceptor: Send {
    /// Address the acceptor is bound to
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<Link, TransportError>;
}

/// Transport capability consumed by sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `host:port`
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &LinkOptions,
    ) -> Result<Link, TransportError>;

    /// Bind `host:port` and start accepting
    async fn bind(
        &self,
        host: &str,
        port: u16,
        backlog: u32,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError>;

    /// Run a TLS handshake over an established stream
    async fn upgrade_tls(
        &self,
        stream: IoStream,
        options: &TlsOptions,
    ) -> Result<IoStream, TransportError>;
}

/// Create a TCP listener bound to the given address
pub fn listen_tcp(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address applying link options
pub async fn connect_tcp(addr: SocketAddr, options: &LinkOptions) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if options.keep_alive {
        socket.set_keepalive(true)?;
    }
    if let Some(local) = options.local_address {
        socket.bind(local)?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(options.no_delay)?;
    Ok(stream)
}

/// Plain TCP transport with rustls upgrades
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

/// TCP acceptor produced by [`TcpTransport::bind`]
pub struct TcpAcceptor {
    listener: TcpListener,
    options: LinkOptions,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    async fn accept(&mut self) -> Result<Link, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(self.options.no_delay)?;
        debug!("Accepted TCP connection from {}", peer);
        Ok(Link::from_tcp(stream))
    }
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?;
    Ok(addrs.collect())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &LinkOptions,
    ) -> Result<Link, TransportError> {
        let mut last_error = None;
        for addr in resolve(host, port).await? {
            debug!("Connecting to {} ({}:{})", addr, host, port);
            match connect_tcp(addr, options).await {
                Ok(stream) => return Ok(Link::from_tcp(stream)),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(TransportError::Connect(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            )
        })))
    }

    async fn bind(
        &self,
        host: &str,
        port: u16,
        backlog: u32,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let addr = resolve(host, port)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::Bind(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {}", host),
                ))
            })?;
        let listener = listen_tcp(addr, backlog).map_err(TransportError::Bind)?;
        Ok(Box::new(TcpAcceptor {
            listener,
            options: options.clone(),
        }))
    }

    async fn upgrade_tls(
        &self,
        stream: IoStream,
        options: &TlsOptions,
    ) -> Result<IoStream, TransportError> {
        #[cfg(feature = "tls")]
        {
            tls::upgrade(stream, options).await
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = (stream, options);
            Err(TransportError::Tls(
                "TLS requested but not compiled with TLS support".to_string(),
            ))
        }
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS configuration and handshakes for session upgrades
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::info;

    fn load_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse {}", what))?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in {}", what);
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(pem, "CA certificates")? {
            roots
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    fn alpn(options: &TlsOptions) -> Vec<Vec<u8>> {
        options.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    /// Create a TLS client configuration, with client auth when an identity is set
    pub fn make_client_config(options: &TlsOptions) -> Result<ClientConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca_pem = options
            .ca_pem
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No CA certificates configured"))?;
        let roots = load_roots(ca_pem)?;

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = match &options.identity {
            Some(identity) => builder
                .with_client_auth_cert(
                    load_certs(&identity.cert_chain_pem, "certificate chain")?,
                    load_key(&identity.private_key_pem)?,
                )
                .context("Failed to configure client certificate")?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = alpn(options);
        Ok(config)
    }

    /// Create a TLS server configuration, verifying clients when a CA is set
    pub fn make_server_config(options: &TlsOptions) -> Result<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let identity = options
            .identity
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No server identity configured"))?;
        let certs = load_certs(&identity.cert_chain_pem, "certificate chain")?;
        let key = load_key(&identity.private_key_pem)?;

        let mut config = match options.ca_pem.as_deref() {
            Some(ca_pem) => {
                let roots = load_roots(ca_pem)?;
                let client_verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                        .build()
                        .context("Failed to build client certificate verifier")?;
                ServerConfig::builder()
                    .with_client_cert_verifier(client_verifier)
                    .with_single_cert(certs, key)
                    .context("Failed to configure server certificate")?
            }
            None => ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("Failed to configure server certificate")?,
        };
        config.alpn_protocols = alpn(options);
        Ok(config)
    }

    /// Run the handshake for `options.role` over `stream`
    pub async fn upgrade(stream: IoStream, options: &TlsOptions) -> Result<IoStream, TransportError> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        match options.role {
            TlsRole::Client => {
                let config = make_client_config(options)
                    .map_err(|e| TransportError::Tls(format!("{:#}", e)))?;
                let sni = options.server_name.as_deref().unwrap_or_default();
                let server_name = ServerName::try_from(sni.to_owned())
                    .map_err(|_| TransportError::Tls(format!("Invalid server name: {}", sni)))?;
                debug!("Starting TLS client handshake with {} (SNI: {})", peer, sni);

                let connector = TlsConnector::from(Arc::new(config));
                let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
                    TransportError::Tls(format!(
                        "TLS handshake failed with {} (SNI: {}): {}",
                        peer, sni, e
                    ))
                })?;
                info!("TLS client session established with {}", peer);
                Ok(IoStream::TlsClient(Box::new(tls_stream)))
            }
            TlsRole::Server => {
                let config = make_server_config(options)
                    .map_err(|e| TransportError::Tls(format!("{:#}", e)))?;
                debug!("Starting TLS server handshake with {}", peer);

                let acceptor = TlsAcceptor::from(Arc::new(config));
                let tls_stream = acceptor.accept(stream).await.map_err(|e| {
                    TransportError::Tls(format!("TLS handshake failed with {}: {}", peer, e))
                })?;
                info!("TLS server session established with {}", peer);
                Ok(IoStream::TlsServer(Box::new(tls_stream)))
            }
        }
    }
}
