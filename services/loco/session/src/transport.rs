//! TCP and TLS transport for LOCO sessions.
//!
//! LOCO and trailer endpoints speak V2SL over plain TCP; the booking
//! (directory) host is reached over TLS. Both are wrapped in [`IoStream`] and
//! produced by a [`Connector`], so session code never depends on which one
//! it got.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::SessionError;

/// A host and port to connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Unified stream type for every connection a client opens
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// In-process pipe
    Duplex(DuplexStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::Duplex(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::Duplex(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::Duplex(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::Duplex(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStream::Plain(_) => f.write_str("IoStream::Plain"),
            IoStream::Tls(_) => f.write_str("IoStream::Tls"),
            IoStream::Duplex(_) => f.write_str("IoStream::Duplex"),
        }
    }
}

/// Opens byte streams to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> Result<IoStream, SessionError>;
}

/// Connect to a TCP endpoint within `timeout`
pub async fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, SessionError> {
    let addr = (endpoint.host.as_str(), endpoint.port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            debug!("TCP connection established to {}", endpoint);
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(SessionError::ConnectTimeout(endpoint.to_string())),
    }
}

/// Plain TCP connector used for LOCO and trailer endpoints
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<IoStream, SessionError> {
        let stream = connect_tcp(endpoint, self.connect_timeout).await?;
        Ok(IoStream::Plain(stream))
    }
}

/// Create a TLS client configuration trusting the web PKI roots plus any
/// certificates in `extra_ca_pem`
pub fn make_client_config(extra_ca_pem: Option<&str>) -> Result<ClientConfig, SessionError> {
    // Install default crypto provider if not already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut extra = 0;
    if let Some(pem) = extra_ca_pem {
        let certs: Result<Vec<CertificateDer<'static>>, _> =
            rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        let certs = certs.map_err(|e| SessionError::Tls(format!("bad CA PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(SessionError::Tls("no certificates in CA PEM".into()));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| SessionError::Tls(format!("rejected CA certificate: {}", e)))?;
            extra += 1;
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    info!("TLS client configuration created with {} extra roots", extra);
    Ok(config)
}

/// TLS connector used for the booking host
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
    connect_timeout: Duration,
}

impl TlsConnector {
    /// Create a connector from a client configuration
    pub fn new(config: ClientConfig, connect_timeout: Duration) -> Self {
        Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<IoStream, SessionError> {
        let tcp_stream = connect_tcp(endpoint, self.connect_timeout).await?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| SessionError::Tls(format!("invalid server name: {}", endpoint.host)))?;

        let handshake = self.connector.connect(server_name, tcp_stream);
        let tls_stream = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SessionError::Tls(format!(
                    "handshake with {} failed: {}",
                    endpoint, e
                )))
            }
            Err(_) => return Err(SessionError::ConnectTimeout(endpoint.to_string())),
        };

        debug!("TLS connection established to {}", endpoint);
        Ok(IoStream::Tls(Box::new(tls_stream)))
    }
}
