use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::protocol::error::{FabricError, Result};
use crate::protocol::HostDescription;
use crate::transport::codec::{Chunk, CHUNK_HEADER_SIZE, VST_HANDSHAKE};

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional byte stream, plain TCP or TLS.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

/// Async TCP transport used by both wire protocols.
///
/// Resolves the host, tries each resolved address until one accepts, and
/// optionally wraps the socket in TLS.
///
/// # Example
///
/// ```no_run
/// use fabric_common::transport::TcpTransport;
/// use fabric_common::HostDescription;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::default();
/// let host = HostDescription::parse("127.0.0.1:8529")?;
/// let stream = transport.connect(&host).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: None,
        }
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connects to a host.
    ///
    /// # Errors
    ///
    /// - `UnknownHost` if the name does not resolve
    /// - `Connection` if every resolved address refused or timed out
    /// - `Tls` if the TLS handshake fails
    pub async fn connect(&self, host: &HostDescription) -> Result<BoxedStream> {
        let stream = self.connect_tcp(host).await?;

        let Some(config) = &self.tls else {
            tracing::trace!(host = %host, "Connected");
            return Ok(Box::new(stream));
        };

        let server_name = ServerName::try_from(host.host().to_string())
            .map_err(|e| FabricError::Tls(format!("Invalid server name '{}': {}", host.host(), e)))?;
        let tls = TlsConnector::from(config.clone())
            .connect(server_name, stream)
            .await
            .map_err(|e| {
                tracing::warn!(host = %host, error = %e, "TLS handshake failed");
                FabricError::Tls(format!("Handshake with {} failed: {}", host, e))
            })?;
        tracing::trace!(host = %host, "Connected with TLS");
        Ok(Box::new(tls))
    }

    async fn connect_tcp(&self, host: &HostDescription) -> Result<TcpStream> {
        let addrs = tokio::net::lookup_host((host.host(), host.port()))
            .await
            .map_err(|e| FabricError::UnknownHost(format!("{}: {}", host, e)))?;

        // Try each resolved address until one succeeds
        let mut last_err = None;
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!(host = %host, %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e.to_string())
                }
                Err(_) => {
                    last_err = Some(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                }
            }
        }

        Err(FabricError::Connection(format!(
            "Failed to connect to {}: {}",
            host,
            last_err.unwrap_or_else(|| "no address resolved".to_string())
        )))
    }

    /// Writes the VST protocol preamble.
    pub async fn write_handshake<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> Result<()> {
        stream
            .write_all(VST_HANDSHAKE)
            .await
            .map_err(|e| Self::map_io_error(e, "writing handshake"))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing handshake"))
    }

    /// Writes the chunks of one message back to back.
    pub async fn write_chunks<W: AsyncWrite + Unpin + ?Sized>(
        stream: &mut W,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Chunk::encoded_len).sum());
        for chunk in chunks {
            chunk.encode(&mut buf);
        }
        stream
            .write_all(&buf)
            .await
            .map_err(|e| Self::map_io_error(e, "writing chunks"))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))
    }

    /// Reads one chunk.
    pub async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Chunk> {
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| Self::map_io_error(e, "reading chunk header"))?;

        let (header, payload_len) = Chunk::decode_header(&header)?;

        let mut payload = vec![0u8; payload_len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Self::map_io_error(e, "reading chunk payload"))?;

        Ok(header.with_payload(Bytes::from(payload)))
    }

    /// Maps IO errors to the failure classes the protocols act on.
    ///
    /// - Reset/aborted/broken pipe -> `ConnectionReset`
    /// - Peer closed before answering -> `NoResponse`
    /// - Not connected -> `Connection`
    /// - Other IO errors -> `Io`
    pub fn map_io_error(err: io::Error, context: &str) -> FabricError {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => {
                FabricError::ConnectionReset(format!("{}: {}", context, err))
            }
            io::ErrorKind::UnexpectedEof => {
                FabricError::NoResponse(format!("{}: connection closed by peer", context))
            }
            io::ErrorKind::NotConnected => {
                FabricError::Connection(format!("{}: connection lost", context))
            }
            _ => FabricError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}
