//! QUIC transport
//!
//! One [`QuicUnit`] is one bidirectional stream. A unit opened by the agent
//! owns its connection (one connection per session) and closes it together
//! with the stream; units accepted by the server or the broker borrow the
//! connection they arrived on.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig, TransportConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;

use crate::common::{resolve, split_host_port, ProxyError, Result};
use crate::transport::{BoxUnit, Dialer, Unit};

/// How long a closing unit waits for the peer to acknowledge its last bytes
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Build transport parameters shared by both ends
pub fn transport_config(idle: Duration, keep_alive: Option<Duration>) -> Result<Arc<TransportConfig>> {
    let idle = IdleTimeout::try_from(idle)
        .map_err(|e| ProxyError::Config(format!("invalid QUIC idle timeout: {}", e)))?;

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(keep_alive);
    Ok(Arc::new(transport))
}

/// Server endpoint listening on `addr`
pub fn server_endpoint(addr: SocketAddr, crypto: rustls::ServerConfig, idle: Duration) -> Result<Endpoint> {
    let crypto = QuicServerConfig::try_from(crypto).map_err(|e| ProxyError::Tls(e.to_string()))?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config(idle, None)?);

    let endpoint = Endpoint::server(config, addr)
        .map_err(|e| ProxyError::Quic(format!("bind {} failed: {}", addr, e)))?;
    info!("QUIC endpoint listening on {}", endpoint.local_addr()?);
    Ok(endpoint)
}

/// One QUIC bidirectional stream
pub struct QuicUnit {
    send: SendStream,
    recv: RecvStream,
    conn: Option<Connection>,
}

impl QuicUnit {
    /// A stream on a connection owned elsewhere
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv, conn: None }
    }

    /// A stream that owns its connection; closing the unit closes both
    pub fn owning(send: SendStream, recv: RecvStream, conn: Connection) -> Self {
        Self { send, recv, conn: Some(conn) }
    }
}

// quinn's inherent stream methods return its own error types; the tokio
// traits are named explicitly to get `io::Result`.
impl AsyncRead for QuicUnit {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicUnit {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    // Finishes the send side; the peer reads EOF while its own direction stays open
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

impl Unit for QuicUnit {
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Already finished when the relay half-closed this side
            let _ = self.send.finish();
            let _ = self.recv.stop(0u32.into());

            if let Some(conn) = self.conn.take() {
                let _ = timeout(CLOSE_LINGER, self.send.stopped()).await;
                conn.close(0u32.into(), b"");
            }
        })
    }
}

/// Dials `host:port` with a fresh connection per call
pub struct QuicDialer {
    endpoint: Endpoint,
    addr: String,
    server_name: String,
    handshake_timeout: Duration,
}

impl QuicDialer {
    /// Create a client endpoint for `url` (`host:port`)
    ///
    /// `crypto` is shared by every dial, so its resumption cache is too.
    pub async fn new(
        url: &str,
        crypto: rustls::ClientConfig,
        idle: Duration,
        keep_alive: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let (host, _) = split_host_port(url)?;
        let remote = resolve(url).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let crypto = QuicClientConfig::try_from(crypto).map_err(|e| ProxyError::Tls(e.to_string()))?;
        let mut config = ClientConfig::new(Arc::new(crypto));
        config.transport_config(transport_config(idle, Some(keep_alive))?);

        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| ProxyError::Quic(format!("bind client endpoint failed: {}", e)))?;
        endpoint.set_default_client_config(config);

        Ok(Self {
            endpoint,
            addr: url.to_string(),
            server_name: host,
            handshake_timeout,
        })
    }

    /// Establish a new connection, bounded by the handshake timeout
    pub async fn connect(&self) -> Result<Connection> {
        let remote = resolve(&self.addr).await?;
        let connecting = self
            .endpoint
            .connect(remote, &self.server_name)
            .map_err(|e| ProxyError::Dial(format!("dial {} failed: {}", self.addr, e)))?;

        let conn = timeout(self.handshake_timeout, connecting)
            .await
            .map_err(|_| ProxyError::Dial(format!("QUIC handshake with {} timed out", self.addr)))?
            .map_err(|e| ProxyError::Dial(format!("QUIC handshake with {} failed: {}", self.addr, e)))?;

        debug!("QUIC connection established to {}", conn.remote_address());
        Ok(conn)
    }

    /// Close the endpoint and every connection still on it
    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = timeout(CLOSE_LINGER, self.endpoint.wait_idle()).await;
    }
}

impl Dialer for QuicDialer {
    fn dial(&self) -> BoxFuture<'_, Result<BoxUnit>> {
        Box::pin(async move {
            let conn = self.connect().await?;
            let (send, recv) = conn.open_bi().await.map_err(|e| {
                ProxyError::Dial(format!("open stream to {} failed: {}", self.addr, e))
            })?;
            Ok(Box::new(QuicUnit::owning(send, recv, conn)) as BoxUnit)
        })
    }
}
