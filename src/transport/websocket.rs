//! WebSocket transport
//!
//! One connection is one unit. Every write becomes one binary message and
//! inbound messages are read back as a byte stream. WebSocket has no
//! half-close, so shutting down the write side sends the close frame.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Sink, Stream};
use log::{debug, trace};
use openssl::ssl::SslConnector;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};

use crate::common::{connect_tcp, ProxyError, Result};
use crate::config::{WS_PATH, WS_SUBPROTOCOL};
use crate::tls::connect_tls;
use crate::transport::{BoxUnit, Dialer, Unit};

fn io_error(e: WsError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// A WebSocket connection exposed as a byte stream
pub struct WsUnit<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_done: bool,
    write_done: bool,
    // A close reply is queued and has not been flushed yet
    close_pending: bool,
}

impl<S> WsUnit<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            read_done: false,
            write_done: false,
            close_pending: false,
        }
    }
}

impl<S> AsyncRead for WsUnit<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            // Drain the tail of the previous message first
            if self.read_pos < self.read_buf.len() {
                let remaining = &self.read_buf[self.read_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.read_pos += n;
                if self.read_pos >= self.read_buf.len() {
                    self.read_buf.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if self.read_done {
                if self.close_pending {
                    // The peer waits for our close reply before it lets go
                    match Pin::new(&mut self.inner).poll_flush(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(_) => self.close_pending = false,
                    }
                }
                return Poll::Ready(Ok(()));
            }

            let data = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
                    self.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.read_done = true;
                    return Poll::Ready(Err(io_error(e)));
                }
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => data,
                    Message::Text(text) => text.into_bytes(),
                    // Pongs are queued by tungstenite itself
                    Message::Ping(_) | Message::Pong(_) => {
                        trace!("WebSocket control frame");
                        continue;
                    }
                    Message::Close(frame) => {
                        debug!("WebSocket received close frame: {:?}", frame);
                        self.read_done = true;
                        self.close_pending = !self.write_done;
                        continue;
                    }
                    Message::Frame(_) => continue,
                },
            };

            if data.is_empty() {
                continue;
            }
            self.read_buf = data;
            self.read_pos = 0;
        }
    }
}

impl<S> AsyncWrite for WsUnit<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if self.write_done {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.write_done = true;
                return Poll::Ready(Err(io_error(e)));
            }
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.write_done = true;
                Poll::Ready(Err(io_error(e)))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.write_done {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_flush(cx).map_err(io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match Pin::new(&mut self.inner).poll_close(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) | Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                self.write_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.write_done = true;
                Poll::Ready(Err(io_error(e)))
            }
        }
    }
}

impl<S> Unit for WsUnit<S> where S: AsyncRead + AsyncWrite + Unpin + Send {}

/// Upgrade an accepted stream, allowing only [`WS_PATH`]
///
/// Any origin is accepted. The `binary` subprotocol is echoed when offered.
pub async fn accept<S>(stream: S) -> Result<WsUnit<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = accept_hdr_async(stream, |req: &Request, mut response: Response| {
        if req.uri().path() != WS_PATH {
            let mut reject = ErrorResponse::new(Some("not found".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            return Err(reject);
        }

        let offered = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == WS_SUBPROTOCOL))
            .unwrap_or(false);
        if offered {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));
        }
        Ok(response)
    })
    .await?;

    Ok(WsUnit::new(ws))
}

/// Client handshake over an established stream
pub async fn handshake<S>(url: &str, stream: S) -> Result<WsUnit<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));

    let (ws, _response) = client_async(request, stream).await?;
    Ok(WsUnit::new(ws))
}

/// Dials `ws://` or `wss://` URLs, one connection per call
pub struct WsDialer {
    url: String,
    host: String,
    port: u16,
    tls: Option<Arc<SslConnector>>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WsDialer {
    /// `connector` is required for `wss://` URLs
    pub fn new(
        url: &str,
        connector: Option<SslConnector>,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let request = url.into_client_request()?;
        let uri = request.uri();
        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => return Err(ProxyError::Config(format!("unsupported WebSocket URL: {}", url))),
        };
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Config(format!("missing host in WebSocket URL: {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let tls = match (secure, connector) {
            (true, Some(c)) => Some(Arc::new(c)),
            (true, None) => {
                return Err(ProxyError::Config(format!("TLS connector required for {}", url)));
            }
            (false, _) => None,
        };

        Ok(Self {
            url: url.to_string(),
            host,
            port,
            tls,
            connect_timeout,
            handshake_timeout,
        })
    }

    async fn open(&self) -> Result<BoxUnit> {
        let tcp = connect_tcp(&self.host, self.port, self.connect_timeout).await?;
        match &self.tls {
            Some(connector) => {
                let tls = connect_tls(connector, &self.host, tcp).await?;
                Ok(Box::new(handshake(&self.url, tls).await?))
            }
            None => Ok(Box::new(handshake(&self.url, tcp).await?)),
        }
    }
}

impl Dialer for WsDialer {
    fn dial(&self) -> BoxFuture<'_, Result<BoxUnit>> {
        Box::pin(async move {
            timeout(self.handshake_timeout, self.open())
                .await
                .map_err(|_| ProxyError::Dial(format!("WebSocket dial to {} timed out", self.url)))?
                .map_err(|e| match e {
                    ProxyError::Dial(_) => e,
                    other => ProxyError::Dial(format!("WebSocket dial to {} failed: {}", self.url, other)),
                })
        })
    }
}
