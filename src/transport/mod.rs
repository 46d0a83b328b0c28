//! Transport units
//!
//! A unit is one duplex byte channel: a QUIC bidirectional stream or a whole
//! WebSocket connection. The handshake and the relay operate on [`Unit`] and
//! never see which transport is underneath.

pub mod quic;
pub mod websocket;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

use crate::common::Result;

/// Duplex byte channel with an explicit close
pub trait Unit: AsyncRead + AsyncWrite + Unpin + Send {
    /// Release the unit, flushing whatever the transport still holds
    ///
    /// Errors are swallowed: by the time a unit is closed the session outcome
    /// is already decided.
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.shutdown().await;
        })
    }
}

pub type BoxUnit = Box<dyn Unit>;

impl Unit for TcpStream {}

impl Unit for DuplexStream {}

impl Unit for BoxUnit {
    fn close(&mut self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

/// Opens one fresh unit towards an upstream peer
pub trait Dialer: Send + Sync {
    fn dial(&self) -> BoxFuture<'_, Result<BoxUnit>>;
}
