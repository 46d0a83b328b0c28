//! WebSocket listener
//!
//! Accepts TCP connections, optionally terminates TLS, upgrades on the
//! WebSocket path and hands each connection to a [`UnitHandler`] as one unit.
//! Live sessions are kept in a [`SessionRegistry`] so shutdown can wait for
//! them and abort stragglers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info};
use openssl::ssl::SslAcceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::common::{ProxyError, Result};
use crate::proxy::shutdown::ShutdownSignal;
use crate::proxy::tasks::{Admission, SessionRegistry};
use crate::tls::accept_tls;
use crate::transport::websocket;
use crate::transport::BoxUnit;

/// What to do with one accepted unit
pub trait UnitHandler: Send + Sync + 'static {
    fn handle(&self, unit: BoxUnit) -> BoxFuture<'_, ()>;
}

/// WebSocket listener settings
#[derive(Debug, Clone)]
pub struct WsListenerSettings {
    pub handshake_timeout: Duration,
    pub max_sessions: Option<usize>,
    pub shutdown_grace: Duration,
}

pub struct WsListener {
    listener: TcpListener,
    tls: Option<Arc<SslAcceptor>>,
    handler: Arc<dyn UnitHandler>,
    registry: Arc<SessionRegistry>,
    settings: WsListenerSettings,
}

impl WsListener {
    /// Bind `addr`; `tls` is `None` when TLS is terminated in front of us
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<SslAcceptor>,
        handler: Arc<dyn UnitHandler>,
        settings: WsListenerSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
        info!(
            "WebSocket listener on {} ({})",
            listener.local_addr()?,
            if tls.is_some() { "wss" } else { "ws" }
        );

        Ok(Self {
            listener,
            tls: tls.map(Arc::new),
            handler,
            registry: SessionRegistry::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then drain the registry
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let admission = Admission::new(self.settings.max_sessions);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let admission = admission.clone();
                        let registration = self.registry.reserve();
                        let key = registration.key();
                        let tls = self.tls.clone();
                        let handler = Arc::clone(&self.handler);
                        let handshake = self.settings.handshake_timeout;

                        let task = tokio::spawn(async move {
                            let _registration = registration;
                            let _permit = admission.acquire().await;
                            match upgrade(stream, tls, handshake).await {
                                Ok(unit) => handler.handle(unit).await,
                                Err(e) => debug!("WebSocket upgrade from {} failed: {}", peer, e),
                            }
                        });
                        self.registry.insert(key, task.abort_handle());
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("WebSocket listener stopped accepting");
        drop(self.listener);
        self.registry.shutdown(self.settings.shutdown_grace).await;
        Ok(())
    }
}

/// TLS (when configured) plus the WebSocket upgrade, bounded by `handshake`
async fn upgrade(stream: TcpStream, tls: Option<Arc<SslAcceptor>>, handshake: Duration) -> Result<BoxUnit> {
    let _ = stream.set_nodelay(true);
    let upgrade = async move {
        let unit: BoxUnit = match tls {
            Some(acceptor) => Box::new(websocket::accept(accept_tls(acceptor, stream).await?).await?),
            None => Box::new(websocket::accept(stream).await?),
        };
        Ok::<_, ProxyError>(unit)
    };

    timeout(handshake, upgrade)
        .await
        .map_err(|_| ProxyError::WebSocket("WebSocket handshake timed out".to_string()))?
}
