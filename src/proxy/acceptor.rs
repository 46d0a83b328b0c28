//! Server-side acceptor
//!
//! Terminates the auth handshake on each inbound unit, dials the requested
//! destination over TCP and relays. Over QUIC every bidirectional stream of a
//! connection is an independent session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use metrics::counter;
use quinn::{Connection, Endpoint, Incoming};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::common::{connect_tcp, ProxyError, Result};
use crate::config::ProxyConfig;
use crate::protocol::auth::{self, MSG_CONNECT_FAILED};
use crate::protocol::AuthResponse;
use crate::proxy::forwarder::{RelayOptions, RelayStats};
use crate::proxy::listener::UnitHandler;
use crate::proxy::session::{Session, SessionState};
use crate::proxy::shutdown::ShutdownSignal;
use crate::proxy::tasks::{Admission, SessionTasks};
use crate::transport::quic::{server_endpoint, QuicUnit};
use crate::transport::{BoxUnit, Unit};

/// Acceptor tuning taken from the configuration
#[derive(Debug, Clone)]
pub struct AcceptorSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub relay: RelayOptions,
    pub max_sessions: Option<usize>,
    pub shutdown_grace: Duration,
}

impl AcceptorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.timeouts.connect(),
            handshake_timeout: config.timeouts.handshake(),
            idle_timeout: config.timeouts.idle(),
            relay: RelayOptions {
                buffer_size: config.limits.buffer_size,
                linger: config.timeouts.relay_linger(),
            },
            max_sessions: config.limits.max_sessions,
            shutdown_grace: config.timeouts.shutdown_grace(),
        }
    }
}

impl Default for AcceptorSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Responder logic shared by the QUIC and WebSocket acceptors
#[derive(Debug, Clone)]
pub struct AcceptorContext {
    connect_timeout: Duration,
    relay: RelayOptions,
}

impl AcceptorContext {
    pub fn new(settings: &AcceptorSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            relay: settings.relay,
        }
    }
}

impl UnitHandler for AcceptorContext {
    fn handle(&self, unit: BoxUnit) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = serve_unit(unit, self).await;
        })
    }
}

/// Answer one inbound unit: handshake, destination dial, relay
///
/// The destination is dialed only for a decodable request, and no relay
/// byte moves before the `200` response was written.
pub async fn serve_unit<U>(unit: U, ctx: &AcceptorContext) -> Result<RelayStats>
where
    U: Unit + 'static,
{
    counter!("sessions.accepted").increment(1);
    let mut session: Session<U, TcpStream> = Session::new(String::from("-"), unit);

    match respond_and_relay(&mut session, ctx).await {
        Ok(stats) => {
            counter!("sessions.relayed").increment(1);
            Ok(stats)
        }
        Err(e) => {
            warn!("Tid:{}, {} in state {}: {}", session.id(), e.kind(), session.state(), e);
            session.close().await;
            Err(e)
        }
    }
}

async fn respond_and_relay<U>(session: &mut Session<U, TcpStream>, ctx: &AcceptorContext) -> Result<RelayStats>
where
    U: Unit + 'static,
{
    session.advance(SessionState::Authenticating);
    let unit = session.local_mut().ok_or_else(endpoint_gone)?;
    let (request, leftover) = auth::accept_request(unit).await?;
    if !request.tid.is_empty() {
        session.set_id(request.tid.clone());
    }
    debug!("Tid:{}, auth request for {}:{} from {}", session.id(), request.remote, request.port, request.user);

    session.advance(SessionState::Dialing);
    let dialed = connect_tcp(&request.remote, request.port, ctx.connect_timeout).await;
    let unit = session.local_mut().ok_or_else(endpoint_gone)?;
    let mut remote = match dialed {
        Ok(remote) => remote,
        Err(e) => {
            let _ = auth::respond(unit, &AuthResponse::failure(MSG_CONNECT_FAILED)).await;
            return Err(e);
        }
    };

    auth::respond(unit, &AuthResponse::success())
        .await
        .map_err(|e| ProxyError::Auth(format!("send auth response failed: {}", e)))?;
    if !leftover.is_empty() {
        remote.write_all(&leftover).await?;
    }
    session.attach_remote(remote);

    info!("Tid:{}, relaying to {}:{}", session.id(), request.remote, request.port);
    session.relay(ctx.relay).await.ok_or_else(endpoint_gone)
}

fn endpoint_gone() -> ProxyError {
    ProxyError::Relay("session endpoint already released".to_string())
}

/// QUIC acceptor
pub struct QuicAcceptor {
    endpoint: Endpoint,
    ctx: Arc<AcceptorContext>,
    settings: AcceptorSettings,
}

impl QuicAcceptor {
    pub fn bind(addr: SocketAddr, crypto: rustls::ServerConfig, settings: AcceptorSettings) -> Result<Self> {
        let endpoint = server_endpoint(addr, crypto, settings.idle_timeout)?;
        Ok(Self {
            endpoint,
            ctx: Arc::new(AcceptorContext::new(&settings)),
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then drain and close
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let admission = Admission::new(self.settings.max_sessions);
        let mut connections = SessionTasks::new(Admission::new(None));

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => {
                        let ctx = Arc::clone(&self.ctx);
                        let admission = admission.clone();
                        let handshake = self.settings.handshake_timeout;
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(incoming, ctx, admission, handshake).await {
                                info!("QUIC connection ended: {}", e);
                            }
                        });
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("QUIC acceptor stopped accepting");
        self.endpoint.set_server_config(None);
        connections.drain(self.settings.shutdown_grace).await;
        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = timeout(Duration::from_secs(1), self.endpoint.wait_idle()).await;
        Ok(())
    }
}

/// Complete the handshake for `incoming`
pub async fn accept_connection(incoming: Incoming, handshake: Duration) -> Result<Connection> {
    let connecting = incoming
        .accept()
        .map_err(|e| ProxyError::Quic(format!("accept failed: {}", e)))?;
    let conn = timeout(handshake, connecting)
        .await
        .map_err(|_| ProxyError::Quic("QUIC handshake timed out".to_string()))?
        .map_err(|e| ProxyError::Quic(format!("QUIC handshake failed: {}", e)))?;
    debug!("QUIC connection from {}", conn.remote_address());
    Ok(conn)
}

async fn serve_connection(
    incoming: Incoming,
    ctx: Arc<AcceptorContext>,
    admission: Admission,
    handshake: Duration,
) -> Result<()> {
    let conn = accept_connection(incoming, handshake).await?;
    let mut streams = SessionTasks::new(admission);

    let reason = loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let ctx = Arc::clone(&ctx);
                streams.spawn(async move {
                    let _ = serve_unit(QuicUnit::new(send, recv), &ctx).await;
                });
            }
            Err(e) => break e,
        }
    };

    debug!("QUIC connection from {} closed: {}", conn.remote_address(), reason);
    streams.wait().await;
    Ok(())
}
