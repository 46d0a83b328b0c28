//! SOCKS5 front end
//!
//! Accepts local clients, reads their CONNECT request, drops internal
//! destinations, then dials one upstream unit per session, authenticates it
//! and relays.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use metrics::counter;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;
use crate::protocol::{auth, policy, socks5, AuthRequest};
use crate::proxy::forwarder::{RelayOptions, RelayStats};
use crate::proxy::session::{Session, SessionIdGenerator, SessionState};
use crate::proxy::shutdown::ShutdownSignal;
use crate::proxy::tasks::{Admission, SessionTasks};
use crate::transport::{BoxUnit, Dialer};

/// Agent tuning taken from the configuration
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub user: String,
    pub relay: RelayOptions,
    pub max_sessions: Option<usize>,
    pub shutdown_grace: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            user: config.agent.user.clone(),
            relay: RelayOptions {
                buffer_size: config.limits.buffer_size,
                linger: config.timeouts.relay_linger(),
            },
            max_sessions: config.limits.max_sessions,
            shutdown_grace: config.timeouts.shutdown_grace(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// State shared by every session of one agent
pub struct AgentContext {
    dialer: Arc<dyn Dialer>,
    ids: SessionIdGenerator,
    user: String,
    relay: RelayOptions,
}

impl AgentContext {
    pub fn new(dialer: Arc<dyn Dialer>, settings: &AgentSettings) -> Self {
        Self {
            dialer,
            ids: SessionIdGenerator::new(),
            user: settings.user.clone(),
            relay: settings.relay,
        }
    }
}

/// SOCKS5 listener
pub struct Agent {
    listener: TcpListener,
    ctx: Arc<AgentContext>,
    admission: Admission,
    shutdown_grace: Duration,
}

impl Agent {
    /// Bind the SOCKS5 listener
    pub async fn bind(listen: SocketAddr, dialer: Arc<dyn Dialer>, settings: AgentSettings) -> Result<Self> {
        let listener = TcpListener::bind(listen).await.map_err(ProxyError::Io)?;
        info!("SOCKS5 agent listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx: Arc::new(AgentContext::new(dialer, &settings)),
            admission: Admission::new(settings.max_sessions),
            shutdown_grace: settings.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` fires, then drain
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut tasks = SessionTasks::new(self.admission.clone());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted SOCKS5 client {}", peer);
                        let ctx = Arc::clone(&self.ctx);
                        tasks.spawn(async move {
                            let _ = handle_client(stream, &ctx).await;
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("SOCKS5 agent stopped accepting");
        drop(self.listener);
        tasks.drain(self.shutdown_grace).await;
        Ok(())
    }
}

/// Run one client session to completion
///
/// Every failure is session-local: it is logged with the session id, both
/// endpoints are released, and the error is returned for the caller's
/// benefit only.
pub async fn handle_client(stream: TcpStream, ctx: &AgentContext) -> Result<RelayStats> {
    let _ = stream.set_nodelay(true);
    counter!("sessions.accepted").increment(1);

    let mut session: Session<TcpStream, BoxUnit> = Session::new(ctx.ids.next_id(), stream);
    let result = drive(&mut session, ctx).await;

    match result {
        Ok(stats) => {
            counter!("sessions.relayed").increment(1);
            Ok(stats)
        }
        Err(e) => {
            match &e {
                ProxyError::PolicyRejected(target) => {
                    counter!("sessions.rejected").increment(1);
                    info!("Tid:{}, internal address rejected: {}", session.id(), target);
                }
                ProxyError::Protocol(_) | ProxyError::Io(_) => {
                    info!("Tid:{}, {} in state {}: {}", session.id(), e.kind(), session.state(), e);
                }
                _ => warn!("Tid:{}, {} in state {}: {}", session.id(), e.kind(), session.state(), e),
            }
            session.close().await;
            Err(e)
        }
    }
}

fn endpoint_gone() -> ProxyError {
    ProxyError::Relay("session endpoint already released".to_string())
}

async fn drive(session: &mut Session<TcpStream, BoxUnit>, ctx: &AgentContext) -> Result<RelayStats> {
    session.advance(SessionState::Negotiating);
    let local = session.local_mut().ok_or_else(endpoint_gone)?;
    socks5::negotiate(local).await?;
    let request = socks5::read_request(local).await?;
    debug!("Tid:{}, CONNECT {}", session.id(), request.target);

    // Policy refusals get no reply; the client just sees the connection drop
    session.advance(SessionState::Filtering);
    policy::check_target(&request.target)?;

    session.advance(SessionState::Dialing);
    let remote = ctx.dialer.dial().await?;
    session.attach_remote(remote);

    session.advance(SessionState::Authenticating);
    let auth_request = AuthRequest::new(&request.target, &ctx.user, session.id());
    let remote = session.remote_mut().ok_or_else(endpoint_gone)?;
    let leftover = auth::initiate(remote, &auth_request).await?;

    let local = session.local_mut().ok_or_else(endpoint_gone)?;
    socks5::send_success(local).await?;
    if !leftover.is_empty() {
        local.write_all(&leftover).await?;
    }

    info!("Tid:{}, relaying to {}", session.id(), request.target);
    session.relay(ctx.relay).await.ok_or_else(endpoint_gone)
}
