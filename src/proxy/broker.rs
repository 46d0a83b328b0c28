//! Broker
//!
//! Splices client connections onto upstream QUIC connections without looking
//! at the payload. Each client QUIC connection gets its own upstream
//! connection, and each stream on it is matched by a fresh upstream stream.
//! WebSocket clients get one upstream connection and stream per session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use metrics::counter;
use quinn::{Endpoint, Incoming};
use tokio::time::timeout;

use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;
use crate::proxy::acceptor::accept_connection;
use crate::proxy::forwarder::{relay, RelayOptions, RelayStats};
use crate::proxy::listener::UnitHandler;
use crate::proxy::session::SessionIdGenerator;
use crate::proxy::shutdown::ShutdownSignal;
use crate::proxy::tasks::{Admission, SessionTasks};
use crate::transport::quic::{server_endpoint, QuicDialer, QuicUnit};
use crate::transport::{BoxUnit, Dialer, Unit};

/// Broker tuning taken from the configuration
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub relay: RelayOptions,
    pub max_sessions: Option<usize>,
    pub shutdown_grace: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
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

struct BrokerContext {
    upstream: Arc<QuicDialer>,
    ids: SessionIdGenerator,
    relay: RelayOptions,
}

/// QUIC-to-QUIC broker
pub struct QuicBroker {
    endpoint: Endpoint,
    ctx: Arc<BrokerContext>,
    settings: BrokerSettings,
}

impl QuicBroker {
    pub fn bind(
        addr: SocketAddr,
        crypto: rustls::ServerConfig,
        upstream: Arc<QuicDialer>,
        settings: BrokerSettings,
    ) -> Result<Self> {
        let endpoint = server_endpoint(addr, crypto, settings.idle_timeout)?;
        let ctx = BrokerContext {
            upstream,
            ids: SessionIdGenerator::new(),
            relay: settings.relay,
        };
        Ok(Self {
            endpoint,
            ctx: Arc::new(ctx),
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

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
                            if let Err(e) = bridge_connection(incoming, ctx, admission, handshake).await {
                                info!("Broker connection ended: {}", e);
                            }
                        });
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("QUIC broker stopped accepting");
        self.endpoint.set_server_config(None);
        connections.drain(self.settings.shutdown_grace).await;
        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = timeout(Duration::from_secs(1), self.endpoint.wait_idle()).await;
        Ok(())
    }
}

async fn bridge_connection(
    incoming: Incoming,
    ctx: Arc<BrokerContext>,
    admission: Admission,
    handshake: Duration,
) -> Result<()> {
    let client = accept_connection(incoming, handshake).await?;
    let upstream = match ctx.upstream.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            client.close(0u32.into(), b"upstream unavailable");
            return Err(e);
        }
    };
    debug!("Bridging {} to {}", client.remote_address(), upstream.remote_address());

    let mut streams = SessionTasks::new(admission);
    loop {
        tokio::select! {
            accepted = client.accept_bi() => match accepted {
                Ok((send, recv)) => {
                    let tid = ctx.ids.next_id();
                    let upstream = upstream.clone();
                    let options = ctx.relay;
                    streams.spawn(async move {
                        let opened = async move {
                            let (send, recv) = upstream.open_bi().await.map_err(|e| {
                                ProxyError::Dial(format!("open upstream stream failed: {}", e))
                            })?;
                            Ok::<_, ProxyError>(QuicUnit::new(send, recv))
                        };
                        bridge_stream(&tid, QuicUnit::new(send, recv), opened, options).await;
                    });
                }
                Err(e) => {
                    debug!("Client connection {} closed: {}", client.remote_address(), e);
                    break;
                }
            },
            reason = upstream.closed() => {
                info!("Upstream connection {} closed: {}", upstream.remote_address(), reason);
                client.close(0u32.into(), b"upstream closed");
                break;
            }
        }
    }

    streams.wait().await;
    upstream.close(0u32.into(), b"");
    Ok(())
}

/// Relay `client` onto the unit `upstream` resolves to
///
/// A failed upstream ends only this session: the client is closed and
/// nothing is returned.
async fn bridge_stream<A, B, F>(tid: &str, mut client: A, upstream: F, options: RelayOptions) -> Option<RelayStats>
where
    A: Unit + 'static,
    B: Unit + 'static,
    F: Future<Output = Result<B>>,
{
    match upstream.await {
        Ok(upstream) => {
            counter!("sessions.relayed").increment(1);
            Some(relay(tid, client, upstream, options).await)
        }
        Err(e) => {
            warn!("Tid:{}, {}: {}", tid, e.kind(), e);
            client.close().await;
            None
        }
    }
}

/// Bridges WebSocket sessions onto fresh upstream QUIC connections
pub struct WsBridge {
    upstream: Arc<QuicDialer>,
    ids: SessionIdGenerator,
    relay: RelayOptions,
}

impl WsBridge {
    pub fn new(upstream: Arc<QuicDialer>, relay: RelayOptions) -> Self {
        Self {
            upstream,
            ids: SessionIdGenerator::new(),
            relay,
        }
    }
}

impl UnitHandler for WsBridge {
    fn handle(&self, unit: BoxUnit) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let tid = self.ids.next_id();
            bridge_stream(&tid, unit, self.upstream.dial(), self.relay).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::auth;
    use crate::protocol::AuthRequest;
    use crate::proxy::acceptor::{AcceptorSettings, QuicAcceptor};
    use crate::proxy::shutdown::Shutdown;
    use crate::testing::{echo_server, quic_dialer, self_signed, TestCert};
    use crate::tls::server_crypto;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(10);

    fn options() -> RelayOptions {
        RelayOptions { buffer_size: 4096, linger: Duration::from_secs(2) }
    }

    fn request(port: u16, tid: &str) -> AuthRequest {
        AuthRequest {
            remote: "127.0.0.1".to_string(),
            port,
            user: "amos".to_string(),
            passwd: String::new(),
            tid: tid.to_string(),
        }
    }

    fn start_acceptor(cert: &TestCert) -> (SocketAddr, Shutdown, JoinHandle<Result<()>>) {
        let settings = AcceptorSettings {
            shutdown_grace: Duration::from_secs(1),
            ..AcceptorSettings::default()
        };
        let acceptor = QuicAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_crypto(&cert.cert, &cert.key).unwrap(),
            settings,
        )
        .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(acceptor.run(shutdown.subscribe()));
        (addr, shutdown, task)
    }

    async fn echo_through<U: Unit>(unit: &mut U, port: u16, tid: &str, payload: &[u8]) {
        let leftover = auth::initiate(unit, &request(port, tid)).await.unwrap();
        assert!(leftover.is_empty());
        unit.write_all(payload).await.unwrap();
        unit.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        timeout(WAIT, unit.read_to_end(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(echoed, payload);
        unit.close().await;
    }

    #[tokio::test]
    async fn test_broker_bridges_each_stream_upstream() {
        let cert = self_signed();
        let port = echo_server().await;
        let (acceptor_addr, acceptor_shutdown, acceptor) = start_acceptor(&cert);

        let upstream = Arc::new(quic_dialer(acceptor_addr, &cert).await);
        let mut settings = BrokerSettings::from_config(&ProxyConfig::default());
        settings.shutdown_grace = Duration::from_secs(1);
        let broker = QuicBroker::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_crypto(&cert.cert, &cert.key).unwrap(),
            Arc::clone(&upstream),
            settings,
        )
        .unwrap();
        let broker_addr = broker.local_addr().unwrap();
        let broker_shutdown = Shutdown::new();
        let broker_task = tokio::spawn(broker.run(broker_shutdown.subscribe()));

        let client = quic_dialer(broker_addr, &cert).await;
        let conn = client.connect().await.unwrap();
        for (i, tid) in ["SEQ-abcde-1", "SEQ-abcde-2", "SEQ-abcde-3"].iter().enumerate() {
            let (send, recv) = conn.open_bi().await.unwrap();
            let mut unit = QuicUnit::new(send, recv);
            let payload = vec![i as u8 + 1; 8 * 1024];
            echo_through(&mut unit, port, tid, &payload).await;
        }
        conn.close(0u32.into(), b"");
        client.close().await;

        broker_shutdown.trigger();
        timeout(WAIT, broker_task).await.unwrap().unwrap().unwrap();
        upstream.close().await;
        acceptor_shutdown.trigger();
        timeout(WAIT, acceptor).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_upstream_closes_only_that_session() {
        let (mut refused_peer, refused) = duplex(1024);
        let (mut client, near) = duplex(1024);
        let (up_near, mut up_far) = duplex(1024);

        let failed = bridge_stream(
            "SEQ-abcde-1",
            refused,
            async { Err::<DuplexStream, _>(ProxyError::Dial("open upstream stream failed".into())) },
            options(),
        )
        .await;
        assert!(failed.is_none());
        let mut rest = Vec::new();
        timeout(WAIT, refused_peer.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        // A sibling session is unaffected
        let bridged = tokio::spawn(bridge_stream("SEQ-abcde-2", near, async { Ok::<_, ProxyError>(up_near) }, options()));
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        timeout(WAIT, up_far.read_to_end(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, b"hello");

        up_far.write_all(b"ok").await.unwrap();
        up_far.shutdown().await.unwrap();
        let mut got = Vec::new();
        timeout(WAIT, client.read_to_end(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, b"ok");

        let stats = timeout(WAIT, bridged).await.unwrap().unwrap();
        assert_eq!(stats, Some(RelayStats { a_to_b: 5, b_to_a: 2 }));
    }

    #[tokio::test]
    async fn test_ws_bridge_relays_over_quic() {
        let cert = self_signed();
        let port = echo_server().await;
        let (acceptor_addr, acceptor_shutdown, acceptor) = start_acceptor(&cert);

        let upstream = Arc::new(quic_dialer(acceptor_addr, &cert).await);
        let bridge = WsBridge::new(Arc::clone(&upstream), options());
        let (mut client, near) = duplex(64 * 1024);
        let handled = tokio::spawn(async move { bridge.handle(Box::new(near)).await });

        echo_through(&mut client, port, "SEQ-abcde-1", b"over the bridge").await;
        timeout(WAIT, handled).await.unwrap().unwrap();

        upstream.close().await;
        acceptor_shutdown.trigger();
        timeout(WAIT, acceptor).await.unwrap().unwrap().unwrap();
    }
}
