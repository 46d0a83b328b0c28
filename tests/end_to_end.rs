//! Session tests across the agent and acceptor, over in-memory units

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use hiproxy::protocol::auth::{self, STATUS_FAILED, STATUS_OK};
use hiproxy::protocol::{AuthRequest, AuthResponse};
use hiproxy::proxy::{serve_unit, AcceptorContext, AcceptorSettings, Agent, AgentSettings, Shutdown};
use hiproxy::transport::{BoxUnit, Dialer};
use hiproxy::{parse_socket_addr, Result};

const WAIT: Duration = Duration::from_secs(5);

/// Hands the far end of every dialed unit to the test
struct PipeDialer {
    units: mpsc::UnboundedSender<DuplexStream>,
}

impl Dialer for PipeDialer {
    fn dial(&self) -> BoxFuture<'_, Result<BoxUnit>> {
        async move {
            let (near, far) = duplex(64 * 1024);
            let _ = self.units.send(far);
            Ok(Box::new(near) as BoxUnit)
        }
        .boxed()
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    units: mpsc::UnboundedReceiver<DuplexStream>,
    shutdown: Shutdown,
    task: tokio::task::JoinHandle<Result<()>>,
}

async fn start_agent() -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let settings = AgentSettings::default();
    let agent = Agent::bind(
        parse_socket_addr("127.0.0.1:0").unwrap(),
        Arc::new(PipeDialer { units: tx }),
        settings,
    )
    .await
    .unwrap();
    let addr = agent.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(agent.run(shutdown.subscribe()));

    Harness { addr, units: rx, shutdown, task }
}

async fn socks_connect(addr: std::net::SocketAddr, request: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);
    client.write_all(request).await.unwrap();
    client
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_agent_sends_auth_request_and_relays() {
    let mut harness = start_agent().await;
    let mut client = socks_connect(harness.addr, &[5, 1, 0, 1, 93, 184, 216, 34, 0, 80]).await;

    let mut upstream = timeout(WAIT, harness.units.recv()).await.unwrap().unwrap();
    let (request, leftover): (AuthRequest, _) = auth::read_message(&mut upstream).await.unwrap();
    assert!(leftover.is_empty());
    assert_eq!(request.remote, "93.184.216.34");
    assert_eq!(request.port, 80);
    assert_eq!(request.user, "amos");
    assert!(request.tid.starts_with("SEQ-"));
    assert!(request.tid.ends_with("-1"));

    auth::respond(&mut upstream, &AuthResponse::success()).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut got = [0u8; 18];
    upstream.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"GET / HTTP/1.0\r\n\r\n");

    upstream.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
    let mut got = [0u8; 17];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"HTTP/1.0 200 OK\r\n");

    drop(client);
    let mut rest = Vec::new();
    timeout(WAIT, upstream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    drop(upstream);

    harness.shutdown.trigger();
    timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_internal_target_is_dropped_without_dial() {
    let mut harness = start_agent().await;
    let mut client = socks_connect(harness.addr, &[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]).await;

    // No reply, just a closed connection
    let mut buf = Vec::new();
    timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert!(buf.is_empty());
    assert!(harness.units.try_recv().is_err());

    harness.shutdown.trigger();
    timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_auth_refusal_closes_client_without_reply() {
    let mut harness = start_agent().await;
    let mut client = socks_connect(harness.addr, &[5, 1, 0, 1, 93, 184, 216, 34, 0, 80]).await;

    let mut upstream = timeout(WAIT, harness.units.recv()).await.unwrap().unwrap();
    let _: (AuthRequest, _) = auth::read_message(&mut upstream).await.unwrap();
    auth::respond(&mut upstream, &AuthResponse::failure("connect to remote failed"))
        .await
        .unwrap();

    let mut buf = Vec::new();
    timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert!(buf.is_empty());

    harness.shutdown.trigger();
    timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_agent_through_acceptor_to_destination() {
    let port = echo_server().await;
    let mut harness = start_agent().await;

    let acceptor = AcceptorContext::new(&AcceptorSettings::default());
    let mut units = std::mem::replace(&mut harness.units, mpsc::unbounded_channel().1);
    let server = tokio::spawn(async move {
        let unit = units.recv().await.unwrap();
        serve_unit(unit, &acceptor).await
    });

    // Domain targets are not filtered, so loopback is reachable by name
    let mut request = vec![5, 1, 0, 3, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&port.to_be_bytes());
    let mut client = socks_connect(harness.addr, &request).await;

    let mut reply = [0u8; 10];
    timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply[..2], [5, 0]);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut read_half, mut write_half) = client.into_split();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    timeout(WAIT, read_half.read_to_end(&mut echoed)).await.unwrap().unwrap();
    writer.await.unwrap();
    assert_eq!(echoed, expected);

    let stats = timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert_eq!(stats.a_to_b, expected.len() as u64);
    assert_eq!(stats.b_to_a, expected.len() as u64);

    harness.shutdown.trigger();
    timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_acceptor_status_codes() {
    let ctx = AcceptorContext::new(&AcceptorSettings::default());

    // Reachable destination
    let port = echo_server().await;
    let (mut agent_side, unit) = duplex(4096);
    let served = tokio::spawn({
        let ctx = ctx.clone();
        async move { serve_unit(unit, &ctx).await }
    });
    let request = serde_json::json!({"remote": "127.0.0.1", "port": port, "user": "amos", "tid": "SEQ-abcde-1"});
    auth::write_message(&mut agent_side, &request).await.unwrap();
    let (response, _): (AuthResponse, _) = auth::read_message(&mut agent_side).await.unwrap();
    assert_eq!(response.code, STATUS_OK);
    agent_side.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, agent_side.read_to_end(&mut rest)).await.unwrap().unwrap();
    timeout(WAIT, served).await.unwrap().unwrap().unwrap();

    // Closed port
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed_port = closed.local_addr().unwrap().port();
    drop(closed);
    let (mut agent_side, unit) = duplex(4096);
    let served = tokio::spawn(async move { serve_unit(unit, &ctx).await });
    let request = serde_json::json!({"remote": "127.0.0.1", "port": closed_port, "user": "amos", "tid": "SEQ-abcde-2"});
    auth::write_message(&mut agent_side, &request).await.unwrap();
    let (response, _): (AuthResponse, _) = auth::read_message(&mut agent_side).await.unwrap();
    assert_eq!(response.code, STATUS_FAILED);
    assert_eq!(response.msg, "connect to remote failed");
    let err = timeout(WAIT, served).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind(), "DialError");
}

#[tokio::test]
async fn test_shutdown_with_idle_clients() {
    let harness = start_agent().await;
    // Connected but never negotiating
    let _idle = TcpStream::connect(harness.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.shutdown.trigger();
    timeout(Duration::from_secs(15), harness.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_with_saturated_session_limit() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let settings = AgentSettings {
        max_sessions: Some(1),
        shutdown_grace: Duration::from_millis(500),
        ..AgentSettings::default()
    };
    let agent = Agent::bind(
        parse_socket_addr("127.0.0.1:0").unwrap(),
        Arc::new(PipeDialer { units: tx }),
        settings,
    )
    .await
    .unwrap();
    let addr = agent.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(agent.run(shutdown.subscribe()));

    // One client holds the only slot, the second waits for it
    let _first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.trigger();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}
