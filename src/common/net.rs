//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::{ProxyError, Result};

/// Keep-alive probe interval applied to dialed destination sockets
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(ProxyError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(ProxyError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Config(format!("Missing port in address: {}", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| ProxyError::Config(format!("Invalid port in address {}: {}", addr, e)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::Config(format!("Missing host in address: {}", addr)));
    }
    Ok((host.to_string(), port))
}

/// Resolve `host:port` to the first socket address the resolver returns
pub async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ProxyError::Dial(format!("resolve {} failed: {}", addr, e)))?
        .next()
        .ok_or_else(|| ProxyError::Dial(format!("resolve {} returned no address", addr)))
}

/// Format a host and port for dialing, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Connect to `host:port` over TCP within `connect_timeout`
///
/// The returned socket has `TCP_NODELAY` and keep-alive enabled.
pub async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let target = join_host_port(host, port);
    let stream = timeout(connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| ProxyError::Dial(format!("connect to {} timed out", target)))?
        .map_err(|e| ProxyError::Dial(format!("connect to {} failed: {}", target, e)))?;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:8080");
        assert!(addr.is_ok(), "Should be able to parse a valid address");

        if let Ok(socket_addr) = addr {
            assert_eq!(socket_addr.port(), 8080);
        }

        let addr = parse_socket_addr("invalid-address");
        assert!(addr.is_err(), "Should fail to parse an invalid address");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("go.example.com:1080").unwrap(), ("go.example.com".to_string(), 1080));
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1".to_string(), 443));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port(":80").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("1.2.3.4", 80), "1.2.3.4:80");
        assert_eq!(join_host_port("2001:db8:0:0:0:0:0:1", 443), "[2001:db8:0:0:0:0:0:1]:443");
        assert_eq!(join_host_port("example.com", 8080), "example.com:8080");
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // Bind then drop to obtain a port with no listener
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp("127.0.0.1", port, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.kind(), "DialError");
    }
}
