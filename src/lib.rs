//! hiproxy: SOCKS5 tunneling over QUIC and WebSocket
//!
//! A local agent speaks SOCKS5 to applications and carries each connection
//! over an authenticated, TLS-protected transport to a server-side acceptor,
//! which dials the real destination. A broker can sit in between and splice
//! two independently dialed QUIC connections.
//!
//! # Main Features
//!
//! - SOCKS5 CONNECT with IPv4, IPv6 and domain targets
//! - Internal literal destinations refused before any dial
//! - One JSON auth exchange per session
//! - QUIC (`free-go` ALPN, TLS 1.3) and WebSocket (`/go/ws`, `binary`) transports
//! - Bidirectional relay with half-close and bounded teardown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use hiproxy::proxy::{Agent, AgentSettings, Shutdown};
//! use hiproxy::tls::client_crypto;
//! use hiproxy::transport::quic::QuicDialer;
//! use hiproxy::{parse_socket_addr, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let dialer = QuicDialer::new(
//!         "go.example.com:1080",
//!         client_crypto(None)?,
//!         Duration::from_secs(60),
//!         Duration::from_secs(10),
//!         Duration::from_secs(60),
//!     )
//!     .await?;
//!
//!     let agent = Agent::bind(
//!         parse_socket_addr("127.0.0.1:1080")?,
//!         Arc::new(dialer),
//!         AgentSettings::default(),
//!     )
//!     .await?;
//!
//!     let shutdown = Shutdown::new();
//!     agent.run(shutdown.subscribe()).await
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod tls;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, ProxyError, Result};
pub use proxy::{Agent, QuicAcceptor, QuicBroker, Shutdown};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
