//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// SOCKS5 wire-level protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The request header carried a version other than 5
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// The request carried an ATYP outside {0x01, 0x03, 0x04}
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// The domain bytes were not valid UTF-8
    #[error("invalid domain name in request")]
    InvalidDomain,
}

/// hiproxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Malformed SOCKS5 bytes
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Destination refused by the filtering policy
    #[error("internal address rejected: {0}")]
    PolicyRejected(String),

    /// Transport or destination dial failure, including timeouts
    #[error("dial error: {0}")]
    Dial(String),

    /// Handshake rejected or undecodable
    #[error("auth error: {0}")]
    Auth(String),

    /// Mid-stream failure after the relay started
    #[error("relay error: {0}")]
    Relay(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC endpoint or connection error
    #[error("QUIC error: {0}")]
    Quic(String),

    /// WebSocket handshake or framing error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Taxonomy name used when a session failure is logged
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::PolicyRejected(_) => "PolicyRejected",
            Self::Dial(_) => "DialError",
            Self::Auth(_) | Self::Serialization(_) => "AuthError",
            Self::Relay(_) => "RelayIOError",
            Self::Io(_) => "IoError",
            Self::Ssl(_) | Self::Tls(_) => "TlsError",
            Self::Quic(_) => "QuicError",
            Self::WebSocket(_) => "WebSocketError",
            Self::Config(_) => "ConfigError",
        }
    }
}

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProxyError::WebSocket(err.to_string())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
