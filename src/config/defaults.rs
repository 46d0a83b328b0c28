//! Default configuration values
//!
//! Single source of truth for defaults.

use std::path::PathBuf;

use super::TransportKind;

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "HIPROXY";

/// Separator between nested keys in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config/hiproxy.yaml";

/// QUIC ALPN tag shared by agent, broker and server
pub const ALPN: &[u8] = b"free-go";

/// WebSocket subprotocol
pub const WS_SUBPROTOCOL: &str = "binary";

/// Path the WebSocket acceptor upgrades on
pub const WS_PATH: &str = "/go/ws";

pub const LOG_LEVEL_STR: &str = "info";
pub const AGENT_LISTEN_STR: &str = "0.0.0.0:1080";
pub const SERVER_QUIC_LISTEN_STR: &str = "0.0.0.0:1080";
pub const SERVER_WS_LISTEN_STR: &str = "0.0.0.0:8080";
pub const BROKER_LISTEN_STR: &str = "0.0.0.0:1080";
pub const BROKER_WS_LISTEN_STR: &str = "0.0.0.0:2080";
pub const CERT_PATH_STR: &str = "config/server.crt";
pub const KEY_PATH_STR: &str = "config/server.key";

pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

pub fn agent_listen() -> String {
    AGENT_LISTEN_STR.to_string()
}

pub fn transport() -> TransportKind {
    TransportKind::Quic
}

pub fn user() -> String {
    crate::protocol::auth::DEFAULT_USER.to_string()
}

pub fn server_quic_listen() -> String {
    SERVER_QUIC_LISTEN_STR.to_string()
}

pub fn server_ws_listen() -> String {
    SERVER_WS_LISTEN_STR.to_string()
}

pub fn broker_listen() -> String {
    BROKER_LISTEN_STR.to_string()
}

pub fn broker_ws_listen() -> String {
    BROKER_WS_LISTEN_STR.to_string()
}

pub fn cert_path() -> PathBuf {
    PathBuf::from(CERT_PATH_STR)
}

pub fn key_path() -> PathBuf {
    PathBuf::from(KEY_PATH_STR)
}

pub fn ws_tls() -> bool {
    true
}

/// Destination dial timeout in seconds
pub fn connect_timeout() -> u64 {
    10
}

/// Transport handshake timeout in seconds
pub fn handshake_timeout() -> u64 {
    60
}

/// QUIC idle timeout in seconds
pub fn idle_timeout() -> u64 {
    60
}

/// QUIC client keep-alive period in seconds
pub fn keep_alive() -> u64 {
    10
}

/// Grace period for in-flight sessions on shutdown, in seconds
pub fn shutdown_grace() -> u64 {
    5
}

/// Idle limit for the surviving relay direction, in seconds
pub fn relay_linger() -> u64 {
    60
}

/// Relay copy buffer (8KB)
pub fn buffer_size() -> usize {
    8192
}
