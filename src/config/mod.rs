//! Configuration module
//!
//! Configuration is layered: serde defaults, then the YAML/JSON file, then
//! `HIPROXY_*` environment variables, then command line overrides applied by
//! `main`. Each role reads only its own section.

pub mod defaults;
mod loader;
mod validator;

pub use self::defaults::{ALPN, ENV_PREFIX, WS_PATH, WS_SUBPROTOCOL};
pub use self::loader::ConfigLoader;
pub use self::validator::ConfigValidator;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::common::ProxyError;

/// Transport carrying agent sessions
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One QUIC connection and stream per session
    Quic,
    /// One WebSocket connection per session
    WebSocket,
}

// Case-insensitive, accepts "ws" as a shorthand
impl<'de> Deserialize<'de> for TransportKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TransportKind::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Default for TransportKind {
    fn default() -> Self {
        defaults::transport()
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quic => write!(f, "quic"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quic" => Ok(Self::Quic),
            "websocket" | "ws" => Ok(Self::WebSocket),
            _ => Err(ProxyError::Config(format!(
                "Invalid transport: {}. Valid values are: quic, websocket",
                s
            ))),
        }
    }
}

/// SOCKS5 front end settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// SOCKS5 listen address
    #[serde(default = "defaults::agent_listen")]
    pub listen: String,

    /// Which transport carries sessions
    pub transport: TransportKind,

    /// QUIC upstream, `host:port`
    pub url: String,

    /// WebSocket upstream, `wss://host[:port]/go/ws`
    pub ws_url: String,

    /// Identity sent in every auth request
    #[serde(default = "defaults::user")]
    pub user: String,

    /// Extra PEM roots trusted when dialing upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: defaults::agent_listen(),
            transport: defaults::transport(),
            url: String::new(),
            ws_url: String::new(),
            user: defaults::user(),
            ca_cert: None,
        }
    }
}

/// Acceptor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// QUIC listen address
    #[serde(default = "defaults::server_quic_listen")]
    pub quic_listen: String,

    /// WebSocket listen address; empty disables the WebSocket acceptor
    #[serde(default = "defaults::server_ws_listen")]
    pub ws_listen: String,

    /// Terminate TLS on the WebSocket listener
    #[serde(default = "defaults::ws_tls")]
    pub ws_tls: bool,

    /// PEM certificate chain
    #[serde(default = "defaults::cert_path")]
    pub cert: PathBuf,

    /// PEM private key
    #[serde(default = "defaults::key_path")]
    pub key: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            quic_listen: defaults::server_quic_listen(),
            ws_listen: defaults::server_ws_listen(),
            ws_tls: defaults::ws_tls(),
            cert: defaults::cert_path(),
            key: defaults::key_path(),
        }
    }
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Client-facing QUIC listen address
    #[serde(default = "defaults::broker_listen")]
    pub listen: String,

    /// Client-facing WebSocket listen address; empty disables it
    #[serde(default = "defaults::broker_ws_listen")]
    pub ws_listen: String,

    /// Terminate TLS on the WebSocket listener
    #[serde(default = "defaults::ws_tls")]
    pub ws_tls: bool,

    /// Upstream QUIC server, `host:port`
    pub upstream: String,

    #[serde(default = "defaults::cert_path")]
    pub cert: PathBuf,

    #[serde(default = "defaults::key_path")]
    pub key: PathBuf,

    /// Extra PEM roots trusted when dialing upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::broker_listen(),
            ws_listen: defaults::broker_ws_listen(),
            ws_tls: defaults::ws_tls(),
            upstream: String::new(),
            cert: defaults::cert_path(),
            key: defaults::key_path(),
            ca_cert: None,
        }
    }
}

/// Timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Destination TCP dial
    #[serde(default = "defaults::connect_timeout")]
    pub connect: u64,

    /// Transport dial and handshake
    #[serde(default = "defaults::handshake_timeout")]
    pub handshake: u64,

    /// QUIC idle timeout
    #[serde(default = "defaults::idle_timeout")]
    pub idle: u64,

    /// QUIC keep-alive on outbound connections
    #[serde(default = "defaults::keep_alive")]
    pub keep_alive: u64,

    /// Grace period for in-flight sessions on shutdown
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace: u64,

    /// Idle limit for a relay direction once the other one ended
    #[serde(default = "defaults::relay_linger")]
    pub relay_linger: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: defaults::connect_timeout(),
            handshake: defaults::handshake_timeout(),
            idle: defaults::idle_timeout(),
            keep_alive: defaults::keep_alive(),
            shutdown_grace: defaults::shutdown_grace(),
            relay_linger: defaults::relay_linger(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn relay_linger(&self) -> Duration {
        Duration::from_secs(self.relay_linger)
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitConfig {
    /// Concurrent sessions per listener; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    /// Relay copy buffer in bytes
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_sessions: None,
            buffer_size: defaults::buffer_size(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            agent: AgentConfig::default(),
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitConfig::default(),
        }
    }
}
