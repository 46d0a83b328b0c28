//! Configuration validator
//!
//! Each role validates only the section it runs with.

use std::path::Path;

use log::warn;

use crate::common::{parse_socket_addr, split_host_port, ProxyError, Result};
use crate::config::{ProxyConfig, TransportKind};

/// Role-scoped validation
pub trait ConfigValidator {
    fn validate_agent(&self) -> Result<()>;
    fn validate_server(&self) -> Result<()>;
    fn validate_broker(&self) -> Result<()>;

    /// Non-fatal issues worth logging at startup
    fn check_warnings(&self) -> Vec<String>;
}

impl ConfigValidator for ProxyConfig {
    fn validate_agent(&self) -> Result<()> {
        validate_general_settings(self)?;
        parse_socket_addr(&self.agent.listen)?;

        match self.agent.transport {
            TransportKind::Quic => {
                if self.agent.url.is_empty() {
                    return Err(missing("agent.url"));
                }
                split_host_port(&self.agent.url)?;
            }
            TransportKind::WebSocket => {
                if self.agent.ws_url.is_empty() {
                    return Err(missing("agent.ws_url"));
                }
                if !(self.agent.ws_url.starts_with("ws://") || self.agent.ws_url.starts_with("wss://")) {
                    return Err(ProxyError::Config(format!(
                        "agent.ws_url must start with ws:// or wss://: {}",
                        self.agent.ws_url
                    )));
                }
            }
        }

        if let Some(ca) = &self.agent.ca_cert {
            validate_file_exists(ca, "agent.ca_cert")?;
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        validate_general_settings(self)?;
        parse_socket_addr(&self.server.quic_listen)?;
        if !self.server.ws_listen.is_empty() {
            parse_socket_addr(&self.server.ws_listen)?;
        }
        validate_file_exists(&self.server.cert, "server.cert")?;
        validate_file_exists(&self.server.key, "server.key")?;
        Ok(())
    }

    fn validate_broker(&self) -> Result<()> {
        validate_general_settings(self)?;
        parse_socket_addr(&self.broker.listen)?;
        if !self.broker.ws_listen.is_empty() {
            parse_socket_addr(&self.broker.ws_listen)?;
        }
        if self.broker.upstream.is_empty() {
            return Err(missing("broker.upstream"));
        }
        split_host_port(&self.broker.upstream)?;
        validate_file_exists(&self.broker.cert, "broker.cert")?;
        validate_file_exists(&self.broker.key, "broker.key")?;
        if let Some(ca) = &self.broker.ca_cert {
            validate_file_exists(ca, "broker.ca_cert")?;
        }
        Ok(())
    }

    fn check_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !is_known_level(&self.log_level) {
            warnings.push(format!("Invalid log level '{}', using default 'info'", self.log_level));
        }

        if self.limits.max_sessions.is_none() {
            warnings.push("No session limit configured; accept backlog is the only throttle".to_string());
        }

        if self.timeouts.relay_linger > self.timeouts.idle {
            warnings.push(format!(
                "relay_linger ({}s) exceeds the QUIC idle timeout ({}s)",
                self.timeouts.relay_linger, self.timeouts.idle
            ));
        }

        warnings
    }
}

fn is_known_level(level: &str) -> bool {
    matches!(level, "error" | "warn" | "info" | "debug" | "trace")
}

fn validate_general_settings(config: &ProxyConfig) -> Result<()> {
    if !is_known_level(&config.log_level) {
        warn!("Invalid log level: {}. Using default: info", config.log_level);
    }

    if config.limits.buffer_size == 0 {
        return Err(ProxyError::Config("Buffer size must be greater than 0".to_string()));
    }

    if config.limits.max_sessions == Some(0) {
        return Err(ProxyError::Config("max_sessions must be greater than 0 when set".to_string()));
    }

    let t = &config.timeouts;
    for (name, value) in [
        ("timeouts.connect", t.connect),
        ("timeouts.handshake", t.handshake),
        ("timeouts.idle", t.idle),
    ] {
        if value == 0 {
            return Err(ProxyError::Config(format!("{} must be greater than 0", name)));
        }
    }

    Ok(())
}

fn validate_file_exists(path: &Path, name: &str) -> Result<()> {
    if !path.is_file() {
        return Err(ProxyError::Config(format!("{} not found: {}", name, path.display())));
    }
    Ok(())
}

fn missing(name: &str) -> ProxyError {
    ProxyError::Config(format!("Missing required configuration value: {}", name))
}
