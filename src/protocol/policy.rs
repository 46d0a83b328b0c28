//! Destination filtering
//!
//! Literal destinations in loopback or private ranges are refused before any
//! transport dial. Domain names pass unresolved; the acceptor resolves them.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::common::{ProxyError, Result};
use super::socks5::{Address, TargetAddr};

/// Whether an IPv4 address is loopback or in an RFC 1918 range
fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    // 127/8, 10/8, 172.16/12, 192.168/16
    ip.is_loopback() || ip.is_private()
}

fn is_internal_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    // ::ffff:a.b.c.d is the same destination as a.b.c.d
    match ip.to_ipv4_mapped() {
        Some(v4) => is_internal_v4(&v4),
        None => false,
    }
}

/// Whether a parsed request address is an internal literal
pub fn is_internal_address(address: &Address) -> bool {
    match address {
        Address::Ipv4(ip) => is_internal_v4(ip),
        Address::Ipv6(ip) => is_internal_v6(ip),
        Address::Domain(_) => false,
    }
}

/// Reject internal literal destinations
pub fn check_target(target: &TargetAddr) -> Result<()> {
    if is_internal_address(&target.address) {
        return Err(ProxyError::PolicyRejected(target.to_string()));
    }
    Ok(())
}
