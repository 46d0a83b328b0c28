//! SOCKS5 negotiation and CONNECT request codec
//!
//! Only the "no authentication required" method is ever offered back, and the
//! bound address in the success reply is always zero.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{ProtocolError, Result};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply code for an address type the server cannot handle
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Method selection reply: version 5, no authentication
pub const NEGOTIATION_REPLY: [u8; 2] = [SOCKS5_VERSION, METHOD_NO_AUTH];

/// CONNECT success reply with an all-zero IPv4 bound address
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Destination host as carried in the request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Whether the address is an IP literal rather than a name
    pub fn is_literal(&self) -> bool {
        !matches!(self, Address::Domain(_))
    }

    /// SOCKS5 ATYP byte for this address
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ATYP_IPV4,
            Address::Domain(_) => ATYP_DOMAIN,
            Address::Ipv6(_) => ATYP_IPV6,
        }
    }
}

impl fmt::Display for Address {
    /// IPv4 as dotted decimal, IPv6 as eight zero-padded hextets, domains verbatim
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => {
                let s = ip.segments();
                write!(
                    f,
                    "{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}",
                    s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]
                )
            }
            Address::Domain(name) => f.write_str(name),
        }
    }
}

/// Destination address and port parsed from a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    pub address: Address,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// Host string sent to the acceptor in the auth request
    pub fn host(&self) -> String {
        self.address.to_string()
    }

    /// Encode as `ATYP, addr..., port_hi, port_lo`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 1 + 255 + 2);
        out.push(self.address.atyp());
        match &self.address {
            Address::Ipv4(ip) => out.extend_from_slice(&ip.octets()),
            Address::Ipv6(ip) => out.extend_from_slice(&ip.octets()),
            Address::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
}

impl Request {
    /// Re-encode the request exactly as it appeared on the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SOCKS5_VERSION, self.command, 0x00];
        out.extend_from_slice(&self.target.encode());
        out
    }
}

/// Read the method selection message and answer with "no authentication"
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 257];
    stream.read_exact(&mut buf[..2]).await?;

    // The greeting version byte is not checked; the request header is.
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    debug!("SOCKS5 greeting offered {} method(s)", nmethods);

    stream.write_all(&NEGOTIATION_REPLY).await?;
    Ok(())
}

/// Read the request header, address and port
///
/// On an unsupported address type the client is told so with reply code 0x08
/// before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let [version, command, _reserved, atyp] = header;
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    let address = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?;
            Address::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            // Best effort, the request is rejected either way
            let _ = send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await;
            return Err(ProtocolError::UnsupportedAddressType(other).into());
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(Request {
        command,
        target: TargetAddr::new(address, u16::from_be_bytes(port)),
    })
}

/// Write the fixed CONNECT success reply
pub async fn send_success<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&SUCCESS_REPLY).await?;
    Ok(())
}

async fn send_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = SUCCESS_REPLY;
    reply[1] = code;
    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ProxyError;
    use tokio::io::duplex;

    async fn parse(bytes: &[u8]) -> Result<Request> {
        let (mut client, mut server) = duplex(1024);
        client.write_all(bytes).await.unwrap();
        read_request(&mut server).await
    }

    #[tokio::test]
    async fn test_negotiate_replies_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

        negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_ipv4_request() {
        let wire = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0, 80];
        let req = parse(&wire).await.unwrap();

        assert_eq!(req.target.host(), "93.184.216.34");
        assert_eq!(req.target.port, 80);
        assert_eq!(req.encode(), wire.to_vec());
    }

    #[tokio::test]
    async fn test_domain_request() {
        let mut wire = vec![0x05, 0x01, 0x00, 0x03, 11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());

        let req = parse(&wire).await.unwrap();
        assert_eq!(req.target.address, Address::Domain("example.com".into()));
        assert!(!req.target.address.is_literal());
        assert_eq!(req.target.port, 443);
        assert_eq!(req.encode(), wire);
    }

    #[tokio::test]
    async fn test_ipv6_request_formats_hextets() {
        let mut wire = vec![0x05, 0x01, 0x00, 0x04];
        wire.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x01]);
        wire.extend_from_slice(&[0x1f, 0x90]);

        let req = parse(&wire).await.unwrap();
        assert_eq!(req.target.host(), "2001:0db8:0000:0000:0000:0000:0000:0001");
        assert_eq!(req.target.port, 8080);
        assert_eq!(req.encode(), wire);
        // The formatted host must still parse as the same literal
        let parsed: Ipv6Addr = req.target.host().parse().unwrap();
        assert_eq!(Address::Ipv6(parsed), req.target.address);
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let err = parse(&[0x04, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await.unwrap_err();
        match err {
            ProxyError::Protocol(ProtocolError::UnsupportedVersion(4)) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_address_type_replies() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        match err {
            ProxyError::Protocol(ProtocolError::UnsupportedAddressType(0x02)) => {}
            other => panic!("unexpected error: {:?}", other),
        }

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_ADDRESS_TYPE_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_truncated_request_is_io_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0]).await.unwrap();
        drop(client);

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_success_reply_bytes() {
        assert_eq!(SUCCESS_REPLY, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
