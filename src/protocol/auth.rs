//! Session auth handshake
//!
//! One JSON request from the initiator, one JSON response from the responder,
//! each written as a single write on the transport unit. There is no length
//! prefix; a reader accumulates at most [`AUTH_BUFFER_SIZE`] bytes until one
//! complete JSON value decodes. Bytes that arrive behind that value belong to
//! the relay and are handed back to the caller.

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{ProxyError, Result};
use super::socks5::TargetAddr;

/// Upper bound on a handshake message
pub const AUTH_BUFFER_SIZE: usize = 1024;

pub const STATUS_OK: u16 = 200;
pub const STATUS_FAILED: u16 = 500;

/// Identity presented by the front ends
pub const DEFAULT_USER: &str = "amos";

pub const MSG_SUCCESS: &str = "success";
pub const MSG_READ_FAILED: &str = "read stream failed";
pub const MSG_DECODE_FAILED: &str = "unmarshal stream failed";
pub const MSG_CONNECT_FAILED: &str = "connect to remote failed";

/// Initiator → responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passwd: String,
    #[serde(default)]
    pub tid: String,
}

impl AuthRequest {
    pub fn new(target: &TargetAddr, user: &str, tid: &str) -> Self {
        Self {
            remote: target.host(),
            port: target.port,
            user: user.to_string(),
            passwd: String::new(),
            tid: tid.to_string(),
        }
    }
}

/// Responder → initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub code: u16,
    #[serde(default)]
    pub msg: String,
}

impl AuthResponse {
    pub fn success() -> Self {
        Self { code: STATUS_OK, msg: MSG_SUCCESS.to_string() }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self { code: STATUS_FAILED, msg: msg.into() }
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_OK
    }
}

/// Serialize `message` and send it in one write
pub async fn write_message<U, T>(unit: &mut U, message: &T) -> Result<()>
where
    U: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    unit.write_all(&bytes).await?;
    unit.flush().await?;
    Ok(())
}

/// Read one JSON value and return it with any bytes that followed it
///
/// Read failures surface as `ProxyError::Io`, decode failures as
/// `ProxyError::Serialization`.
pub async fn read_message<U, T>(unit: &mut U) -> Result<(T, Vec<u8>)>
where
    U: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = vec![0u8; AUTH_BUFFER_SIZE];
    let mut filled = 0;

    loop {
        let n = unit.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unit closed before handshake message",
            )));
        }
        filled += n;

        let mut values = serde_json::Deserializer::from_slice(&buf[..filled]).into_iter::<T>();
        match values.next() {
            Some(Ok(value)) => {
                let offset = values.byte_offset();
                return Ok((value, buf[offset..filled].to_vec()));
            }
            // Incomplete value; keep reading while there is room
            Some(Err(e)) if e.is_eof() && filled < buf.len() => continue,
            None if filled < buf.len() => continue,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ProxyError::Auth("handshake message is empty".to_string()));
            }
        }
    }
}

/// Initiator side: send `request`, wait for the verdict
///
/// Returns the bytes that arrived after the response; they are relay payload
/// and must reach the client before anything else.
pub async fn initiate<U>(unit: &mut U, request: &AuthRequest) -> Result<Vec<u8>>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    write_message(unit, request)
        .await
        .map_err(|e| ProxyError::Auth(format!("send auth request failed: {}", e)))?;

    let (response, leftover): (AuthResponse, _) = read_message(unit)
        .await
        .map_err(|e| ProxyError::Auth(format!("read auth response failed: {}", e)))?;

    if !response.is_success() {
        return Err(ProxyError::Auth(format!("code {}: {}", response.code, response.msg)));
    }

    debug!("Tid:{}, auth accepted for {}:{}", request.tid, request.remote, request.port);
    Ok(leftover)
}

/// Responder side: read the request, answering `500` when it is unusable
///
/// On success the caller must eventually send exactly one response with
/// [`respond`].
pub async fn accept_request<U>(unit: &mut U) -> Result<(AuthRequest, Vec<u8>)>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    match read_message::<_, AuthRequest>(unit).await {
        Ok(accepted) => Ok(accepted),
        Err(e) => {
            let msg = match e {
                ProxyError::Io(_) => MSG_READ_FAILED,
                _ => MSG_DECODE_FAILED,
            };
            // The unit may already be gone; the original failure is what matters
            let _ = respond(unit, &AuthResponse::failure(msg)).await;
            Err(ProxyError::Auth(format!("{}: {}", msg, e)))
        }
    }
}

/// Send the verdict for an accepted request
pub async fn respond<U>(unit: &mut U, response: &AuthResponse) -> Result<()>
where
    U: AsyncWrite + Unpin,
{
    write_message(unit, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::socks5::Address;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    #[test]
    fn test_request_wire_format() {
        let target = TargetAddr::new(Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)), 80);
        let req = AuthRequest::new(&target, DEFAULT_USER, "SEQ-abcde-1");
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();

        assert_eq!(json["remote"], "93.184.216.34");
        assert_eq!(json["port"], 80);
        assert_eq!(json["user"], "amos");
        assert_eq!(json["tid"], "SEQ-abcde-1");
        assert!(json.get("passwd").is_none());
    }

    #[test]
    fn test_request_missing_fields_default() {
        let req: AuthRequest = serde_json::from_str(r#"{"remote":"1.2.3.4","port":80,"tid":"x"}"#).unwrap();
        assert_eq!(req.remote, "1.2.3.4");
        assert_eq!(req.port, 80);
        assert_eq!(req.user, "");
        assert_eq!(req.tid, "x");
    }

    #[tokio::test]
    async fn test_initiate_success_and_leftover() {
        let (mut client, mut server) = duplex(4096);
        let target = TargetAddr::new(Address::Domain("example.com".into()), 25);
        let req = AuthRequest::new(&target, DEFAULT_USER, "t1");

        let responder = tokio::spawn(async move {
            let (got, rest) = accept_request(&mut server).await.unwrap();
            assert!(rest.is_empty());
            // Response coalesced with the first relay bytes
            let mut out = serde_json::to_vec(&AuthResponse::success()).unwrap();
            out.extend_from_slice(b"220 banner\r\n");
            server.write_all(&out).await.unwrap();
            got
        });

        let leftover = initiate(&mut client, &req).await.unwrap();
        assert_eq!(leftover, b"220 banner\r\n".to_vec());
        assert_eq!(responder.await.unwrap(), req);
    }

    #[tokio::test]
    async fn test_initiate_rejected() {
        let (mut client, mut server) = duplex(4096);
        let target = TargetAddr::new(Address::Domain("example.com".into()), 80);
        let req = AuthRequest::new(&target, DEFAULT_USER, "t2");

        tokio::spawn(async move {
            let _ = accept_request(&mut server).await.unwrap();
            respond(&mut server, &AuthResponse::failure(MSG_CONNECT_FAILED)).await.unwrap();
        });

        let err = initiate(&mut client, &req).await.unwrap_err();
        assert_eq!(err.kind(), "AuthError");
        assert!(err.to_string().contains(MSG_CONNECT_FAILED));
    }

    #[tokio::test]
    async fn test_accept_request_garbage_answers_500() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = accept_request(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), "AuthError");

        let (resp, _): (AuthResponse, _) = read_message(&mut client).await.unwrap();
        assert_eq!(resp.code, STATUS_FAILED);
        assert_eq!(resp.msg, MSG_DECODE_FAILED);
    }

    #[tokio::test]
    async fn test_read_message_split_across_writes() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            client.write_all(br#"{"code":20"#).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(br#"0,"msg":"success"}"#).await.unwrap();
        });

        let (resp, rest): (AuthResponse, _) = read_message(&mut server).await.unwrap();
        assert!(resp.is_success());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_read_message_oversized() {
        let (mut client, mut server) = duplex(4096);
        let mut big = br#"{"remote":""#.to_vec();
        big.extend(std::iter::repeat(b'a').take(AUTH_BUFFER_SIZE));
        client.write_all(&big).await.unwrap();

        let err = read_message::<_, AuthRequest>(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_read_message_closed_unit() {
        let (client, mut server) = duplex(64);
        drop(client);
        let err = read_message::<_, AuthRequest>(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
