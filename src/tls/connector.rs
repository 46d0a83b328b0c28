//! OpenSSL connector for outbound `wss://` dials

use std::path::Path;
use std::pin::Pin;

use log::debug;
use openssl::ssl::{SslConnector, SslMethod};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};

/// Build a connector trusting the system roots plus an optional PEM bundle
pub fn create_tls_connector(ca_cert: Option<&Path>) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    if let Some(ca) = ca_cert {
        builder.set_ca_file(ca)?;
        debug!("Trusting extra CA bundle {}", ca.display());
    }
    builder.set_alpn_protos(b"\x08http/1.1")?;
    Ok(builder.build())
}

/// Client side of a TLS handshake, verifying `domain`
pub async fn connect_tls(connector: &SslConnector, domain: &str, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = connector.configure()?.into_ssl(domain)?;
    let mut stream = SslStream::new(ssl, stream)?;

    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| ProxyError::Tls(format!("TLS handshake with {} failed: {}", domain, e)))?;

    Ok(stream)
}
