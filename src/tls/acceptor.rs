//! OpenSSL acceptor for the WebSocket listeners

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, info};
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};

/// Create a TLS acceptor from a PEM certificate chain and key
///
/// # Example
///
/// ```no_run
/// # use std::path::Path;
/// # use hiproxy::tls::create_tls_acceptor;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let acceptor = create_tls_acceptor(
///     Path::new("config/server.crt"),
///     Path::new("config/server.key"),
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_certificate_chain_file(cert_path)?;
    acceptor.set_private_key_file(key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;

    info!("Loaded WebSocket TLS certificate from {}", cert_path.display());
    Ok(acceptor.build())
}

/// Run the server side of a TLS handshake on an accepted socket
pub async fn accept_tls(acceptor: Arc<SslAcceptor>, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context()).map_err(ProxyError::Ssl)?;
    let mut stream = SslStream::new(ssl, stream).map_err(ProxyError::Ssl)?;

    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| ProxyError::Tls(format!("TLS handshake failed: {}", e)))?;

    debug!("TLS handshake successful");
    Ok(stream)
}
