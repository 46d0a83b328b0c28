//! PEM loading and rustls configuration for the QUIC endpoints
//!
//! QUIC always runs TLS 1.3 with the `free-go` ALPN tag, using the ring
//! provider explicitly so no process-wide default provider is required.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::common::{ProxyError, Result};
use crate::config::ALPN;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("open {} failed: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("parse {} failed: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no certificate found in {}", path.display())));
    }
    debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key in a PEM file (PKCS#1, PKCS#8 or SEC1)
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("parse {} failed: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}

/// Server crypto for a QUIC listener
pub fn server_crypto(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Client crypto for outbound QUIC dials
///
/// Trusts the webpki roots and, when given, every certificate in `ca_cert`.
/// The default in-memory resumption cache is kept, so all dials through one
/// endpoint share it.
pub fn client_crypto(ca_cert: Option<&Path>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca) = ca_cert {
        for cert in load_certs(ca)? {
            roots.add(cert)?;
        }
    }

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/server.crt")).unwrap_err();
        assert_eq!(err.kind(), "TlsError");
    }

    #[test]
    fn test_file_without_pem_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();

        assert!(load_certs(file.path()).is_err());
        assert!(load_private_key(file.path()).is_err());
    }

    #[test]
    fn test_client_crypto_defaults() {
        let config = client_crypto(None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"free-go".to_vec()]);
    }
}
