//! Loopback fixtures for tests: self-signed certificates, an echo server and
//! a QUIC dialer that trusts them

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::tls::client_crypto;
use crate::transport::quic::QuicDialer;

/// PEM files for `localhost` and `127.0.0.1`, removed on drop
pub(crate) struct TestCert {
    _dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub(crate) fn self_signed() -> TestCert {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let x509 = builder.build();

    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("server.crt");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert, x509.to_pem().unwrap()).unwrap();
    std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

    TestCert { _dir: dir, cert, key: key_path }
}

/// Dialer for a loopback endpoint serving `cert`
pub(crate) async fn quic_dialer(addr: SocketAddr, cert: &TestCert) -> QuicDialer {
    QuicDialer::new(
        &addr.to_string(),
        client_crypto(Some(&cert.cert)).unwrap(),
        Duration::from_secs(10),
        Duration::from_secs(1),
        Duration::from_secs(5),
    )
    .await
    .unwrap()
}

/// TCP echo server on an ephemeral loopback port
pub(crate) async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}
