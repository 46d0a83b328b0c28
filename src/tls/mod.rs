//! TLS handling module
//!
//! OpenSSL terminates and originates the WebSocket transport; rustls carries
//! QUIC, which requires it.

mod acceptor;
mod cert;
mod connector;

pub use acceptor::{accept_tls, create_tls_acceptor};
pub use cert::{client_crypto, load_certs, load_private_key, server_crypto};
pub use connector::{connect_tls, create_tls_connector};
