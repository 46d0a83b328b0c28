//! Session protocol module
//!
//! SOCKS5 parsing, destination filtering and the auth handshake. Everything
//! here is written against `AsyncRead + AsyncWrite` and knows nothing about
//! which transport carries it.

pub mod auth;
pub mod policy;
pub mod socks5;

pub use auth::{AuthRequest, AuthResponse};
pub use socks5::{Address, TargetAddr};
