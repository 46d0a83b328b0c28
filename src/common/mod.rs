//! Common module
//!
//! This module contains shared types, errors, and utility functions used throughout the application.

pub mod error;
pub mod log;
pub mod net;

// Re-export commonly used types and functions
pub use error::{ProtocolError, ProxyError, Result};
pub use log::init_logger;
pub use net::{connect_tcp, join_host_port, parse_socket_addr, resolve, split_host_port};
