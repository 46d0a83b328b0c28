//! Proxy roles
//!
//! The agent (SOCKS5 front end), the server-side acceptor and the broker,
//! built on one relay engine and one session type.

pub mod acceptor;
pub mod agent;
pub mod broker;
pub mod forwarder;
pub mod listener;
pub mod session;
pub mod shutdown;
pub mod tasks;

pub use acceptor::{serve_unit, AcceptorContext, AcceptorSettings, QuicAcceptor};
pub use agent::{handle_client, Agent, AgentContext, AgentSettings};
pub use broker::{BrokerSettings, QuicBroker, WsBridge};
pub use forwarder::{relay, RelayOptions, RelayStats};
pub use listener::{UnitHandler, WsListener, WsListenerSettings};
pub use session::{Session, SessionIdGenerator, SessionState};
pub use shutdown::{Shutdown, ShutdownSignal};
