//! Per-connection session state
//!
//! A session is owned by the task that accepted it. It holds the two
//! endpoints until the relay takes them, and closes whatever it still holds on
//! [`Session::close`], which is safe to call any number of times.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::proxy::forwarder::{relay, RelayOptions, RelayStats};
use crate::transport::Unit;

/// Produces `SEQ-<prefix>-<n>` correlation ids
///
/// The prefix is random per generator, the sequence starts at 1.
#[derive(Debug)]
pub struct SessionIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        Self::with_prefix(&uid[..5])
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("SEQ-{}-{}", self.prefix, n)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Negotiating,
    Filtering,
    Dialing,
    Authenticating,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Negotiating => "negotiating",
            Self::Filtering => "filtering",
            Self::Dialing => "dialing",
            Self::Authenticating => "authenticating",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One proxied connection attempt
pub struct Session<L, R> {
    id: String,
    state: SessionState,
    local: Option<L>,
    remote: Option<R>,
}

impl<L, R> Session<L, R>
where
    L: Unit + 'static,
    R: Unit + 'static,
{
    pub fn new(id: String, local: L) -> Self {
        Self {
            id,
            state: SessionState::Accepted,
            local: Some(local),
            remote: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adopt the id the peer chose, so both ends log the same one
    pub fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }


    /// Move to `state`; a closed session stays closed
    pub fn advance(&mut self, state: SessionState) {
        if self.state != SessionState::Closed {
            self.state = state;
        }
    }

    pub fn attach_remote(&mut self, remote: R) {
        self.remote = Some(remote);
    }

    pub fn local_mut(&mut self) -> Option<&mut L> {
        self.local.as_mut()
    }

    pub fn remote_mut(&mut self) -> Option<&mut R> {
        self.remote.as_mut()
    }

    /// Relay local and remote until both directions end
    ///
    /// Returns `None` when either endpoint is missing; the session is closed
    /// afterwards in every case.
    pub async fn relay(&mut self, options: RelayOptions) -> Option<RelayStats> {
        let stats = match (self.local.take(), self.remote.take()) {
            (Some(local), Some(remote)) => {
                self.advance(SessionState::Relaying);
                Some(relay(&self.id, local, remote, options).await)
            }
            (local, remote) => {
                self.local = local;
                self.remote = remote;
                None
            }
        };
        self.close().await;
        stats
    }

    /// Close whatever endpoints are still held
    pub async fn close(&mut self) {
        if let Some(mut local) = self.local.take() {
            local.close().await;
        }
        if let Some(mut remote) = self.remote.take() {
            remote.close().await;
        }
        if self.state != SessionState::Closed {
            debug!("Tid:{}, session closed in state {}", self.id, self.state);
            self.state = SessionState::Closed;
        }
    }
}
