//! Session task bookkeeping
//!
//! [`SessionTasks`] tracks the tasks spawned by one accept loop and bounds
//! how many may run at once. [`SessionRegistry`] is the shared set of live
//! WebSocket sessions, written on connect and disconnect and read on
//! shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{sleep, timeout, Instant};

/// Admission bound shared by the sessions of one listener
#[derive(Debug, Clone)]
pub struct Admission {
    limit: Option<Arc<Semaphore>>,
}

impl Admission {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            limit: max_sessions.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Wait for a free slot; `None` permit means unbounded
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.limit {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Tasks spawned by one accept loop
pub struct SessionTasks {
    tasks: JoinSet<()>,
    admission: Admission,
}

impl SessionTasks {
    pub fn new(admission: Admission) -> Self {
        Self {
            tasks: JoinSet::new(),
            admission,
        }
    }

    /// Spawn `session`; it starts once admission allows it
    ///
    /// The wait for a slot happens inside the task, so the caller's accept
    /// loop keeps watching for shutdown while the limit is saturated.
    pub fn spawn<F>(&mut self, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let admission = self.admission.clone();
        self.tasks.spawn(async move {
            let _permit = admission.acquire().await;
            session.await;
        });
    }

    /// Collect finished tasks, logging panics
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Session task panicked: {}", e);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, however long it takes
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Session task panicked: {}", e);
                }
            }
        }
    }

    /// Wait up to `grace` for the remaining tasks, then abort the rest
    pub async fn drain(mut self, grace: Duration) {
        if self.tasks.is_empty() {
            return;
        }
        info!("Waiting up to {:?} for {} session(s)", grace, self.tasks.len());

        let waited = timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            warn!("Aborting {} session(s) still running after grace period", self.tasks.len());
            self.tasks.shutdown().await;
        }
    }
}

/// Live WebSocket sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, AbortHandle>>,
    next_key: AtomicU64,
}

/// Removes its entry from the registry when dropped
pub struct Registration {
    registry: Arc<SessionRegistry>,
    key: u64,
}

impl Registration {
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a key for a session about to be spawned
    pub fn reserve(self: &Arc<Self>) -> Registration {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        Registration {
            registry: Arc::clone(self),
            key,
        }
    }

    /// Attach the spawned task to its reserved key
    pub fn insert(&self, key: u64, handle: AbortHandle) {
        // A session that already finished has dropped its registration
        if handle.is_finished() {
            return;
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(key, handle);
        }
    }

    fn remove(&self, key: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&key);
        }
    }

    /// Live sessions, ignoring tasks that ended without deregistering
    pub fn len(&self) -> usize {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                sessions.retain(|_, handle| !handle.is_finished());
                sessions.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `grace` for sessions to finish, then abort the rest
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        let remaining: Vec<AbortHandle> = match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        if !remaining.is_empty() {
            warn!("Aborting {} WebSocket session(s) after grace period", remaining.len());
        }
        for handle in remaining {
            handle.abort();
        }
    }
}
