//! Table of running handler processes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a spawned handler, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Process {0} is already registered")]
    AlreadyRegistered(HandleId),
}

#[derive(Debug, Default)]
struct KillLatch {
    requested: AtomicBool,
    notify: Notify,
}

/// Handle to a spawned handler process.
///
/// Killing is a request: the task owning the child waits on
/// [`ProcessHandle::kill_requested`] and delivers the signal itself, so a
/// request can never reach a pid that was already reaped and reused.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: HandleId,
    pid: Option<u32>,
    latch: Arc<KillLatch>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
            pid,
            latch: Arc::new(KillLatch::default()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// OS process id, if the child had one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the owner to terminate the process. Does not wait for exit.
    pub fn request_kill(&self) {
        self.latch.requested.store(true, Ordering::SeqCst);
        self.latch.notify.notify_one();
    }

    pub fn is_kill_requested(&self) -> bool {
        self.latch.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a kill was requested, including requests made before
    /// this call.
    pub async fn kill_requested(&self) {
        self.latch.notify.notified().await;
    }
}

struct Entry {
    handle: ProcessHandle,
    topic: String,
}

/// Running handlers keyed by identity, valued by the topic that spawned them.
///
/// An entry exists from successful spawn until the exit has been observed.
/// Only the dispatcher registers and unregisters; kills come from command
/// drain tasks and shutdown.
#[derive(Default)]
pub struct ProcessRegistry {
    procs: RwLock<HashMap<HandleId, Entry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        handle: ProcessHandle,
        topic: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let mut procs = self.procs.write().await;
        if procs.contains_key(&handle.id) {
            return Err(RegistryError::AlreadyRegistered(handle.id));
        }
        let topic = topic.into();
        debug!(id = %handle.id, pid = ?handle.pid, topic = %topic, "Registered process");
        procs.insert(handle.id, Entry { handle, topic });
        Ok(())
    }

    /// Remove a handle. No-op if absent.
    pub async fn unregister(&self, id: HandleId) {
        if self.procs.write().await.remove(&id).is_some() {
            debug!(id = %id, "Unregistered process");
        }
    }

    /// Request termination of every process registered under `topic`,
    /// except `except`. Returns the number of processes signalled.
    pub async fn kill_topic(&self, topic: &str, except: Option<HandleId>) -> usize {
        let procs = self.procs.read().await;
        let mut killed = 0;
        for entry in procs.values() {
            if entry.topic == topic && Some(entry.handle.id) != except {
                info!(topic = %topic, pid = ?entry.handle.pid, "Killing handler");
                entry.handle.request_kill();
                killed += 1;
            }
        }
        killed
    }

    /// Request termination of every registered process.
    pub async fn kill_all(&self) -> usize {
        let procs = self.procs.read().await;
        for entry in procs.values() {
            entry.handle.request_kill();
        }
        procs.len()
    }

    pub async fn topic_of(&self, id: HandleId) -> Option<String> {
        self.procs.read().await.get(&id).map(|e| e.topic.clone())
    }

    pub async fn len(&self) -> usize {
        self.procs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.procs.read().await.is_empty()
    }
}
