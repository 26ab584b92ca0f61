//! The local replica a session binds.

use crate::error::{SessionError, SessionResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tidesync_auth::Token;

/// Handle to an attached replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaHandle(u64);

impl ReplicaHandle {
    /// Wraps a raw handle value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Opens and closes live synchronization for a local replica.
///
/// Implemented by the storage layer. Both calls are made from the session's
/// driver task and must not block for long.
pub trait LocalReplica: Send + Sync {
    /// Attaches the replica at `local_path` using `access_token`.
    fn attach(&self, local_path: &str, access_token: &Token) -> SessionResult<ReplicaHandle>;

    /// Detaches a replica attached earlier.
    fn detach(&self, handle: ReplicaHandle);
}

/// An in-memory replica for testing.
#[derive(Debug, Default)]
pub struct MemoryReplica {
    next_handle: AtomicU64,
    attached: RwLock<HashMap<ReplicaHandle, String>>,
    attach_count: AtomicU64,
    detach_count: AtomicU64,
    failure: RwLock<Option<String>>,
}

impl MemoryReplica {
    /// Creates an in-memory replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following attach fail with `message`.
    pub fn fail_attach(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    /// Lets attach succeed again.
    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    /// Returns true if `local_path` is attached.
    pub fn is_attached(&self, local_path: &str) -> bool {
        self.attached.read().values().any(|path| path == local_path)
    }

    /// Returns how many attach calls succeeded.
    pub fn attach_count(&self) -> u64 {
        self.attach_count.load(Ordering::SeqCst)
    }

    /// Returns how many detach calls released a live handle.
    pub fn detach_count(&self) -> u64 {
        self.detach_count.load(Ordering::SeqCst)
    }
}

impl LocalReplica for MemoryReplica {
    fn attach(&self, local_path: &str, _access_token: &Token) -> SessionResult<ReplicaHandle> {
        if let Some(message) = self.failure.read().clone() {
            return Err(SessionError::Replica(message));
        }
        let handle = ReplicaHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.attached.write().insert(handle, local_path.to_string());
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn detach(&self, handle: ReplicaHandle) {
        if self.attached.write().remove(&handle).is_some() {
            self.detach_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
