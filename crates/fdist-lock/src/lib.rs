//! # fdist-lock
//!
//! Composite mutual exclusion for controller replicas.
//!
//! A [`DistributedLock`] stacks two layers:
//!
//! ```text
//! acquire:  local mutex (this process)  ->  remote lease (coordination service)
//! release:  remote lease                ->  local mutex
//! ```
//!
//! The local layer keeps threads of one replica from racing each other and
//! fails fast on reentrant use. The remote layer comes from a [`Coordinator`]
//! and serialises replicas on different hosts. Acquisition always returns a
//! scoped [`DistributedLockGuard`]; dropping it releases both layers.
//!
//! There is no wait/notify support and no indefinite blocking: every
//! acquisition carries a timeout. Critical sections are expected to be short.

mod coordinator;

pub use coordinator::{Coordinator, FileCoordinator, MemoryCoordinator, RemoteLease};

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Default budget for [`DistributedLock::acquire`].
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while acquiring or releasing a lock
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock '{scope}'")]
    Timeout { scope: String, waited: Duration },

    #[error("Lock '{scope}' is already held by the current thread")]
    Reentrant { scope: String },

    #[error("Coordination service error for lock '{scope}': {reason}")]
    Coordination { scope: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    /// True when the failure means "someone else holds it right now".
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Local + remote lock for one scope.
///
/// Share one instance per scope inside a process (behind an `Arc`); separate
/// instances for the same scope only exclude each other through the remote
/// layer, which is how two replicas see each other.
pub struct DistributedLock {
    scope: String,
    local: Arc<Mutex<()>>,
    owner: Arc<Mutex<Option<ThreadId>>>,
    coordinator: Arc<dyn Coordinator>,
    default_timeout: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("scope", &self.scope)
            .field("coordinator", &self.coordinator)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(scope: impl Into<String>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            scope: scope.into(),
            local: Arc::new(Mutex::new(())),
            owner: Arc::new(Mutex::new(None)),
            coordinator,
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override the budget used by [`acquire`](Self::acquire).
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Acquire with the default timeout.
    pub fn acquire(&self) -> Result<DistributedLockGuard> {
        self.try_acquire(self.default_timeout)
    }

    /// Acquire both layers within `timeout`.
    ///
    /// The local layer may consume part of the budget; whatever remains is
    /// handed to the coordinator. If the remote layer fails, the local lock is
    /// released before the error is returned.
    pub fn try_acquire(&self, timeout: Duration) -> Result<DistributedLockGuard> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            return Err(LockError::Reentrant {
                scope: self.scope.clone(),
            });
        }

        let start = Instant::now();
        let local = match self.local.try_lock_arc_for(timeout) {
            Some(guard) => guard,
            None => {
                return Err(LockError::Timeout {
                    scope: self.scope.clone(),
                    waited: start.elapsed(),
                })
            }
        };
        *self.owner.lock() = Some(me);

        let remaining = timeout.saturating_sub(start.elapsed());
        match self.coordinator.acquire(&self.scope, remaining) {
            Ok(lease) => {
                debug!(scope = %self.scope, waited = ?start.elapsed(), "Lock acquired");
                Ok(DistributedLockGuard {
                    scope: self.scope.clone(),
                    remote: Some(lease),
                    owner: Arc::clone(&self.owner),
                    local: Some(local),
                })
            }
            Err(e) => {
                *self.owner.lock() = None;
                drop(local);
                debug!(scope = %self.scope, error = %e, "Remote lock failed, local lock released");
                Err(e)
            }
        }
    }

    /// Whether the calling thread currently holds this lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Whether any thread of this process currently holds the local layer.
    pub fn is_locked(&self) -> bool {
        self.local.is_locked()
    }
}

/// Scoped ownership of both lock layers. Released on drop, remote first.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct DistributedLockGuard {
    scope: String,
    remote: Option<Box<dyn RemoteLease>>,
    owner: Arc<Mutex<Option<ThreadId>>>,
    local: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl DistributedLockGuard {
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Debug for DistributedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLockGuard")
            .field("scope", &self.scope)
            .finish()
    }
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        if let Some(remote) = self.remote.take() {
            if let Err(e) = remote.release() {
                warn!(scope = %self.scope, error = %e, "Failed to release remote lock");
            }
        }
        *self.owner.lock() = None;
        drop(self.local.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(scope: &str) -> DistributedLock {
        DistributedLock::new(scope, Arc::new(MemoryCoordinator::new()))
    }

    #[test]
    fn test_acquire_and_release() {
        let lock = lock("app");
        {
            let guard = lock.try_acquire(Duration::from_millis(100)).unwrap();
            assert_eq!(guard.scope(), "app");
            assert!(lock.is_locked());
            assert!(lock.is_held_by_current_thread());
        }
        assert!(!lock.is_locked());
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_reentrant_acquire_fails_fast() {
        let lock = lock("app");
        let _guard = lock.try_acquire(Duration::from_millis(100)).unwrap();

        let start = Instant::now();
        let err = lock.try_acquire(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, LockError::Reentrant { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_local_contention_times_out() {
        let lock = Arc::new(lock("app"));
        let _guard = lock.try_acquire(Duration::from_millis(100)).unwrap();

        let other = Arc::clone(&lock);
        let err = thread::spawn(move || other.try_acquire(Duration::from_millis(50)).unwrap_err())
            .join()
            .unwrap();
        assert!(err.is_timeout());
    }
}
