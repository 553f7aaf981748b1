//! Cross-host lock backends.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};

use crate::{LockError, Result};

/// Poll interval for backends that cannot block with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Source of cross-host leases.
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Take the lease for `scope`, waiting at most `timeout`.
    fn acquire(&self, scope: &str, timeout: Duration) -> Result<Box<dyn RemoteLease>>;
}

/// A held cross-host lease.
pub trait RemoteLease: Send {
    fn release(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// In-memory coordinator
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Coordinator backed by process memory.
///
/// Every `DistributedLock` sharing one `MemoryCoordinator` behaves like a
/// separate replica talking to the same coordination service. Used for
/// single-host deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<MemoryState>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any holder currently owns `scope`.
    pub fn is_held(&self, scope: &str) -> bool {
        self.state.held.lock().contains(scope)
    }
}

impl Coordinator for MemoryCoordinator {
    fn acquire(&self, scope: &str, timeout: Duration) -> Result<Box<dyn RemoteLease>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.state.held.lock();
        while held.contains(scope) {
            if self.state.released.wait_until(&mut held, deadline).timed_out() && held.contains(scope) {
                return Err(LockError::Timeout {
                    scope: scope.to_string(),
                    waited: timeout,
                });
            }
        }
        held.insert(scope.to_string());
        Ok(Box::new(MemoryLease {
            scope: scope.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryLease {
    scope: String,
    state: Arc<MemoryState>,
}

impl RemoteLease for MemoryLease {
    fn release(self: Box<Self>) -> Result<()> {
        self.state.held.lock().remove(&self.scope);
        self.state.released.notify_all();
        Ok(())
    }
}

// ============================================================================
// File coordinator
// ============================================================================

/// Coordinator backed by `flock` on files in a shared directory.
///
/// Replicas that mount the same directory exclude each other; each scope maps
/// to `<dir>/<escaped scope>.lock`.
#[derive(Debug, Clone)]
pub struct FileCoordinator {
    dir: PathBuf,
}

impl FileCoordinator {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Alphanumerics and `-` are kept; every other byte becomes `_xx`, so
    /// distinct scopes never share a file.
    fn lock_path(&self, scope: &str) -> PathBuf {
        let mut name = String::with_capacity(scope.len());
        for byte in scope.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.lock", name))
    }
}

impl Coordinator for FileCoordinator {
    fn acquire(&self, scope: &str, timeout: Duration) -> Result<Box<dyn RemoteLease>> {
        let path = self.lock_path(scope);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Box::new(FileLease { file })),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(LockError::Timeout {
                            scope: scope.to_string(),
                            waited: start.elapsed(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
                }
                Err(e) => {
                    return Err(LockError::Coordination {
                        scope: scope.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

struct FileLease {
    file: File,
}

impl RemoteLease for FileLease {
    fn release(self: Box<Self>) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}
