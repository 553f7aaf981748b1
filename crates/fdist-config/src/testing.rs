//! Throwaway controller layouts for tests.
//!
//! A [`TestEnvironment`] owns one temp directory holding `files/` (store
//! root), `state/` (snapshots, application index, locks) and `app/` (the
//! directory registered paths are relative to). Everything is removed when it
//! is dropped.
//!
//! ```ignore
//! use fdist_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let file = env.create_file("models/m.bin", b"weights").unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub struct TestEnvironment {
    _temp_dir: TempDir,
    /// Blob store root
    pub store_root: PathBuf,
    /// Snapshots, application index and locks
    pub state_dir: PathBuf,
    /// Application package directory files are registered from
    pub app_dir: PathBuf,
    /// Distinct per environment created in this process
    pub test_id: u32,
}

impl TestEnvironment {
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let store_root = root.join("files");
        let state_dir = root.join("state");
        let app_dir = root.join("app");

        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&state_dir)?;
        std::fs::create_dir_all(&app_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            state_dir,
            app_dir,
            test_id,
        })
    }

    /// Directory for coordination lock files
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Same location the binaries use for `app_id`'s snapshot
    pub fn snapshot_path(&self, app_id: &str) -> PathBuf {
        self.config().snapshot_path(app_id)
    }

    /// Write `content` to `app/<relative_path>`, creating parents.
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.app_dir.join(relative_path);
        std::fs::create_dir_all(path.parent().unwrap_or(&self.app_dir))?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a directory under the application directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.app_dir.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// A config pointing at this environment's paths.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.store_root.clone();
        cfg.storage.state_dir = self.state_dir.clone();
        cfg.lock.lock_dir = Some(self.lock_dir());
        cfg.server.bind = "127.0.0.1".to_string();
        cfg.server.port = 0;
        cfg
    }
}
