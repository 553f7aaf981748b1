//! # Application index
//!
//! Tracks the application packages a controller currently serves, and where
//! each package's registry snapshot lives. The union of the active packages'
//! references is the liveness set that retention must never delete from.
//!
//! The index is `applications.json` in the state directory. Writers hold an
//! `flock` on a sibling lock file and replace the JSON through a temp file;
//! removed applications stay listed until pruned.

use chrono::{DateTime, Utc};
use fdist_cas::FileReference;
use fdist_config::path::normalize_or_original;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{RegistryError, RegistrySnapshot, Result};

/// Index format version
const INDEX_VERSION: u32 = 1;

const INDEX_FILE: &str = "applications.json";
const LOCK_FILE: &str = ".applications.lock";

/// Status of a registered application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    /// Files of this application must be kept
    Active,
    /// Application was undeployed; its files no longer count as used
    Removed,
}

/// Entry for a registered application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEntry {
    /// Registry snapshot listing the application's files
    pub snapshot_path: PathBuf,
    /// Reference of the packaged application, if it is distributed as one blob
    pub package: Option<FileReference>,
    /// When this application was first registered
    pub registered_at: DateTime<Utc>,
    /// Last time the entry was (re)registered
    pub last_verified: DateTime<Utc>,
    pub status: ApplicationStatus,
}

/// All applications known to this controller, keyed by application id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationIndex {
    /// Format version for compatibility
    pub version: u32,
    pub applications: BTreeMap<String, ApplicationEntry>,
}

impl Default for ApplicationIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationIndex {
    pub fn new() -> Self {
        Self {
            version: INDEX_VERSION,
            applications: BTreeMap::new(),
        }
    }

    /// Index file path: `<state_dir>/applications.json`
    pub fn index_path(state_dir: &Path) -> PathBuf {
        state_dir.join(INDEX_FILE)
    }

    /// Acquire an exclusive lock on the index in `state_dir`.
    ///
    /// The lock is held until the returned `File` is dropped.
    pub fn acquire_lock(state_dir: &Path, timeout: Duration) -> Result<File> {
        fs::create_dir_all(state_dir)?;
        let lock_path = state_dir.join(LOCK_FILE);
        let lock_file = File::create(&lock_path)?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= timeout {
                        return Err(RegistryError::LockTimeout {
                            path: lock_path,
                            waited: start.elapsed(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load the index from `state_dir`, or an empty one if none exists
    pub fn load_or_create(state_dir: &Path) -> Result<Self> {
        let path = Self::index_path(state_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Save to `state_dir` using the atomic write-rename pattern
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        let path = Self::index_path(state_dir);
        let tmp_path = path.with_extension("json.tmp");

        let file = File::create(&tmp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(&file), self)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Register or refresh an application.
    ///
    /// Returns `true` if the application was not known before.
    pub fn register(
        &mut self,
        app_id: &str,
        snapshot_path: &Path,
        package: Option<FileReference>,
    ) -> bool {
        let now = Utc::now();
        let snapshot_path = normalize_or_original(snapshot_path);
        match self.applications.get_mut(app_id) {
            Some(entry) => {
                entry.snapshot_path = snapshot_path;
                entry.package = package;
                entry.last_verified = now;
                entry.status = ApplicationStatus::Active;
                false
            }
            None => {
                self.applications.insert(
                    app_id.to_string(),
                    ApplicationEntry {
                        snapshot_path,
                        package,
                        registered_at: now,
                        last_verified: now,
                        status: ApplicationStatus::Active,
                    },
                );
                true
            }
        }
    }

    /// Mark an application removed. Returns `false` if it was unknown.
    pub fn remove(&mut self, app_id: &str) -> bool {
        match self.applications.get_mut(app_id) {
            Some(entry) => {
                entry.status = ApplicationStatus::Removed;
                true
            }
            None => false,
        }
    }

    /// Drop removed entries. Returns the number dropped.
    pub fn prune_removed(&mut self) -> usize {
        let before = self.applications.len();
        self.applications
            .retain(|_, entry| entry.status != ApplicationStatus::Removed);
        before - self.applications.len()
    }

    pub fn active_applications(&self) -> Vec<(&String, &ApplicationEntry)> {
        self.applications
            .iter()
            .filter(|(_, e)| e.status == ApplicationStatus::Active)
            .collect()
    }

    /// Every reference an active application depends on.
    ///
    /// An unreadable snapshot fails the whole call: a partial set would let
    /// retention delete files that are still needed.
    pub fn references_in_use(&self) -> Result<HashSet<FileReference>> {
        let mut references = HashSet::new();
        for (app_id, entry) in self.active_applications() {
            let snapshot = RegistrySnapshot::read(&entry.snapshot_path).map_err(|e| {
                RegistryError::MissingSnapshot {
                    app_id: app_id.clone(),
                    reason: e.to_string(),
                }
            })?;
            references.extend(snapshot.references().cloned());
            references.extend(entry.package.iter().cloned());
        }
        references.remove(&FileReference::non_existing());
        Ok(references)
    }
}

/// Source of the liveness set consulted before a reference is deleted.
pub trait ReferenceUsage: Send + Sync {
    fn references_in_use(&self) -> Result<HashSet<FileReference>>;

    /// Whether `reference` is needed right now. Errors count as "in use".
    fn is_in_use(&self, reference: &FileReference) -> bool {
        self.references_in_use()
            .map(|set| set.contains(reference))
            .unwrap_or(true)
    }
}

/// [`ReferenceUsage`] backed by the application index in a state directory,
/// re-read under the index lock on every call.
#[derive(Debug, Clone)]
pub struct ActiveApplications {
    state_dir: PathBuf,
    lock_timeout: Duration,
}

impl ActiveApplications {
    pub fn new(state_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock_timeout,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// A consistent copy of the index.
    pub fn load(&self) -> Result<ApplicationIndex> {
        let _lock = ApplicationIndex::acquire_lock(&self.state_dir, self.lock_timeout)?;
        ApplicationIndex::load_or_create(&self.state_dir)
    }
}

impl ReferenceUsage for ActiveApplications {
    fn references_in_use(&self) -> Result<HashSet<FileReference>> {
        self.load()?.references_in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reference(value: &str) -> FileReference {
        FileReference::parse(value).unwrap()
    }

    fn write_snapshot(dir: &Path, name: &str, refs: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let entries = refs
            .iter()
            .enumerate()
            .map(|(i, r)| (format!("f{}", i), reference(r)))
            .collect();
        RegistrySnapshot::new("cfg1", entries).write(&path).unwrap();
        path
    }

    #[test]
    fn test_index_new() {
        let index = ApplicationIndex::new();
        assert_eq!(index.version, INDEX_VERSION);
        assert!(index.applications.is_empty());
    }

    #[test]
    fn test_index_save_load() {
        let temp = TempDir::new().unwrap();
        let snapshot = write_snapshot(temp.path(), "app.txt", &["1a"]);

        let mut index = ApplicationIndex::new();
        assert!(index.register("tenant.app", &snapshot, Some(reference("2b"))));
        index.save(temp.path()).unwrap();

        let loaded = ApplicationIndex::load_or_create(temp.path()).unwrap();
        assert_eq!(loaded.applications.len(), 1);
        assert_eq!(loaded.applications["tenant.app"].package, Some(reference("2b")));
        assert!(!temp.path().join("applications.json.tmp").exists());
    }

    #[test]
    fn test_duplicate_registration_refreshes() {
        let temp = TempDir::new().unwrap();
        let snapshot = write_snapshot(temp.path(), "app.txt", &["1a"]);

        let mut index = ApplicationIndex::new();
        assert!(index.register("app", &snapshot, None));
        index.remove("app");
        assert!(!index.register("app", &snapshot, None));
        assert_eq!(index.applications.len(), 1);
        assert_eq!(index.applications["app"].status, ApplicationStatus::Active);
    }

    #[test]
    fn test_references_in_use_ignores_removed() {
        let temp = TempDir::new().unwrap();
        let one = write_snapshot(temp.path(), "one.txt", &["1a", "1b"]);
        let two = write_snapshot(temp.path(), "two.txt", &["2a"]);

        let mut index = ApplicationIndex::new();
        index.register("one", &one, Some(reference("1c")));
        index.register("two", &two, None);
        index.remove("two");

        let used = index.references_in_use().unwrap();
        assert_eq!(
            used,
            [reference("1a"), reference("1b"), reference("1c")].into_iter().collect()
        );

        assert_eq!(index.prune_removed(), 1);
        assert_eq!(index.active_applications().len(), 1);
    }

    #[test]
    fn test_missing_snapshot_fails_liveness() {
        let temp = TempDir::new().unwrap();
        let mut index = ApplicationIndex::new();
        index.register("ghost", &temp.path().join("absent.txt"), None);
        assert!(matches!(
            index.references_in_use(),
            Err(RegistryError::MissingSnapshot { .. })
        ));
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let temp = TempDir::new().unwrap();
        let _held = ApplicationIndex::acquire_lock(temp.path(), Duration::from_secs(1)).unwrap();
        let err = ApplicationIndex::acquire_lock(temp.path(), Duration::from_millis(100)).unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_usage_treats_errors_as_in_use() {
        let temp = TempDir::new().unwrap();
        let mut index = ApplicationIndex::new();
        index.register("ghost", &temp.path().join("absent.txt"), None);
        index.save(temp.path()).unwrap();

        let usage = ActiveApplications::new(temp.path(), Duration::from_secs(1));
        assert!(usage.is_in_use(&reference("ff")));
    }
}
