use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fdist_lock::{DistributedLock, DistributedLockGuard};
use filetime::FileTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::hash;
use crate::{CasError, FileReference, FileReferenceData, Result};

/// Prefix of in-flight write directories under the store root.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Logical path suffix that makes `add_blob` gzip the content.
const COMPRESSED_SUFFIX: &str = ".gz";

/// Content-addressed store rooted at one local directory.
///
/// Clones share the per-reference lock table, so concurrent writers of the
/// same content serialise even across clones. An optional store-wide
/// [`DistributedLock`] additionally serialises mutations across replicas.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    reference_locks: Arc<ReferenceLocks>,
    lock: Option<Arc<DistributedLock>>,
}

type ReferenceLocks = DashMap<FileReference, Arc<Mutex<()>>>;

/// Holds one reference's lock. Dropping the last holder removes the entry
/// from the table.
struct ReferenceGuard {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    reference: FileReference,
    table: Arc<ReferenceLocks>,
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // A waiter holds its own clone, so count 1 means only the table is left
        self.table
            .remove_if(&self.reference, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Summary of the store's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub blob_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub partial_writes: u64,
}

impl ContentStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            reference_locks: Arc::new(DashMap::new()),
            lock: None,
        })
    }

    /// Guard every mutation with `lock` in addition to the per-reference lock.
    pub fn with_lock(mut self, lock: Arc<DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a reference's blob lives in (whether or not it exists).
    pub fn blob_dir(&self, reference: &FileReference) -> PathBuf {
        self.root.join(reference.as_str())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a file or directory tree, returning its reference.
    ///
    /// If a blob with the same reference already exists its content is
    /// re-hashed: a match returns immediately without copying, a mismatch
    /// deletes the corrupted blob and writes it again.
    #[instrument(skip(self), fields(source = %source.as_ref().display()), level = "debug")]
    pub fn add_file<P: AsRef<Path>>(&self, source: P) -> Result<FileReference> {
        let source = source.as_ref();
        if fs::symlink_metadata(source).is_err() {
            return Err(CasError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }
        let name = entry_name(source)?;
        let hash = hash::hash_path(source)?;
        let reference = FileReference::from_hash(hash);

        self.store_entry(&reference, hash, &name, |target| {
            copy_tree(source, target)?;
            let copied = hash::hash_path(target)?;
            if copied != hash {
                return Err(CasError::IntegrityMismatch {
                    reference: reference.to_string(),
                    expected: reference.to_string(),
                    actual: format!("{:x}", copied),
                });
            }
            Ok(())
        })?;
        Ok(reference)
    }

    /// Store in-memory content under the last component of `logical_path`.
    ///
    /// A `.gz` suffix on the logical path stores the bytes gzip-compressed.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    pub fn add_blob(&self, bytes: &[u8], logical_path: &str) -> Result<FileReference> {
        let name = entry_name(Path::new(logical_path))?;
        let content = if logical_path.ends_with(COMPRESSED_SUFFIX) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bytes)?;
            encoder.finish()?
        } else {
            bytes.to_vec()
        };
        let hash = hash::hash_bytes(&content);
        let reference = FileReference::from_hash(hash);

        self.store_entry(&reference, hash, &name, |target| {
            let mut file = File::create(target)?;
            file.write_all(&content)?;
            file.sync_all()?;
            Ok(())
        })?;
        Ok(reference)
    }

    /// Publish a blob received from another controller.
    ///
    /// The payload checksum and the materialised content hash are both
    /// checked before the blob becomes visible.
    #[instrument(skip(self, data), fields(reference = %data.reference), level = "debug")]
    pub fn install(&self, data: &FileReferenceData) -> Result<PathBuf> {
        let reference = &data.reference;
        let expected = reference
            .hash_value()
            .ok_or_else(|| CasError::InvalidReference(reference.to_string()))?;
        if !data.verify_checksum() {
            return Err(CasError::IntegrityMismatch {
                reference: reference.to_string(),
                expected: format!("{:x}", data.checksum),
                actual: format!("{:x}", hash::checksum(&data.payload)),
            });
        }
        let name = entry_name(Path::new(&data.filename))?;

        self.store_entry(reference, expected, &name, |target| {
            data.materialize(target)?;
            let actual = hash::hash_path(target)?;
            if actual != expected {
                return Err(CasError::IntegrityMismatch {
                    reference: reference.to_string(),
                    expected: reference.to_string(),
                    actual: format!("{:x}", actual),
                });
            }
            Ok(())
        })?;
        Ok(self.blob_dir(reference).join(name))
    }

    fn store_entry<F>(&self, reference: &FileReference, hash: u64, name: &str, fill: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let _reference_guard = self.reference_guard(reference);
        let _store_guard = self.store_guard()?;

        if self.verify_existing(reference, hash)? {
            self.touch(reference);
            debug!(reference = %reference, "Blob already stored");
            return Ok(());
        }

        let temp = self.root.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir(&temp)?;
        let published = fill(&temp.join(name)).and_then(|()| {
            fs::rename(&temp, self.blob_dir(reference))?;
            Ok(())
        });

        if let Err(e) = published {
            if let Err(cleanup) = fs::remove_dir_all(&temp) {
                warn!(temp = %temp.display(), error = %cleanup, "Failed to remove partial write");
            }
            // Another process may have published the same content first
            if matches!(e, CasError::Io(_)) && self.verify_existing(reference, hash).unwrap_or(false) {
                debug!(reference = %reference, "Blob published concurrently");
                return Ok(());
            }
            return Err(e);
        }

        info!(reference = %reference, name = %name, "Stored blob");
        Ok(())
    }

    /// True if a well-formed blob for `reference` exists and hashes to `hash`.
    /// Anything else found at the blob path is removed.
    fn verify_existing(&self, reference: &FileReference, hash: u64) -> Result<bool> {
        let dir = self.blob_dir(reference);
        if fs::symlink_metadata(&dir).is_err() {
            return Ok(false);
        }

        let actual = match single_entry(&dir)? {
            Some(entry) => Some(hash::hash_path(&entry)?),
            None => None,
        };
        if actual == Some(hash) {
            return Ok(true);
        }

        warn!(
            reference = %reference,
            actual = ?actual.map(|h| format!("{:x}", h)),
            "Stored blob does not match its reference, rewriting"
        );
        remove_path(&dir)?;
        Ok(false)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Path of the blob's top-level entry.
    ///
    /// Refreshes the blob's last-modified time so retention sees it as used.
    pub fn get_file(&self, reference: &FileReference) -> Result<PathBuf> {
        let entry = self.entry_path(reference)?;
        self.touch(reference);
        Ok(entry)
    }

    /// Whether a well-formed blob exists. Does not refresh the blob.
    pub fn has_file(&self, reference: &FileReference) -> bool {
        self.entry_path(reference).is_ok()
    }

    /// Pack a blob for transfer to a node or another controller.
    pub fn read_for_transfer(&self, reference: &FileReference) -> Result<FileReferenceData> {
        let entry = self.get_file(reference)?;
        Ok(FileReferenceData::from_blob(reference.clone(), &entry)?)
    }

    fn entry_path(&self, reference: &FileReference) -> Result<PathBuf> {
        if reference.is_non_existing() {
            return Err(CasError::not_found(reference));
        }
        let dir = self.blob_dir(reference);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(CasError::not_found(reference)),
        }
        single_entry(&dir)?.ok_or_else(|| CasError::not_found(reference))
    }

    /// Last time the blob was written or used.
    pub fn last_modified(&self, reference: &FileReference) -> Result<SystemTime> {
        let meta = fs::metadata(self.blob_dir(reference)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CasError::not_found(reference),
            _ => CasError::Io(e),
        })?;
        Ok(meta.modified()?)
    }

    /// All reference directories under the root. In-flight writes and
    /// unrelated files are skipped.
    pub fn list_references(&self) -> Result<Vec<FileReference>> {
        let mut references = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(reference) = entry.file_name().to_str().and_then(FileReference::parse) {
                if !reference.is_non_existing() {
                    references.push(reference);
                }
            }
        }
        references.sort();
        Ok(references)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) {
                stats.partial_writes += 1;
                continue;
            }
            if FileReference::parse(&name).is_none() || !entry.file_type()?.is_dir() {
                continue;
            }
            stats.blob_count += 1;
            for file in WalkDir::new(entry.path()).min_depth(1) {
                let file = file.map_err(io::Error::from)?;
                if file.file_type().is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += file.metadata().map_err(io::Error::from)?.len();
                }
            }
        }
        Ok(stats)
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a blob unless `is_in_use` claims it.
    ///
    /// The predicate is evaluated after the locks are held, immediately
    /// before removal. Returns whether anything was deleted.
    pub fn delete<F>(&self, reference: &FileReference, is_in_use: F) -> Result<bool>
    where
        F: Fn(&FileReference) -> bool,
    {
        let _reference_guard = self.reference_guard(reference);
        let _store_guard = self.store_guard()?;

        if is_in_use(reference) {
            debug!(reference = %reference, "Not deleting, reference is in use");
            return Ok(false);
        }
        let dir = self.blob_dir(reference);
        if fs::symlink_metadata(&dir).is_err() {
            return Ok(false);
        }
        remove_path(&dir)?;
        info!(reference = %reference, "Deleted blob");
        Ok(true)
    }

    /// Remove abandoned `.tmp-*` directories older than `max_age`.
    pub fn sweep_partials(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                remove_path(&entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept partial writes");
        }
        Ok(removed)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn reference_guard(&self, reference: &FileReference) -> ReferenceGuard {
        let mutex = Arc::clone(self.reference_locks.entry(reference.clone()).or_default().value());
        ReferenceGuard {
            guard: Some(mutex.lock_arc()),
            reference: reference.clone(),
            table: Arc::clone(&self.reference_locks),
        }
    }

    fn store_guard(&self) -> Result<Option<DistributedLockGuard>> {
        Ok(self.lock.as_ref().map(|lock| lock.acquire()).transpose()?)
    }

    fn touch(&self, reference: &FileReference) {
        let dir = self.blob_dir(reference);
        if let Err(e) = filetime::set_file_mtime(&dir, FileTime::now()) {
            debug!(reference = %reference, error = %e, "Failed to refresh last-modified time");
        }
    }
}

/// Name of the top-level entry for a source path.
fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CasError::InvalidSource {
            path: path.to_path_buf(),
            reason: "path has no file name".to_string(),
        })
}

/// The only entry of a blob directory, or `None` when it is empty.
fn single_entry(dir: &Path) -> Result<Option<PathBuf>> {
    if !fs::symlink_metadata(dir)?.is_dir() {
        return Ok(None);
    }
    let mut entries = fs::read_dir(dir)?;
    match entries.next() {
        Some(entry) => Ok(Some(entry?.path())),
        None => Ok(None),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    if !fs::metadata(source)?.is_dir() {
        fs::copy(source, target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).map_err(io::Error::other)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(source)?, dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path().join("files")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_reference_locks_released() {
        let (_temp, store) = store();
        let reference = store.add_blob(b"short-lived", "a.txt").unwrap();
        assert!(store.reference_locks.is_empty());

        {
            let _held = store.reference_guard(&reference);
            assert_eq!(store.reference_locks.len(), 1);
        }
        assert!(store.delete(&reference, |_| false).unwrap());
        assert!(store.reference_locks.is_empty());
    }

    #[test]
    fn test_add_blob_layout() {
        let (_temp, store) = store();
        let reference = store.add_blob(b"hello", "blob/greeting.txt").unwrap();

        assert_eq!(reference, FileReference::from_hash(hash::hash_bytes(b"hello")));
        let entry = store.get_file(&reference).unwrap();
        assert_eq!(entry, store.blob_dir(&reference).join("greeting.txt"));
        assert_eq!(fs::read(entry).unwrap(), b"hello");
        assert_eq!(fs::read_dir(store.blob_dir(&reference)).unwrap().count(), 1);
    }

    #[test]
    fn test_add_blob_compresses_gz_suffix() {
        let (_temp, store) = store();
        let plain = store.add_blob(b"payload", "blob/data.json").unwrap();
        let packed = store.add_blob(b"payload", "blob/data.json.gz").unwrap();
        assert_ne!(plain, packed);

        let stored = fs::read(store.get_file(&packed).unwrap()).unwrap();
        let mut decoded = String::new();
        use std::io::Read;
        flate2::read::GzDecoder::new(stored.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "payload");
    }

    #[test]
    fn test_get_file_rejects_malformed_blob_dirs() {
        let (_temp, store) = store();
        let empty = FileReference::from_hash(1);
        fs::create_dir(store.blob_dir(&empty)).unwrap();
        assert!(matches!(store.get_file(&empty), Err(CasError::NotFound { .. })));

        let plain_file = FileReference::from_hash(2);
        fs::write(store.blob_dir(&plain_file), "x").unwrap();
        assert!(matches!(store.get_file(&plain_file), Err(CasError::NotFound { .. })));

        assert!(matches!(
            store.get_file(&FileReference::from_hash(3)),
            Err(CasError::NotFound { .. })
        ));
        assert!(!store.has_file(&FileReference::non_existing()));
    }

    #[test]
    fn test_missing_source() {
        let (temp, store) = store();
        let err = store.add_file(temp.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, CasError::SourceNotFound { .. }));
    }

    #[test]
    fn test_list_references_skips_partials() {
        let (_temp, store) = store();
        let reference = store.add_blob(b"a", "a").unwrap();
        fs::create_dir(store.root().join(format!("{}leftover", TEMP_PREFIX))).unwrap();
        fs::write(store.root().join("stray.txt"), "x").unwrap();

        assert_eq!(store.list_references().unwrap(), vec![reference]);
        let stats = store.stats().unwrap();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.total_bytes, 1);
        assert_eq!(stats.partial_writes, 1);
    }

    #[test]
    fn test_delete_honours_liveness() {
        let (_temp, store) = store();
        let reference = store.add_blob(b"keep me", "k").unwrap();

        assert!(!store.delete(&reference, |_| true).unwrap());
        assert!(store.has_file(&reference));

        assert!(store.delete(&reference, |_| false).unwrap());
        assert!(!store.has_file(&reference));
        assert!(!store.delete(&reference, |_| false).unwrap());
    }

    #[test]
    fn test_sweep_partials_respects_age() {
        let (_temp, store) = store();
        let partial = store.root().join(format!("{}abc", TEMP_PREFIX));
        fs::create_dir(&partial).unwrap();

        assert_eq!(store.sweep_partials(Duration::from_secs(3600)).unwrap(), 0);
        filetime::set_file_mtime(&partial, FileTime::from_unix_time(0, 0)).unwrap();
        assert_eq!(store.sweep_partials(Duration::from_secs(3600)).unwrap(), 1);
        assert!(!partial.exists());
    }
}
