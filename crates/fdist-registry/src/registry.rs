use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fdist_cas::{hash, CasError, ContentStore, FileReference};
use fdist_config::{log_registry_debug, log_registry_info, log_registry_warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::fetch::{self, HttpFetcher, UriFetcher};
use crate::{RegistryError, RegistrySnapshot, Result};

/// Per-application-package cache from logical names to file references.
///
/// A name is registered with the store once; later requests for the same
/// name return the cached reference without touching the filesystem. The
/// cache is independent of the store's own deduplication: two names with
/// identical content are two entries with the same reference.
///
/// Registrations are serialised on an internal mutex, so one registry can be
/// shared by several builder threads.
#[derive(Debug)]
pub struct FileRegistry {
    store: ContentStore,
    app_dir: PathBuf,
    scratch_dir: PathBuf,
    entries: Mutex<BTreeMap<String, FileReference>>,
    lenient: bool,
    hosted: bool,
    fetcher: Arc<dyn UriFetcher>,
}

impl FileRegistry {
    /// Registry resolving relative paths against `app_dir`.
    pub fn new(store: ContentStore, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            app_dir: app_dir.into(),
            scratch_dir: std::env::temp_dir().join("fdist-downloads"),
            entries: Mutex::new(BTreeMap::new()),
            lenient: false,
            hosted: false,
            fetcher: Arc::new(HttpFetcher::default()),
        }
    }

    /// Rebuild a registry from a persisted snapshot without touching the store.
    ///
    /// The result is lenient: registering a path whose source no longer
    /// exists yields [`FileReference::non_existing`] instead of an error.
    pub fn from_snapshot(
        store: ContentStore,
        app_dir: impl Into<PathBuf>,
        snapshot: RegistrySnapshot,
    ) -> Self {
        let mut registry = Self::new(store, app_dir);
        registry.entries = Mutex::new(snapshot.entries.into_iter().collect());
        registry.lenient = true;
        registry
    }

    /// [`from_snapshot`](Self::from_snapshot) reading the snapshot file at `path`.
    pub fn load(store: ContentStore, app_dir: impl Into<PathBuf>, path: &Path) -> Result<Self> {
        let snapshot = RegistrySnapshot::read(path)?;
        log_registry_debug!(
            "Restored registry",
            path = %path.display(),
            source_host = %snapshot.hostname,
            entries = snapshot.entries.len()
        );
        Ok(Self::from_snapshot(store, app_dir, snapshot))
    }

    /// Refuse URI registrations (hosted deployments).
    pub fn hosted(mut self, hosted: bool) -> Self {
        self.hosted = hosted;
        self
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn UriFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Directory URI downloads are staged in before being stored.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    /// Register the file or directory at `relative_path` under the application directory.
    pub fn add_file(&self, relative_path: &str) -> Result<FileReference> {
        validate_name(relative_path)?;
        let mut entries = self.entries.lock();
        if let Some(reference) = entries.get(relative_path) {
            return Ok(reference.clone());
        }

        let source = fdist_config::path::resolve_within(&self.app_dir, relative_path)
            .map_err(|_| RegistryError::InvalidName(relative_path.to_string()))?;
        let reference = match self.store.add_file(&source) {
            Ok(reference) => reference,
            Err(CasError::SourceNotFound { path }) if self.lenient => {
                log_registry_warn!(
                    "Source missing, using placeholder reference",
                    path = %path.display()
                );
                return Ok(FileReference::non_existing());
            }
            Err(e) => return Err(e.into()),
        };

        log_registry_info!("Registered file", name = relative_path, reference = %reference);
        entries.insert(relative_path.to_string(), reference.clone());
        Ok(reference)
    }

    /// Download `uri` and register its content, keyed by the URI itself.
    ///
    /// Only `http` and `https` are accepted, and hosted registries refuse
    /// URIs altogether. A cached URI is never downloaded again.
    pub fn add_uri(&self, uri: &str) -> Result<FileReference> {
        validate_name(uri)?;
        if self.hosted {
            return Err(RegistryError::Unsupported(format!(
                "URI registration is disabled in hosted mode: {}",
                uri
            )));
        }
        match fetch::scheme(uri).as_deref() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(RegistryError::Unsupported(format!(
                    "only http and https URIs can be registered: {}",
                    uri
                )))
            }
        }

        let mut entries = self.entries.lock();
        if let Some(reference) = entries.get(uri) {
            return Ok(reference.clone());
        }

        // Unique per attempt: other processes may share the scratch directory
        let staging = self.scratch_dir.join(format!(
            "{:x}-{}",
            hash::hash_bytes(uri.as_bytes()),
            Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&staging)?;

        let target = staging.join(fetch::download_name(uri));
        let stored = self
            .fetcher
            .fetch(uri, &target)
            .and_then(|()| Ok(self.store.add_file(&target)?));
        if let Err(e) = fs::remove_dir_all(&staging) {
            log_registry_debug!("Failed to remove download staging", error = %e);
        }
        let reference = stored?;

        log_registry_info!("Registered URI", uri = uri, reference = %reference);
        entries.insert(uri.to_string(), reference.clone());
        Ok(reference)
    }

    /// Register in-memory content under `name`.
    pub fn add_blob(&self, name: &str, bytes: &[u8]) -> Result<FileReference> {
        validate_name(name)?;
        let mut entries = self.entries.lock();
        if let Some(reference) = entries.get(name) {
            return Ok(reference.clone());
        }

        let reference = self.store.add_blob(bytes, name)?;
        log_registry_info!("Registered blob", name = name, reference = %reference);
        entries.insert(name.to_string(), reference.clone());
        Ok(reference)
    }

    /// All entries, sorted by logical name.
    pub fn export(&self) -> Vec<(String, FileReference)> {
        self.entries
            .lock()
            .iter()
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect()
    }

    /// Distinct references of all entries.
    pub fn references(&self) -> BTreeSet<FileReference> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn snapshot(&self, hostname: impl Into<String>) -> RegistrySnapshot {
        RegistrySnapshot::new(hostname, self.export())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Names end up as lines of a tab-separated snapshot.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['\t', '\n', '\r']) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
