//! # fdist-registry
//!
//! Maps the logical names an application package is built from (relative
//! paths, URIs, in-memory blob names) to [`FileReference`]s in a
//! [`ContentStore`](fdist_cas::ContentStore).
//!
//! - [`FileRegistry`]: per-package cache in front of the store
//! - [`RegistrySnapshot`]: the persisted `hostname` + `name<TAB>reference` file
//! - [`ApplicationIndex`]: which packages are active, and therefore which
//!   references must survive garbage collection

mod applications;
mod fetch;
mod registry;
mod snapshot;

pub use applications::{
    ActiveApplications, ApplicationEntry, ApplicationIndex, ApplicationStatus, ReferenceUsage,
};
pub use fetch::{HttpFetcher, UriFetcher};
pub use registry::FileRegistry;
pub use snapshot::RegistrySnapshot;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use fdist_cas::CasError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] CasError),

    #[error("Unsupported registration: {0}")]
    Unsupported(String),

    #[error("Download of {uri} failed: {reason}")]
    Download { uri: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid snapshot line {line}: {reason}")]
    InvalidSnapshot { line: usize, reason: String },

    #[error("Invalid logical name {0:?}")]
    InvalidName(String),

    #[error("Application index error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Snapshot for application {app_id} is unreadable: {reason}")]
    MissingSnapshot { app_id: String, reason: String },
}

impl RegistryError {
    /// True when the failure only means someone else holds a lock.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            RegistryError::LockTimeout { .. } => true,
            RegistryError::Store(CasError::Lock(e)) => e.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
