//! # fdist-cas
//!
//! Content-addressed store for distributed application files.
//!
//! Every distinct file or directory tree is stored once, under a directory
//! named by its [`FileReference`] (a 64-bit XXH64 content hash in lowercase
//! hex):
//!
//! ```text
//! <root>/
//! ├── 3f1c9a27b0e4d6c2/
//! │   └── model.bin            # exactly one top-level entry
//! ├── a9e0f4417d3b20c5/
//! │   └── schemas/             # or a whole directory tree
//! │       └── ...
//! └── .tmp-5b2e.../            # in-flight write, never a valid reference
//! ```
//!
//! Writes materialise content in a `.tmp-*` sibling directory and publish it
//! with a single `rename`; nothing is visible under a reference until that
//! rename has succeeded. A blob directory is never modified in place after
//! publication, only re-verified or deleted.

pub mod hash;
mod reference;
mod store;
mod transfer;

pub use reference::FileReference;
pub use store::{ContentStore, StoreStats, TEMP_PREFIX};
pub use transfer::{FileReferenceData, PayloadKind};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("File reference not found: {reference}")]
    NotFound { reference: String },

    #[error("Source path does not exist: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Integrity mismatch for {reference}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid file reference: {0:?}")]
    InvalidReference(String),

    #[error("Invalid source {}: {reason}", path.display())]
    InvalidSource { path: PathBuf, reason: String },

    #[error("Lock error: {0}")]
    Lock(#[from] fdist_lock::LockError),
}

impl CasError {
    pub(crate) fn not_found(reference: &FileReference) -> Self {
        CasError::NotFound {
            reference: reference.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CasError>;
