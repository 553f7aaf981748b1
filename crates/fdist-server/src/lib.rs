//! # fdist-server
//!
//! The controller side of file distribution.
//!
//! - [`FileServer`]: answers `HasFile` / `ReceiveFile` from nodes, reading
//!   blobs on a bounded pool of blocking workers
//! - [`DistributionNotifier`]: fire-and-forget "start downloading" pushes
//! - [`maintenance`]: retention of unused files, re-download of missing
//!   application packages, and the periodic job runner driving both

pub mod maintenance;
pub mod notifier;
pub mod server;

pub use notifier::DistributionNotifier;
pub use server::{DownloadListener, FileServer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] fdist_cas::CasError),

    #[error(transparent)]
    Registry(#[from] fdist_registry::RegistryError),

    #[error(transparent)]
    Ipc(#[from] fdist_ipc::IpcError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
