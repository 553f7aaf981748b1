use std::time::Duration;

use fdist_cas::{ContentStore, FileReference, FileReferenceData};
use fdist_config::{log_maint_debug, log_maint_info, log_maint_warn};
use fdist_ipc::client::FileClient;
use fdist_ipc::IpcError;
use fdist_registry::ActiveApplications;
use tokio::runtime::Handle;

use super::Maintainer;
use crate::Result;

/// Outcome of one re-download pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedownloadReport {
    /// Active applications whose package is not in the local store
    pub missing: usize,
    pub restored: Vec<FileReference>,
    pub failed: usize,
}

/// Fetches the packages of active applications that are missing locally
/// from peer controller replicas.
///
/// Runs on a plain thread; network calls are driven on `runtime`.
pub struct PackageRedownloader {
    store: ContentStore,
    applications: ActiveApplications,
    peers: Vec<(String, u16)>,
    timeout: Duration,
    runtime: Handle,
}

impl PackageRedownloader {
    pub fn new(
        store: ContentStore,
        applications: ActiveApplications,
        peers: Vec<(String, u16)>,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            applications,
            peers,
            timeout,
            runtime,
        }
    }

    pub fn redownload_missing(&self) -> Result<RedownloadReport> {
        let index = self.applications.load()?;
        let mut report = RedownloadReport::default();

        for (app_id, entry) in index.active_applications() {
            let package = match &entry.package {
                Some(package) if !package.is_non_existing() => package,
                _ => continue,
            };
            if self.store.has_file(package) {
                continue;
            }
            report.missing += 1;
            log_maint_info!("Application package missing locally", app = %app_id, reference = %package);

            match self.fetch_from_peers(package) {
                Some(data) => match self.store.install(&data) {
                    Ok(_) => report.restored.push(package.clone()),
                    Err(e) => {
                        log_maint_warn!("Failed to install package", reference = %package, error = %e);
                        report.failed += 1;
                    }
                },
                None => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// First peer that has the file and delivers it intact.
    fn fetch_from_peers(&self, reference: &FileReference) -> Option<FileReferenceData> {
        for (host, port) in &self.peers {
            let port = *port;
            match self.runtime.block_on(fetch(host, port, reference, self.timeout)) {
                Ok(data) => return Some(data),
                Err(e) => {
                    log_maint_debug!("Peer could not provide package", peer = %host, port, error = %e)
                }
            }
        }
        log_maint_warn!("No peer could provide package", reference = %reference);
        None
    }
}

async fn fetch(
    host: &str,
    port: u16,
    reference: &FileReference,
    timeout: Duration,
) -> fdist_ipc::Result<FileReferenceData> {
    let mut client = FileClient::connect(host, port, timeout).await?;
    if !client.has_file(reference).await? {
        return Err(IpcError::NotFound {
            reference: reference.to_string(),
        });
    }
    client.receive_file(reference).await
}

impl Maintainer for PackageRedownloader {
    fn name(&self) -> &'static str {
        "redownload"
    }

    fn run_once(&mut self) {
        match self.redownload_missing() {
            Ok(report) if report.missing > 0 => log_maint_info!(
                "Re-download run finished",
                missing = report.missing,
                restored = report.restored.len(),
                failed = report.failed
            ),
            Ok(_) => {}
            Err(e) => log_maint_warn!("Re-download run failed", error = %e),
        }
    }
}
