use std::time::Duration;

use fdist_cas::FileReference;
use fdist_config::{log_notify_debug, log_notify_warn};
use fdist_ipc::client::FileClient;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Tells nodes which references they should fetch.
///
/// Notifications are advisory and sent at most once. Failures are logged and
/// dropped; a node that misses one still pulls the files when it needs them.
#[derive(Debug, Clone)]
pub struct DistributionNotifier {
    timeout: Duration,
    runtime: Handle,
}

impl DistributionNotifier {
    /// Background notifications run on `runtime`.
    pub fn new(timeout: Duration, runtime: Handle) -> Self {
        Self { timeout, runtime }
    }

    /// Send `StartDownload` to `host:port` in the background.
    ///
    /// Callable from any thread. The returned handle only resolves when the
    /// attempt is over; nothing needs to await it.
    pub fn start_download(
        &self,
        host: &str,
        port: u16,
        references: Vec<FileReference>,
    ) -> JoinHandle<()> {
        let notifier = self.clone();
        let host = host.to_string();
        self.runtime.spawn(async move {
            let count = references.len();
            match notifier.notify(&host, port, references).await {
                Ok(()) => log_notify_debug!("Download started", host = %host, port, count),
                Err(e) if e.is_timeout() => {
                    log_notify_warn!("Download notification timed out", host = %host, port, error = %e)
                }
                Err(e) => log_notify_warn!("Download notification failed", host = %host, port, error = %e),
            }
        })
    }

    /// [`start_download`](Self::start_download) for every target.
    pub fn notify_all(
        &self,
        targets: &[(String, u16)],
        references: &[FileReference],
    ) -> Vec<JoinHandle<()>> {
        targets
            .iter()
            .map(|(host, port)| self.start_download(host, *port, references.to_vec()))
            .collect()
    }

    /// One notification, waiting for the acknowledgement.
    pub async fn notify(
        &self,
        host: &str,
        port: u16,
        references: Vec<FileReference>,
    ) -> fdist_ipc::Result<()> {
        let mut client = FileClient::connect(host, port, self.timeout).await?;
        client.start_download(references).await
    }
}
