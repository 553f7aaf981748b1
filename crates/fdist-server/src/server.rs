use std::future::Future;
use std::sync::Arc;

use fdist_cas::{CasError, ContentStore, FileReference};
use fdist_config::{log_server_debug, log_server_error, log_server_info, log_server_warn};
use fdist_ipc::{frame_len, read_frame, write_frame, FileReply, FileRequest, FileResponse, FileStatus, IpcError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::Result;

/// Receives the references announced by a `StartDownload` request.
pub trait DownloadListener: Send + Sync {
    fn on_start_download(&self, references: Vec<FileReference>);
}

/// Serves blobs from a [`ContentStore`] over TCP.
///
/// Blob reads run on tokio's blocking pool, at most `workers` at a time, so
/// one slow disk read cannot stall the accept loop or other connections.
pub struct FileServer {
    store: ContentStore,
    workers: Arc<Semaphore>,
    max_frame_bytes: usize,
    download_listener: Option<Arc<dyn DownloadListener>>,
}

impl FileServer {
    pub fn new(store: ContentStore, workers: usize) -> Self {
        Self {
            store,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            max_frame_bytes: fdist_ipc::DEFAULT_MAX_FRAME_BYTES,
            download_listener: None,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_download_listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.download_listener = Some(listener);
        self
    }

    /// Accept connections until `shutdown` completes.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        log_server_info!("File server listening", addr = %addr);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log_server_debug!("Accepted connection", peer = %peer);
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(e) => log_server_error!("Accept failed", error = %e),
                },
                _ = &mut shutdown => {
                    log_server_info!("File server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        loop {
            let request = match read_frame::<_, FileRequest>(&mut stream, self.max_frame_bytes).await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(IpcError::Codec(e)) => {
                    // The frame was consumed whole, so the connection is still in sync
                    let response = FileResponse::Error(format!("Invalid request: {}", e));
                    if write_frame(&mut stream, &response).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    log_server_warn!("Dropping connection", error = %e);
                    return;
                }
            };

            let response = self.handle_request(request).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                log_server_debug!("Failed to send reply", error = %e);
                return;
            }
        }
    }

    pub async fn handle_request(&self, request: FileRequest) -> FileResponse {
        match request {
            FileRequest::Ping => FileResponse::Pong {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            FileRequest::HasFile { reference } => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.has_file(&reference)).await {
                    Ok(present) => FileResponse::HasFileAck { present },
                    Err(e) => FileResponse::Error(format!("hasFile failed: {}", e)),
                }
            }
            FileRequest::ReceiveFile { reference } => {
                let reply = self.receive_file(reference).await;
                FileResponse::File(self.fit_frame(reply))
            }
            FileRequest::StartDownload { references } => {
                log_server_debug!("Download announced", count = references.len());
                if let Some(listener) = &self.download_listener {
                    listener.on_start_download(references);
                }
                FileResponse::DownloadAck
            }
        }
    }

    /// Replace a reply the peer could not accept with a failure reply.
    fn fit_frame(&self, reply: FileReply) -> FileReply {
        let size = match frame_len(&reply) {
            Ok(size) => size,
            Err(e) => return FileReply::failure(reply.reference, FileStatus::InternalError, e.to_string()),
        };
        if size <= self.max_frame_bytes {
            return reply;
        }
        log_server_warn!(
            "File too large to send",
            reference = %reply.reference,
            bytes = size,
            limit = self.max_frame_bytes
        );
        let error = format!(
            "{} is too large to send ({} bytes, limit {})",
            reply.reference, size, self.max_frame_bytes
        );
        FileReply::failure(reply.reference, FileStatus::InternalError, error)
    }

    async fn receive_file(&self, reference: FileReference) -> FileReply {
        let _permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return FileReply::failure(reference, FileStatus::InternalError, "server is shutting down")
            }
        };

        let store = self.store.clone();
        let target = reference.clone();
        let read = tokio::task::spawn_blocking(move || store.read_for_transfer(&target)).await;
        match read {
            Ok(Ok(data)) => {
                log_server_info!(
                    "Serving file",
                    reference = %reference,
                    filename = %data.filename,
                    bytes = data.payload.len()
                );
                FileReply::ok(data)
            }
            Ok(Err(CasError::NotFound { .. })) => {
                log_server_info!("Requested file not found", reference = %reference);
                FileReply::failure(reference.clone(), FileStatus::NotFound, format!("{} not found", reference))
            }
            Ok(Err(e)) => {
                log_server_warn!("Failed to read file", reference = %reference, error = %e);
                FileReply::failure(reference, FileStatus::InternalError, e.to_string())
            }
            Err(e) => FileReply::failure(reference, FileStatus::InternalError, e.to_string()),
        }
    }
}
