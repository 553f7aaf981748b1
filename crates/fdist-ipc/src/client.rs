//! Client for a controller's file server.

use std::future::Future;
use std::time::Duration;

use fdist_cas::{FileReference, FileReferenceData};
use tokio::net::TcpStream;
use tracing::debug;

use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use crate::{FileRequest, FileResponse, IpcError, Result};

/// One connection to a file server. Every call is bounded by `timeout`.
///
/// A transport or framing failure leaves unread bytes on the stream, so the
/// client refuses further requests after one and must be reconnected.
#[derive(Debug)]
pub struct FileClient {
    stream: TcpStream,
    addr: String,
    timeout: Duration,
    max_frame_bytes: usize,
    broken: bool,
}

impl FileClient {
    /// Connect to `host:port` within `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = bounded(timeout, "connect", TcpStream::connect((host, port)))
            .await?
            .map_err(|e| IpcError::Transport {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "Connected to file server");
        Ok(Self {
            stream,
            addr,
            timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            broken: false,
        })
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// False once a request failed below the message level.
    pub fn is_usable(&self) -> bool {
        !self.broken
    }

    /// Send a request and receive the response.
    pub async fn send(&mut self, request: &FileRequest) -> Result<FileResponse> {
        if self.broken {
            return Err(IpcError::Transport {
                addr: self.addr.clone(),
                reason: "connection out of sync after an earlier failure".to_string(),
            });
        }
        let timeout = self.timeout;
        let max = self.max_frame_bytes;
        let stream = &mut self.stream;
        let addr = &self.addr;
        let result: Result<FileResponse> = bounded(timeout, "request", async move {
            write_frame(stream, request).await?;
            read_frame::<_, FileResponse>(stream, max)
                .await?
                .ok_or_else(|| IpcError::Transport {
                    addr: addr.clone(),
                    reason: "connection closed before reply".to_string(),
                })
        })
        .await
        .and_then(|response| response);
        if let Err(e) = &result {
            debug!(addr = %self.addr, error = %e, "Abandoning connection");
            self.broken = true;
        }
        result
    }

    /// Returns the server's version string.
    pub async fn ping(&mut self) -> Result<String> {
        match self.send(&FileRequest::Ping).await? {
            FileResponse::Pong { server_version } => Ok(server_version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn has_file(&mut self, reference: &FileReference) -> Result<bool> {
        let request = FileRequest::HasFile {
            reference: reference.clone(),
        };
        match self.send(&request).await? {
            FileResponse::HasFileAck { present } => Ok(present),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch a blob. The returned data has passed its checksum.
    pub async fn receive_file(&mut self, reference: &FileReference) -> Result<FileReferenceData> {
        let request = FileRequest::ReceiveFile {
            reference: reference.clone(),
        };
        match self.send(&request).await? {
            FileResponse::File(reply) => {
                if &reply.reference != reference {
                    return Err(IpcError::UnexpectedResponse(format!(
                        "asked for {}, received {}",
                        reference, reply.reference
                    )));
                }
                reply.into_data()
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_download(&mut self, references: Vec<FileReference>) -> Result<()> {
        match self.send(&FileRequest::StartDownload { references }).await? {
            FileResponse::DownloadAck => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

async fn bounded<F, T>(timeout: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| IpcError::Timeout {
            operation,
            after: timeout,
        })
}

fn unexpected(response: FileResponse) -> IpcError {
    match response {
        FileResponse::Error(e) => IpcError::Remote(e),
        other => IpcError::UnexpectedResponse(format!("{:?}", other)),
    }
}
