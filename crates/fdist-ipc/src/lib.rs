//! # fdist-ipc
//!
//! Messages exchanged between controllers and nodes, their framing, and an
//! async client.
//!
//! Every message is one frame: a little-endian `u32` payload length followed
//! by the `bincode` encoding of a [`FileRequest`] or [`FileResponse`].

pub mod client;
mod frame;

pub use frame::{frame_len, read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};

use std::time::Duration;

use fdist_cas::{FileReference, FileReferenceData, PayloadKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default file server port
pub const DEFAULT_PORT: u16 = 19070;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRequest {
    Ping,
    /// Does the server have a well-formed blob for this reference?
    HasFile { reference: FileReference },
    /// Send the blob's bytes with an integrity checksum
    ReceiveFile { reference: FileReference },
    /// Advisory: these references are now relevant, fetch them
    StartDownload { references: Vec<FileReference> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileResponse {
    Pong { server_version: String },
    HasFileAck { present: bool },
    File(FileReply),
    DownloadAck,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Ok,
    NotFound,
    InternalError,
}

/// Reply to [`FileRequest::ReceiveFile`].
///
/// On failure the payload is empty and `error` describes what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReply {
    pub reference: FileReference,
    pub filename: String,
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
    pub checksum: u64,
    pub status: FileStatus,
    pub error: Option<String>,
}

impl FileReply {
    pub fn ok(data: FileReferenceData) -> Self {
        Self {
            reference: data.reference,
            filename: data.filename,
            kind: data.kind,
            payload: data.payload,
            checksum: data.checksum,
            status: FileStatus::Ok,
            error: None,
        }
    }

    pub fn failure(reference: FileReference, status: FileStatus, error: impl Into<String>) -> Self {
        Self {
            reference,
            filename: String::new(),
            kind: PayloadKind::File,
            payload: Vec::new(),
            checksum: 0,
            status,
            error: Some(error.into()),
        }
    }

    /// Unpack a successful reply, checking the payload against its checksum.
    pub fn into_data(self) -> Result<FileReferenceData> {
        match self.status {
            FileStatus::Ok => {}
            FileStatus::NotFound => {
                return Err(IpcError::NotFound {
                    reference: self.reference.to_string(),
                })
            }
            FileStatus::InternalError => {
                return Err(IpcError::Remote(
                    self.error.unwrap_or_else(|| "internal error".to_string()),
                ))
            }
        }
        let data = FileReferenceData {
            reference: self.reference,
            filename: self.filename,
            kind: self.kind,
            payload: self.payload,
            checksum: self.checksum,
        };
        if !data.verify_checksum() {
            return Err(IpcError::Integrity {
                reference: data.reference.to_string(),
            });
        }
        Ok(data)
    }
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Cannot reach {addr}: {reason}")]
    Transport { addr: String, reason: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("File reference not found on remote: {reference}")]
    NotFound { reference: String },

    #[error("Checksum mismatch for {reference}")]
    Integrity { reference: String },
}

impl IpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> FileReference {
        FileReference::parse("3f1c9a27b0e4d6c2").unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let req = FileRequest::StartDownload {
            references: vec![reference()],
        };
        let bytes = bincode::serialize(&req).unwrap();
        let decoded: FileRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_malformed_reference_rejected_on_decode() {
        #[derive(Serialize)]
        enum Forged {
            #[allow(dead_code)]
            Ping,
            HasFile { reference: String },
        }
        let bytes = bincode::serialize(&Forged::HasFile {
            reference: "../../etc".to_string(),
        })
        .unwrap();
        assert!(bincode::deserialize::<FileRequest>(&bytes).is_err());
    }

    #[test]
    fn test_reply_checksum_verified() {
        let payload = b"hello".to_vec();
        let data = FileReferenceData {
            reference: reference(),
            filename: "b.txt".to_string(),
            kind: PayloadKind::File,
            checksum: fdist_cas::hash::checksum(&payload),
            payload,
        };
        assert_eq!(FileReply::ok(data.clone()).into_data().unwrap(), data);

        let mut tampered = FileReply::ok(data);
        tampered.payload[0] ^= 0xff;
        assert!(matches!(tampered.into_data(), Err(IpcError::Integrity { .. })));
    }

    #[test]
    fn test_failure_reply() {
        let reply = FileReply::failure(reference(), FileStatus::NotFound, "no such blob");
        assert!(reply.payload.is_empty());
        assert!(matches!(reply.into_data(), Err(IpcError::NotFound { .. })));

        let reply = FileReply::failure(reference(), FileStatus::InternalError, "disk on fire");
        match reply.into_data() {
            Err(IpcError::Remote(msg)) => assert_eq!(msg, "disk on fire"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
