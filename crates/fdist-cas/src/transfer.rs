//! Blob payloads as they travel between controllers and nodes.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::hash;
use crate::FileReference;

/// How the payload bytes map back onto the blob's top-level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Raw file content
    File,
    /// gzip-compressed tar of the directory's contents
    CompressedDirectory,
}

/// A blob packed for transfer, with its integrity checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReferenceData {
    pub reference: FileReference,
    /// Name of the top-level entry inside the blob directory
    pub filename: String,
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
    /// `xxh64(payload, 0)`
    pub checksum: u64,
}

impl FileReferenceData {
    /// Pack the top-level entry of a blob.
    pub fn from_blob(reference: FileReference, entry: &Path) -> io::Result<Self> {
        let filename = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob entry has no name"))?;

        let (kind, payload) = if fs::metadata(entry)?.is_dir() {
            (PayloadKind::CompressedDirectory, pack_directory(entry)?)
        } else {
            (PayloadKind::File, fs::read(entry)?)
        };

        Ok(Self {
            reference,
            filename,
            kind,
            checksum: hash::checksum(&payload),
            payload,
        })
    }

    pub fn verify_checksum(&self) -> bool {
        hash::checksum(&self.payload) == self.checksum
    }

    /// Write the top-level entry to `target` (which must not exist yet).
    pub fn materialize(&self, target: &Path) -> io::Result<()> {
        match self.kind {
            PayloadKind::File => fs::write(target, &self.payload),
            PayloadKind::CompressedDirectory => {
                fs::create_dir_all(target)?;
                let mut archive = tar::Archive::new(GzDecoder::new(self.payload.as_slice()));
                archive.set_preserve_permissions(true);
                archive.unpack(target)
            }
        }
    }
}

fn pack_directory(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}
