//! Blob containers passed through the execution API

use std::path::PathBuf;

use strata_core::{Digest, Error, Result};

/// Content of an [`ArtifactBlob`]: in memory or on disk
#[derive(Debug, Clone)]
pub enum BlobData {
    /// In-memory bytes
    Bytes(Vec<u8>),
    /// Path of a file holding the content
    File(PathBuf),
}

/// One blob travelling through an execution API
#[derive(Debug, Clone)]
pub struct ArtifactBlob {
    /// Declared digest; receivers verify it against the actual content
    pub digest: Digest,
    /// The content itself
    pub data: BlobData,
    /// Whether the blob is an executable
    pub is_executable: bool,
}

impl ArtifactBlob {
    /// Blob from in-memory bytes
    #[must_use]
    pub fn from_bytes(digest: Digest, data: Vec<u8>, is_executable: bool) -> Self {
        Self {
            digest,
            data: BlobData::Bytes(data),
            is_executable,
        }
    }

    /// Blob backed by a file on disk
    #[must_use]
    pub fn from_file(digest: Digest, path: PathBuf, is_executable: bool) -> Self {
        Self {
            digest,
            data: BlobData::File(path),
            is_executable,
        }
    }

    /// Materialize the content as bytes
    ///
    /// # Errors
    ///
    /// Returns an error if a file-backed blob cannot be read.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.data {
            BlobData::Bytes(bytes) => Ok(bytes.clone()),
            BlobData::File(path) => {
                std::fs::read(path).map_err(|e| Error::io(e, path, "read"))
            }
        }
    }
}
