//! One content-addressed storage lane for one object kind
//!
//! An [`ObjectCas`] hashes its inputs under the configured protocol and
//! enforces the hash-to-path contract on top of a first-wins [`FileStore`].
//! The file and executable lanes share content but are physically separate
//! directories, so the execute bit is carried by the directory rather than
//! stored per entry. Trees are stored with file permissions.

use std::path::{Path, PathBuf};

use strata_core::{Digest, Error, ExecWriteMode, HashProtocol, ObjectType, Result};
use tracing::debug;

use crate::file_store::{FileStore, StoreMode};

/// A single storage lane
#[derive(Debug, Clone)]
pub struct ObjectCas {
    protocol: HashProtocol,
    kind: ObjectType,
    file_store: FileStore,
}

impl ObjectCas {
    /// Create a lane of the given kind rooted at `root`
    #[must_use]
    pub fn new(
        protocol: HashProtocol,
        kind: ObjectType,
        root: impl Into<PathBuf>,
        exec_write_mode: ExecWriteMode,
    ) -> Self {
        // Trees are stored as plain read-only files.
        let storage_kind = if kind.is_tree() { ObjectType::File } else { kind };
        let file_store = FileStore::new(root, storage_kind, StoreMode::FirstWins)
            .with_epoch_time(true)
            .with_exec_write_mode(exec_write_mode);
        Self {
            protocol,
            kind,
            file_store,
        }
    }

    /// Protocol of this lane
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.protocol
    }

    /// Object kind of this lane
    #[must_use]
    pub fn kind(&self) -> ObjectType {
        self.kind
    }

    fn digest_of(&self, data: &[u8]) -> Digest {
        if self.kind.is_tree() {
            Digest::tree(self.protocol, data)
        } else {
            Digest::file(self.protocol, data)
        }
    }

    /// Reject digests computed under a foreign protocol
    fn check_protocol(&self, digest: &Digest) -> Result<()> {
        if digest.protocol() != self.protocol {
            return Err(Error::protocol_mismatch(self.protocol, digest.protocol()));
        }
        Ok(())
    }

    /// Store in-memory bytes; returns the digest on success
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = self.digest_of(data);
        self.file_store.add_from_bytes(digest.hash(), data)?;
        Ok(digest)
    }

    /// Store the content of an existing file; returns the digest on success
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_file(&self, source: &Path, is_owner: bool) -> Result<Digest> {
        let digest = Digest::from_file(self.protocol, source, self.kind.is_tree())?;
        self.file_store.add_from_file(digest.hash(), source, is_owner)?;
        Ok(digest)
    }

    /// Deterministic entry path; pure, no existence check
    #[must_use]
    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.file_store.entry_path(digest.hash())
    }

    /// Path of the entry iff it exists in this lane
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMismatch` for digests of the other protocol.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        self.check_protocol(digest)?;
        let path = self.entry_path(digest);
        if path.is_file() {
            Ok(Some(path))
        } else {
            debug!(hash = %digest.hash(), lane = %self.kind, "blob not found");
            Ok(None)
        }
    }

    /// Direct access to the underlying file store (for uplinking)
    #[must_use]
    pub(crate) fn file_store(&self) -> &FileStore {
        &self.file_store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(dir: &Path, kind: ObjectType) -> ObjectCas {
        ObjectCas::new(HashProtocol::Native, kind, dir, ExecWriteMode::InProcess)
    }

    #[test]
    fn stored_blob_is_found_under_its_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cas = lane(dir.path(), ObjectType::File);

        let digest = cas.store_bytes(b"test").unwrap();
        assert_eq!(digest.hash(), "30d74d258442c7c65512eafab474568dd706c430");

        let path = cas.lookup(&digest).unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"test");
    }

    #[test]
    fn lookup_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cas = lane(dir.path(), ObjectType::File);
        let digest = Digest::file(HashProtocol::Native, b"absent");
        assert!(cas.lookup(&digest).unwrap().is_none());
    }

    #[test]
    fn tree_lane_uses_tree_digests() {
        let dir = tempfile::tempdir().unwrap();
        let cas = lane(dir.path(), ObjectType::Tree);
        let digest = cas.store_bytes(b"test").unwrap();
        assert_eq!(digest.hash(), "5f0ecc1a989593005e80f457446133250fcc43cc");
        assert!(digest.is_tree());
    }

    #[test]
    fn cross_protocol_lookup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cas = lane(dir.path(), ObjectType::File);
        let foreign = Digest::file(HashProtocol::Compatible, b"test");
        assert!(matches!(
            cas.lookup(&foreign),
            Err(Error::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn store_file_returns_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::write(&source, b"test").unwrap();

        let cas = lane(&dir.path().join("cas"), ObjectType::File);
        let digest = cas.store_file(&source, false).unwrap();
        assert_eq!(digest, Digest::file(HashProtocol::Native, b"test"));
        assert!(cas.lookup(&digest).unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn executable_lane_carries_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let cas = lane(dir.path(), ObjectType::Executable);
        let digest = cas.store_bytes(b"#!/bin/sh\n").unwrap();
        let path = cas.lookup(&digest).unwrap().unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
