//! Large-object storage: chunked blobs with manifests
//!
//! A large blob may be stored split: its chunks are ordinary file-lane CAS
//! entries and a manifest file, named by the blob's own digest, records the
//! chunk sequence. Uplinking moves the manifest and every chunk without
//! reassembling; reads splice the chunks back into the main lane on demand.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use strata_core::{Digest, Error, HashProtocol, ObjectType, Result};
use tracing::debug;

use crate::file_store::{FileStore, StoreMode};
use crate::object_cas::ObjectCas;
use crate::process;

/// Chunk size used when splitting large objects
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestChunk {
    hash: String,
    size: u64,
}

/// Manifest store for one object kind (file or tree)
#[derive(Debug, Clone)]
pub struct LargeObjectCas {
    protocol: HashProtocol,
    kind: ObjectType,
    file_store: FileStore,
}

impl LargeObjectCas {
    /// Create a manifest store rooted at `root`
    #[must_use]
    pub fn new(protocol: HashProtocol, kind: ObjectType, root: impl Into<PathBuf>) -> Self {
        let file_store = FileStore::new(root, ObjectType::File, StoreMode::FirstWins)
            .with_epoch_time(true);
        Self {
            protocol,
            kind,
            file_store,
        }
    }

    /// Path of the manifest entry iff it exists
    #[must_use]
    pub fn manifest_path(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self.file_store.entry_path(digest.hash());
        path.is_file().then_some(path)
    }

    /// Split an object into chunks stored in `chunk_lane`
    ///
    /// Returns the chunk digests in order. The manifest is recorded under
    /// the object's digest.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or when `source` does not hash to
    /// `digest`.
    pub fn split(
        &self,
        chunk_lane: &ObjectCas,
        digest: &Digest,
        source: &Path,
    ) -> Result<Vec<Digest>> {
        let actual = Digest::from_file(self.protocol, source, self.kind.is_tree())?;
        if &actual != digest {
            return Err(Error::invalid_digest(format!(
                "split source hashes to {}, expected {}",
                actual.hash(),
                digest.hash()
            )));
        }

        let mut file = fs::File::open(source).map_err(|e| Error::io(e, source, "open"))?;
        let mut chunks = Vec::new();
        let mut manifest = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file
                    .read(&mut buf[filled..])
                    .map_err(|e| Error::io(e, source, "read"))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            let chunk = chunk_lane.store_bytes(&buf[..filled])?;
            manifest.push(ManifestChunk {
                hash: chunk.hash().to_string(),
                size: chunk.size(),
            });
            chunks.push(chunk);
            if filled < buf.len() {
                break;
            }
        }

        let bytes =
            serde_json::to_vec(&manifest).map_err(|e| Error::serialization(e.to_string()))?;
        self.file_store.add_from_bytes(digest.hash(), &bytes)?;
        debug!(hash = %digest.hash(), chunks = chunks.len(), "split large object");
        Ok(chunks)
    }

    /// Read the chunk digests recorded for an object
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the manifest exists but cannot be decoded.
    pub fn read_manifest(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let Some(path) = self.manifest_path(digest) else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
        let manifest: Vec<ManifestChunk> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(format!("large-object manifest: {e}"), &path))?;
        let chunks = manifest
            .into_iter()
            .map(|c| Digest::new(self.protocol, c.hash, c.size, false))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::corrupt(format!("large-object manifest: {e}"), &path))?;
        Ok(Some(chunks))
    }

    /// Reassemble an object from its chunks into `target_lane`
    ///
    /// Returns the path of the spliced entry, or `None` if no manifest is
    /// present.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if a chunk is missing or the reassembled content
    /// does not hash to the requested digest.
    pub fn splice(
        &self,
        chunk_lane: &ObjectCas,
        target_lane: &ObjectCas,
        digest: &Digest,
    ) -> Result<Option<PathBuf>> {
        let Some(chunks) = self.read_manifest(digest)? else {
            return Ok(None);
        };

        let staged = process::create_unique_path(&target_lane.entry_path(digest));
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        let mut out = fs::File::create(&staged).map_err(|e| Error::io(e, &staged, "create"))?;
        for chunk in &chunks {
            let Some(chunk_path) = chunk_lane.lookup(chunk)? else {
                let _ = fs::remove_file(&staged);
                return Err(Error::corrupt_no_path(format!(
                    "large-object chunk {} is missing",
                    chunk.hash()
                )));
            };
            let bytes = fs::read(&chunk_path).map_err(|e| Error::io(e, &chunk_path, "read"))?;
            out.write_all(&bytes).map_err(|e| Error::io(e, &staged, "write"))?;
        }
        drop(out);

        let spliced = target_lane.store_file(&staged, true);
        let _ = fs::remove_file(&staged);
        let stored = spliced?;
        if &stored != digest {
            return Err(Error::corrupt_no_path(format!(
                "spliced object hashes to {}, expected {}",
                stored.hash(),
                digest.hash()
            )));
        }
        target_lane.lookup(digest)
    }

    /// Uplink the manifest and all its chunks into `latest`
    ///
    /// The object is not reassembled. Returns `false` if this store has no
    /// manifest for the digest.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt manifest.
    pub fn local_uplink(
        &self,
        chunk_lane: &ObjectCas,
        latest: &Self,
        latest_chunk_lane: &ObjectCas,
        digest: &Digest,
    ) -> Result<bool> {
        let Some(path) = self.manifest_path(digest) else {
            return Ok(false);
        };
        let Some(chunks) = self.read_manifest(digest)? else {
            return Ok(false);
        };
        for chunk in &chunks {
            let Some(chunk_path) = chunk_lane.lookup(chunk)? else {
                return Ok(false);
            };
            latest_chunk_lane
                .file_store()
                .add_from_file(chunk.hash(), &chunk_path, true)?;
        }
        latest.file_store.add_from_file(digest.hash(), &path, true)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ExecWriteMode;

    fn setup(dir: &Path) -> (ObjectCas, LargeObjectCas) {
        let lane = ObjectCas::new(
            HashProtocol::Native,
            ObjectType::File,
            dir.join("casf"),
            ExecWriteMode::InProcess,
        );
        let large = LargeObjectCas::new(HashProtocol::Native, ObjectType::File, dir.join("cas-large-f"));
        (lane, large)
    }

    #[test]
    fn split_then_splice_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (lane, large) = setup(dir.path());

        let data: Vec<u8> = (0..(CHUNK_SIZE + CHUNK_SIZE / 2))
            .map(|i| (i % 251) as u8)
            .collect();
        let source = dir.path().join("big");
        fs::write(&source, &data).unwrap();
        let digest = Digest::file(HashProtocol::Native, &data);

        let chunks = large.split(&lane, &digest, &source).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(large.manifest_path(&digest).is_some());

        let spliced = large.splice(&lane, &lane, &digest).unwrap().unwrap();
        assert_eq!(fs::read(spliced).unwrap(), data);
    }

    #[test]
    fn split_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let (lane, large) = setup(dir.path());
        let source = dir.path().join("big");
        fs::write(&source, b"content").unwrap();
        let wrong = Digest::file(HashProtocol::Native, b"other");
        assert!(large.split(&lane, &wrong, &source).is_err());
    }

    #[test]
    fn splice_without_manifest_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (lane, large) = setup(dir.path());
        let digest = Digest::file(HashProtocol::Native, b"absent");
        assert!(large.splice(&lane, &lane, &digest).unwrap().is_none());
    }

    #[test]
    fn splice_with_missing_chunk_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (lane, large) = setup(dir.path());

        let data = vec![7u8; 100];
        let source = dir.path().join("blob");
        fs::write(&source, &data).unwrap();
        let digest = Digest::file(HashProtocol::Native, &data);
        let chunks = large.split(&lane, &digest, &source).unwrap();

        // remove the chunk behind the manifest's back
        let chunk_path = lane.lookup(&chunks[0]).unwrap().unwrap();
        fs::remove_file(&chunk_path).unwrap();

        assert!(matches!(
            large.splice(&lane, &lane, &digest),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn uplink_moves_manifest_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (old_lane, old_large) = setup(&dir.path().join("gen1"));
        let (new_lane, new_large) = setup(&dir.path().join("gen0"));

        let data = vec![3u8; 1000];
        let source = dir.path().join("blob");
        fs::write(&source, &data).unwrap();
        let digest = Digest::file(HashProtocol::Native, &data);
        let chunks = old_large.split(&old_lane, &digest, &source).unwrap();

        assert!(old_large
            .local_uplink(&old_lane, &new_large, &new_lane, &digest)
            .unwrap());
        assert!(new_large.manifest_path(&digest).is_some());
        for chunk in &chunks {
            assert!(new_lane.lookup(chunk).unwrap().is_some());
        }
    }
}
