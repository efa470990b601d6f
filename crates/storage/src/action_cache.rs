//! Action cache: action fingerprint to cached result
//!
//! An entry is a small file named by the action-fingerprint hex whose
//! content is the canonical object-info string of an [`ActionResult`] blob
//! in the CAS. Entries are placed *last-wins* in the active storage so a
//! failed run recorded earlier can be overwritten by a successful rerun;
//! plain generation instances use *first-wins* so uplinking never clobbers
//! a newer entry with an older one.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use strata_core::{Digest, Error, ObjectInfo, ObjectType, Result};
use tracing::debug;

use crate::file_store::{FileStore, StoreMode};
use crate::local_cas::LocalCas;

/// An output file produced by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the action's working directory
    pub path: String,
    /// Hex content hash
    pub hash: String,
    /// Content size in bytes
    pub size: u64,
    /// Execute bit
    pub executable: bool,
}

/// An output directory produced by an action, referenced as a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    /// Path relative to the action's working directory
    pub path: String,
    /// Hex tree hash
    pub hash: String,
    /// Tree encoding size in bytes
    pub size: u64,
}

/// An output symlink produced by an action; the target is stored inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSymlink {
    /// Path relative to the action's working directory
    pub path: String,
    /// Link target text
    pub target: String,
}

/// Reference to a captured output stream blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Hex content hash
    pub hash: String,
    /// Content size in bytes
    pub size: u64,
}

/// Result descriptor of one executed action
///
/// Persisted as a canonical JSON blob in the CAS; the action-cache entry
/// points at that blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Exit code of the action's command
    pub exit_code: i32,
    /// Output files, in declaration order
    pub output_files: Vec<OutputFile>,
    /// Output directories, in declaration order
    pub output_directories: Vec<OutputDirectory>,
    /// Output symlinks, in declaration order
    pub output_symlinks: Vec<OutputSymlink>,
    /// Captured stdout, if any
    pub stdout: Option<BlobRef>,
    /// Captured stderr, if any
    pub stderr: Option<BlobRef>,
}

impl ActionResult {
    /// Canonical serialized form
    ///
    /// # Errors
    ///
    /// Returns a serialization error (cannot happen for well-formed data).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decode from the canonical serialized form
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` on malformed bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::corrupt_no_path(format!("action result: {e}")))
    }

    /// All CAS objects this result references
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded hash is malformed.
    pub fn artifacts(&self, protocol: strata_core::HashProtocol) -> Result<Vec<ObjectInfo>> {
        let mut infos = Vec::new();
        for f in &self.output_files {
            let kind = if f.executable {
                ObjectType::Executable
            } else {
                ObjectType::File
            };
            infos.push(ObjectInfo::new(
                Digest::new(protocol, f.hash.clone(), f.size, false)?,
                kind,
            ));
        }
        for d in &self.output_directories {
            infos.push(ObjectInfo::new(
                Digest::new(protocol, d.hash.clone(), d.size, true)?,
                ObjectType::Tree,
            ));
        }
        for stream in [&self.stdout, &self.stderr].into_iter().flatten() {
            infos.push(ObjectInfo::new(
                Digest::new(protocol, stream.hash.clone(), stream.size, false)?,
                ObjectType::File,
            ));
        }
        Ok(infos)
    }
}

/// Persistent map from action fingerprint to [`ActionResult`]
#[derive(Debug, Clone)]
pub struct ActionCache {
    cas: Arc<LocalCas>,
    file_store: FileStore,
}

impl ActionCache {
    /// Open the action cache of one generation
    #[must_use]
    pub fn new(cas: Arc<LocalCas>, dir: &Path, mode: StoreMode) -> Self {
        let file_store =
            FileStore::new(dir, ObjectType::File, mode).with_durability(mode == StoreMode::LastWins);
        Self { cas, file_store }
    }

    /// The CAS backing this cache
    #[must_use]
    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    /// Store an action result
    ///
    /// The result blob lands in the CAS first; only then is the entry file
    /// published, so a reader never observes a dangling entry. Results of
    /// failed actions are stored uniformly; not short-circuiting on them is
    /// the caller's contract.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_result(&self, action_id: &Digest, result: &ActionResult) -> Result<()> {
        let blob = self.cas.store_blob(&result.to_bytes()?, false)?;
        let entry = ObjectInfo::new(blob, ObjectType::File).to_canonical_string();
        debug!(action = %action_id.hash(), entry = %entry, "caching action result");
        self.file_store
            .add_from_bytes(action_id.hash(), entry.as_bytes())
    }

    /// Read the entry indirection for an action, if present
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the entry file exists but cannot be decoded.
    pub fn read_entry_info(&self, action_id: &Digest) -> Result<Option<ObjectInfo>> {
        let path = self.file_store.entry_path(action_id.hash());
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        ObjectInfo::from_string(self.cas.protocol(), content.trim())
            .map(Some)
            .map_err(|e| Error::corrupt(format!("action-cache entry: {e}"), &path))
    }

    /// Read a cached action result, if present
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the entry or its result blob is undecodable or
    /// the blob is absent despite a live entry.
    pub fn read_result(&self, action_id: &Digest) -> Result<Option<ActionResult>> {
        let Some(info) = self.read_entry_info(action_id)? else {
            return Ok(None);
        };
        let Some(bytes) = self.cas.read_blob(&info.digest, false)? else {
            return Err(Error::corrupt_no_path(format!(
                "action-cache entry for {} references absent blob {}",
                action_id.hash(),
                info.digest.hash()
            )));
        };
        Ok(Some(ActionResult::from_bytes(&bytes)?))
    }

    /// Uplink an entry from this generation into `latest`
    ///
    /// The result blob and every artifact it names are uplinked before the
    /// entry file itself, so a published entry always references satisfied
    /// objects in `latest`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or corrupt persisted state.
    pub fn local_uplink_entry(&self, latest: &Self, action_id: &Digest) -> Result<bool> {
        let Some(info) = self.read_entry_info(action_id)? else {
            return Ok(false);
        };
        if !self
            .cas
            .local_uplink_blob(&latest.cas, &info.digest, false, false)?
        {
            return Ok(false);
        }
        let Some(bytes) = self.cas.read_blob(&info.digest, false)? else {
            return Ok(false);
        };
        let result = ActionResult::from_bytes(&bytes)?;
        for artifact in result.artifacts(self.cas.protocol())? {
            let uplinked = if artifact.object_type.is_tree() {
                self.cas.local_uplink_tree(&latest.cas, &artifact.digest)?
            } else {
                let is_exec = artifact.object_type.is_executable();
                if is_exec {
                    let _ = self
                        .cas
                        .local_uplink_blob(&latest.cas, &artifact.digest, false, true)?;
                }
                self.cas
                    .local_uplink_blob(&latest.cas, &artifact.digest, is_exec, false)?
            };
            if !uplinked {
                debug!(
                    action = %action_id.hash(),
                    artifact = %artifact.digest.hash(),
                    "action-cache uplink missing artifact"
                );
                return Ok(false);
            }
        }
        let entry_path = self.file_store.entry_path(action_id.hash());
        latest
            .file_store
            .add_from_file(action_id.hash(), &entry_path, true)?;
        Ok(true)
    }
}
