//! The three-lane content-addressed store of one generation
//!
//! Federates the file, executable and tree lanes, enforces the tree
//! invariants on store, and provides the traversal and dump read paths.
//! All operations are generation-local; cross-generation behavior (uplink
//! on read) lives in [`crate::storage::Storage`].

use std::fs;
use std::io::{Read as _, Write};
use std::path::{Path, PathBuf};

use strata_core::{
    Digest, Error, ExecWriteMode, GenerationConfig, HashProtocol, ObjectInfo, ObjectType, Result,
};
use tracing::{debug, warn};

use crate::file_store::{FileStore, StoreMode};
use crate::large::LargeObjectCas;
use crate::object_cas::ObjectCas;
use crate::tree::{self, TreeEntry};

/// Content-addressed storage of one generation
#[derive(Debug, Clone)]
pub struct LocalCas {
    protocol: HashProtocol,
    file: ObjectCas,
    exec: ObjectCas,
    tree: ObjectCas,
    large_file: LargeObjectCas,
    large_tree: LargeObjectCas,
    validated_trees: FileStore,
}

impl LocalCas {
    /// Open the CAS lanes of one generation
    #[must_use]
    pub fn new(config: &GenerationConfig, exec_write_mode: ExecWriteMode) -> Self {
        let protocol = config.protocol;
        Self {
            protocol,
            file: ObjectCas::new(protocol, ObjectType::File, &config.cas_file, exec_write_mode),
            exec: ObjectCas::new(
                protocol,
                ObjectType::Executable,
                &config.cas_exec,
                exec_write_mode,
            ),
            tree: ObjectCas::new(protocol, ObjectType::Tree, &config.cas_tree, exec_write_mode),
            large_file: LargeObjectCas::new(protocol, ObjectType::File, &config.cas_large_file),
            large_tree: LargeObjectCas::new(protocol, ObjectType::Tree, &config.cas_large_tree),
            validated_trees: FileStore::new(
                &config.validated_trees,
                ObjectType::File,
                StoreMode::FirstWins,
            ),
        }
    }

    /// Protocol of this store
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.protocol
    }

    fn lane(&self, is_executable: bool) -> &ObjectCas {
        if is_executable { &self.exec } else { &self.file }
    }

    /// Store a blob from in-memory bytes
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_blob(&self, data: &[u8], is_executable: bool) -> Result<Digest> {
        self.lane(is_executable).store_bytes(data)
    }

    /// Store a blob from an existing file
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_blob_from_file(
        &self,
        source: &Path,
        is_executable: bool,
        is_owner: bool,
    ) -> Result<Digest> {
        self.lane(is_executable).store_file(source, is_owner)
    }

    /// Store a tree, verifying its invariants first
    ///
    /// Every child referenced by the tree must already be present in this
    /// store, and every symlink target must be non-upwards. A tree failing
    /// verification is not persisted.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the bytes do not parse as a tree and
    /// `InvariantViolation` if verification fails.
    pub fn store_tree(&self, data: &[u8]) -> Result<Digest> {
        let entries = tree::parse(self.protocol, data)?;
        self.verify_tree_entries(&entries)?;
        let digest = self.tree.store_bytes(data)?;
        self.mark_tree_valid(digest.hash())?;
        Ok(digest)
    }

    /// Store a tree read from a file
    ///
    /// # Errors
    ///
    /// See [`Self::store_tree`].
    pub fn store_tree_from_file(&self, source: &Path) -> Result<Digest> {
        let data = fs::read(source).map_err(|e| Error::io(e, source, "read"))?;
        self.store_tree(&data)
    }

    /// Path of a blob, with automatic fallback into the other lane
    ///
    /// A hit in the companion lane lifts the content into the requested
    /// lane with the correct permission bits before returning.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn blob_path(&self, digest: &Digest, is_executable: bool) -> Result<Option<PathBuf>> {
        if let Some(path) = self.lane(is_executable).lookup(digest)? {
            return Ok(Some(path));
        }
        self.try_sync_blob(digest, is_executable)
    }

    /// Path of a blob in exactly the requested lane, no cross-lane sync
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn blob_path_no_sync(
        &self,
        digest: &Digest,
        is_executable: bool,
    ) -> Result<Option<PathBuf>> {
        self.lane(is_executable).lookup(digest)
    }

    /// Lift a blob from the companion lane into the requested one
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn try_sync_blob(&self, digest: &Digest, to_executable: bool) -> Result<Option<PathBuf>> {
        let Some(source) = self.lane(!to_executable).lookup(digest)? else {
            return Ok(None);
        };
        self.lane(to_executable).store_file(&source, false)?;
        self.lane(to_executable).lookup(digest)
    }

    /// Path of a tree object
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn tree_path(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        self.tree.lookup(digest)
    }

    /// Read the raw bytes of a blob
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn read_blob(&self, digest: &Digest, is_executable: bool) -> Result<Option<Vec<u8>>> {
        match self.blob_path(digest, is_executable)? {
            Some(path) => Ok(Some(
                fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?,
            )),
            None => Ok(None),
        }
    }

    /// Read and parse a tree's entries
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt encoding.
    pub fn read_tree_entries(&self, digest: &Digest) -> Result<Option<Vec<TreeEntry>>> {
        let Some(path) = self.tree_path(digest)? else {
            return Ok(None);
        };
        let data = fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
        Ok(Some(tree::parse(self.protocol, &data)?))
    }

    /// Immediate children of a tree, each path prefixed with `parent`
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt encoding.
    pub fn read_tree_direct(
        &self,
        digest: &Digest,
        parent: &Path,
    ) -> Result<Option<Vec<(PathBuf, ObjectInfo)>>> {
        let Some(entries) = self.read_tree_entries(digest)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let info = self.entry_info(&entry)?;
            out.push((parent.join(&entry.name), info));
        }
        Ok(Some(out))
    }

    /// Recursive flattening of a tree: all file-like leaves
    ///
    /// Walks with an explicit work stack. Content addressing makes cycles
    /// impossible (a tree cannot reference itself), and identical subtrees
    /// may legitimately appear at several paths, so recursion is bounded by
    /// depth rather than a visited set.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if a referenced subtree is absent, violating
    /// recursive satisfiability, or if nesting exceeds the depth bound.
    pub fn read_tree_recursive(
        &self,
        digest: &Digest,
        parent: &Path,
    ) -> Result<Option<Vec<(PathBuf, ObjectInfo)>>> {
        const MAX_TREE_DEPTH: usize = 4096;

        let Some(entries) = self.read_tree_entries(digest)? else {
            return Ok(None);
        };

        let mut leaves = Vec::new();
        let mut stack: Vec<(PathBuf, usize, TreeEntry)> = entries
            .into_iter()
            .map(|e| (parent.to_path_buf(), 0, e))
            .collect();

        while let Some((prefix, depth, entry)) = stack.pop() {
            let info = self.entry_info(&entry)?;
            let path = prefix.join(&entry.name);
            if entry.kind.is_tree() {
                if depth >= MAX_TREE_DEPTH {
                    warn!(hash = %info.digest.hash(), "tree nesting exceeds depth bound");
                    return Err(Error::corrupt_no_path(format!(
                        "tree {} nests deeper than {MAX_TREE_DEPTH} levels",
                        info.digest.hash()
                    )));
                }
                let Some(children) = self.read_tree_entries(&info.digest)? else {
                    return Err(Error::corrupt_no_path(format!(
                        "subtree {} referenced but absent",
                        info.digest.hash()
                    )));
                };
                stack.extend(children.into_iter().map(|c| (path.clone(), depth + 1, c)));
            } else {
                leaves.push((path, info));
            }
        }
        Ok(Some(leaves))
    }

    /// Object info of one tree entry
    ///
    /// Compatible symlinks carry their target inline; their info is the
    /// digest of the target text, matching the native representation where
    /// the target text is a blob.
    fn entry_info(&self, entry: &TreeEntry) -> Result<ObjectInfo> {
        let digest = match (&entry.hash, &entry.target) {
            (Some(hash), _) => {
                Digest::new(self.protocol, hash.clone(), entry.size, entry.kind.is_tree())?
            }
            (None, Some(target)) => Digest::file(self.protocol, target.as_bytes()),
            (None, None) => {
                return Err(Error::corrupt_no_path(format!(
                    "tree entry '{}' has neither hash nor target",
                    entry.name
                )))
            }
        };
        Ok(ObjectInfo::new(digest, entry.kind))
    }

    /// Stream an object to a sink
    ///
    /// Blobs stream their bytes. Trees stream the raw encoding when
    /// `raw_tree` is set and a pretty-printed listing otherwise. Returns
    /// `Ok(false)` if the object is not present.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn dump_to_stream(
        &self,
        info: &ObjectInfo,
        sink: &mut dyn Write,
        raw_tree: bool,
    ) -> Result<bool> {
        if info.object_type.is_tree() && !raw_tree {
            let Some(entries) = self.read_tree_entries(&info.digest)? else {
                return Ok(false);
            };
            sink.write_all(tree::pretty_print(&entries).as_bytes())
                .map_err(|e| Error::io_no_path(e, "write"))?;
            return Ok(true);
        }

        let mut path = if info.object_type.is_tree() {
            self.tree_path(&info.digest)?
        } else {
            self.blob_path(&info.digest, info.object_type.is_executable())?
        };
        if path.is_none() && self.protocol == HashProtocol::Native && !info.object_type.is_tree() {
            // In native mode a tree can be dumped as a blob.
            let as_tree = Digest::new(self.protocol, info.digest.hash(), info.digest.size(), true)?;
            path = self.tree_path(&as_tree)?;
        }
        let Some(path) = path else {
            return Ok(false);
        };

        let mut file = fs::File::open(&path).map_err(|e| Error::io(e, &path, "open"))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| Error::io(e, &path, "read"))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .map_err(|e| Error::io_no_path(e, "write"))?;
        }
        Ok(true)
    }

    /// Split a stored blob into chunks with a manifest
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; `Ok(None)` if the blob is absent.
    pub fn split_blob(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let (lane, large) = if digest.is_tree() {
            (&self.tree, &self.large_tree)
        } else {
            (&self.file, &self.large_file)
        };
        let Some(path) = lane.lookup(digest)? else {
            return Ok(None);
        };
        Ok(Some(large.split(&self.file, digest, &path)?))
    }

    /// Reassemble a blob from a stored manifest
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or corrupt manifest/chunks.
    pub fn splice_blob(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        let (lane, large) = if digest.is_tree() {
            (&self.tree, &self.large_tree)
        } else {
            (&self.file, &self.large_file)
        };
        large.splice(&self.file, lane, digest)
    }

    fn verify_tree_entries(&self, entries: &[TreeEntry]) -> Result<()> {
        for entry in entries {
            match entry.kind {
                ObjectType::Tree => {
                    let info = self.entry_info(entry)?;
                    if self.is_tree_valid(info.digest.hash()) {
                        continue;
                    }
                    let Some(children) = self.read_tree_entries(&info.digest)? else {
                        return Err(Error::invariant(format!(
                            "tree references absent subtree {}",
                            info.digest.hash()
                        )));
                    };
                    self.verify_tree_entries(&children)?;
                    self.mark_tree_valid(info.digest.hash())?;
                }
                ObjectType::File | ObjectType::Executable => {
                    let info = self.entry_info(entry)?;
                    if self
                        .blob_path(&info.digest, entry.kind.is_executable())?
                        .is_none()
                    {
                        return Err(Error::invariant(format!(
                            "tree references absent blob {} ('{}')",
                            info.digest.hash(),
                            entry.name
                        )));
                    }
                }
                ObjectType::Symlink => {
                    let target = match (&entry.target, &entry.hash) {
                        (Some(target), _) => target.clone(),
                        (None, Some(_)) => {
                            let info = self.entry_info(entry)?;
                            let Some(bytes) = self.read_blob(&info.digest, false)? else {
                                return Err(Error::invariant(format!(
                                    "tree references absent symlink blob {} ('{}')",
                                    info.digest.hash(),
                                    entry.name
                                )));
                            };
                            String::from_utf8(bytes).map_err(|_| {
                                Error::invariant(format!(
                                    "symlink '{}' target is not UTF-8",
                                    entry.name
                                ))
                            })?
                        }
                        (None, None) => {
                            return Err(Error::invariant(format!(
                                "symlink entry '{}' has neither hash nor target",
                                entry.name
                            )))
                        }
                    };
                    if !tree::is_non_upwards_target(&target) {
                        return Err(Error::invariant(format!(
                            "symlink '{}' escapes its tree root: '{target}'",
                            entry.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check the marker recording a tree as verified in this generation
    #[must_use]
    pub fn is_tree_valid(&self, tree_hash: &str) -> bool {
        self.validated_trees.entry_path(tree_hash).is_file()
    }

    /// Record a tree as verified in this generation
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn mark_tree_valid(&self, tree_hash: &str) -> Result<()> {
        self.validated_trees.add_from_bytes(tree_hash, b"")
    }

    /// Uplink a blob from this generation into `latest`
    ///
    /// Prefers a hard link from the same lane. With `skip_sync` unset, a
    /// hit in the companion lane is copied into the requested lane of
    /// `latest` with corrected permission bits.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn local_uplink_blob(
        &self,
        latest: &Self,
        digest: &Digest,
        is_executable: bool,
        skip_sync: bool,
    ) -> Result<bool> {
        if let Some(path) = self.blob_path_no_sync(digest, is_executable)? {
            latest
                .lane(is_executable)
                .file_store()
                .add_from_file(digest.hash(), &path, true)?;
            return Ok(true);
        }
        if skip_sync {
            return Ok(false);
        }
        if let Some(path) = self.blob_path_no_sync(digest, !is_executable)? {
            latest.lane(is_executable).store_file(&path, false)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Deeply uplink a tree from this generation into `latest`
    ///
    /// All transitive referents are uplinked before the tree blob itself,
    /// so the recursive-satisfiability invariant holds in `latest` at every
    /// point. Executable children are additionally made available in the
    /// file lane when this generation carries them there.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn local_uplink_tree(&self, latest: &Self, digest: &Digest) -> Result<bool> {
        let Some(path) = self.tree_path(digest)? else {
            return Ok(false);
        };
        let data = fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
        let entries = tree::parse(self.protocol, &data)?;

        for entry in &entries {
            let uplinked = match entry.kind {
                ObjectType::Tree => {
                    let info = self.entry_info(entry)?;
                    self.local_uplink_tree(latest, &info.digest)?
                }
                ObjectType::File => {
                    let info = self.entry_info(entry)?;
                    self.local_uplink_blob(latest, &info.digest, false, false)?
                }
                ObjectType::Executable => {
                    let info = self.entry_info(entry)?;
                    // keep the file-lane twin reachable as well, links only
                    let _ = self.local_uplink_blob(latest, &info.digest, false, true)?;
                    self.local_uplink_blob(latest, &info.digest, true, false)?
                }
                ObjectType::Symlink => match &entry.hash {
                    Some(_) => {
                        let info = self.entry_info(entry)?;
                        self.local_uplink_blob(latest, &info.digest, false, false)?
                    }
                    // compatible symlinks carry their target inline
                    None => true,
                },
            };
            if !uplinked {
                debug!(tree = %digest.hash(), child = %entry.name, "tree uplink missing child");
                return Ok(false);
            }
        }

        latest
            .tree
            .file_store()
            .add_from_file(digest.hash(), &path, true)?;
        latest.mark_tree_valid(digest.hash())?;
        Ok(true)
    }

    /// Uplink a large-object manifest and its chunks into `latest`
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn local_uplink_large_blob(&self, latest: &Self, digest: &Digest) -> Result<bool> {
        let (large, latest_large) = if digest.is_tree() {
            (&self.large_tree, &latest.large_tree)
        } else {
            (&self.large_file, &latest.large_file)
        };
        large.local_uplink(&self.file, latest_large, &latest.file, digest)
    }
}
