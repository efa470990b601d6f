//! Local execution API over a [`Storage`]
//!
//! The adapter the core exposes to outside code: uploads verify declared
//! digests and tree invariants, retrievals resolve trees recursively, and
//! CAS-to-CAS synchronization transfers children before parents so the
//! receiving side never observes an unsatisfiable tree.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::{Digest, Error, HashProtocol, ObjectInfo, ObjectType, Result};
use strata_storage::tree::TreeEntry;
use strata_storage::{Storage, tree};
use tracing::warn;

use crate::api::ExecutionApi;
use crate::blob::ArtifactBlob;

/// Execution API backed by the local generation-set storage
#[derive(Clone)]
pub struct LocalApi {
    storage: Arc<Storage>,
}

impl LocalApi {
    /// Wrap a storage handle
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// The underlying storage
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn not_available(digest: &Digest) -> Error {
        Error::io_no_path(
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("object {} not available locally", digest.hash()),
            ),
            "retrieve",
        )
    }

    /// Resolve the symlink target text of a tree entry
    fn symlink_target(&self, entry: &TreeEntry) -> Result<String> {
        if let Some(target) = &entry.target {
            return Ok(target.clone());
        }
        let info = ObjectInfo::new(
            Digest::new(
                self.storage.protocol(),
                entry.hash.clone().unwrap_or_default(),
                entry.size,
                false,
            )?,
            ObjectType::Symlink,
        );
        let Some(bytes) = self.storage.read_blob(&info.digest, false)? else {
            return Err(Self::not_available(&info.digest));
        };
        String::from_utf8(bytes).map_err(|_| {
            Error::corrupt_no_path(format!("symlink blob {} is not UTF-8", info.digest.hash()))
        })
    }

    /// Materialize a tree as a directory at `dest`
    fn materialize_tree(&self, digest: &Digest, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| Error::io(e, dest, "create_dir_all"))?;
        // ensure the tree is uplinked, then walk the raw entries so inline
        // symlink targets stay visible
        if self.storage.tree_path(digest)?.is_none() {
            return Err(Self::not_available(digest));
        }
        let Some(raw_entries) = self.storage.cas().read_tree_entries(digest)? else {
            return Err(Self::not_available(digest));
        };

        for entry in raw_entries {
            let target_path = dest.join(&entry.name);
            match entry.kind {
                ObjectType::Tree => {
                    let child = Digest::new(
                        self.storage.protocol(),
                        entry.hash.clone().unwrap_or_default(),
                        entry.size,
                        true,
                    )?;
                    self.materialize_tree(&child, &target_path)?;
                }
                ObjectType::File | ObjectType::Executable => {
                    let child = Digest::new(
                        self.storage.protocol(),
                        entry.hash.clone().unwrap_or_default(),
                        entry.size,
                        false,
                    )?;
                    self.install_blob(&child, entry.kind, &target_path)?;
                }
                ObjectType::Symlink => {
                    let target = self.symlink_target(&entry)?;
                    make_symlink(&target, &target_path)?;
                }
            }
        }
        Ok(())
    }

    /// Copy a blob to `dest` with permissions fit for human use
    ///
    /// Installed files get the user-write bit on top of the store
    /// permissions; this is an output-only policy, the store itself stays
    /// read-only.
    fn install_blob(&self, digest: &Digest, kind: ObjectType, dest: &Path) -> Result<()> {
        let Some(source) = self.storage.blob_path(digest, kind.is_executable())? else {
            return Err(Self::not_available(digest));
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        if dest.exists() {
            std::fs::remove_file(dest).map_err(|e| Error::io(e, dest, "remove_file"))?;
        }
        std::fs::copy(&source, dest).map_err(|e| Error::io(e, dest, "copy"))?;
        let mode = if kind.is_executable() { 0o755 } else { 0o644 };
        strata_storage::process::set_permissions(dest, mode)
    }

    /// Transfer one object, children first, into another endpoint
    fn transfer(
        &self,
        info: &ObjectInfo,
        other: &dyn ExecutionApi,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(info.digest.hash().to_string()) {
            return Ok(());
        }
        if info.object_type.is_tree() {
            let Some(entries) = self.storage.cas().read_tree_entries(&info.digest)? else {
                return Err(Self::not_available(&info.digest));
            };
            for entry in &entries {
                let Some(hash) = &entry.hash else {
                    continue; // inline symlink target, nothing to transfer
                };
                let child = Digest::new(
                    self.storage.protocol(),
                    hash.clone(),
                    entry.size,
                    entry.kind.is_tree(),
                )?;
                let kind = if entry.kind.is_tree() {
                    ObjectType::Tree
                } else {
                    entry.kind
                };
                self.transfer(&ObjectInfo::new(child, kind), other, visited)?;
            }
            let Some(path) = self.storage.tree_path(&info.digest)? else {
                return Err(Self::not_available(&info.digest));
            };
            let bytes = std::fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
            other.upload(
                vec![ArtifactBlob::from_bytes(info.digest.clone(), bytes, false)],
                false,
            )
        } else {
            if other.is_available(&info.digest) {
                return Ok(());
            }
            let is_exec = info.object_type.is_executable();
            let Some(bytes) = self.storage.read_blob(&info.digest, is_exec)? else {
                return Err(Self::not_available(&info.digest));
            };
            other.upload(
                vec![ArtifactBlob::from_bytes(info.digest.clone(), bytes, is_exec)],
                false,
            )
        }
    }
}

/// Builder for nested tree uploads, one level per directory
#[derive(Default)]
struct DirBuilder {
    files: Vec<(String, ObjectInfo)>,
    subdirs: std::collections::BTreeMap<String, DirBuilder>,
}

impl DirBuilder {
    fn add(&mut self, path: &Path, info: ObjectInfo) -> Result<()> {
        let mut components = path.components();
        let Some(first) = components.next() else {
            return Err(Error::invariant("empty artifact path in tree upload"));
        };
        let name = first.as_os_str().to_string_lossy().to_string();
        let rest = components.as_path();
        if rest.as_os_str().is_empty() {
            self.files.push((name, info));
        } else {
            self.subdirs
                .entry(name)
                .or_default()
                .add(rest, info)?;
        }
        Ok(())
    }

    fn build(&self, api: &LocalApi) -> Result<Digest> {
        let protocol = api.storage.protocol();
        let mut entries = Vec::new();
        for (name, subdir) in &self.subdirs {
            let digest = subdir.build(api)?;
            entries.push(TreeEntry::new(
                name.clone(),
                ObjectType::Tree,
                digest.hash(),
                digest.size(),
            ));
        }
        for (name, info) in &self.files {
            match info.object_type {
                ObjectType::Symlink if protocol == HashProtocol::Compatible => {
                    // compatible trees carry targets inline
                    let Some(bytes) = api.storage.read_blob(&info.digest, false)? else {
                        return Err(LocalApi::not_available(&info.digest));
                    };
                    let target = String::from_utf8(bytes).map_err(|_| {
                        Error::corrupt_no_path("symlink target is not UTF-8")
                    })?;
                    entries.push(TreeEntry::symlink(name.clone(), target));
                }
                _ => entries.push(TreeEntry::new(
                    name.clone(),
                    info.object_type,
                    info.digest.hash(),
                    info.digest.size(),
                )),
            }
        }
        let encoded = tree::encode(protocol, &entries)?;
        api.storage.store_tree(&encoded)
    }
}

impl ExecutionApi for LocalApi {
    fn hash_protocol(&self) -> HashProtocol {
        self.storage.protocol()
    }

    fn is_available(&self, digest: &Digest) -> bool {
        let result = if digest.is_tree() {
            self.storage.tree_path(digest).map(|p| p.is_some())
        } else {
            self.storage.blob_path(digest, false).map(|p| p.is_some())
        };
        result.unwrap_or_else(|e| {
            warn!(hash = %digest.hash(), error = %e, "availability check failed");
            false
        })
    }

    fn upload(&self, blobs: Vec<ArtifactBlob>, skip_find_missing: bool) -> Result<()> {
        for blob in blobs {
            if blob.digest.protocol() != self.storage.protocol() {
                return Err(Error::protocol_mismatch(
                    self.storage.protocol(),
                    blob.digest.protocol(),
                ));
            }
            if !skip_find_missing && self.is_available(&blob.digest) {
                continue;
            }
            let bytes = blob.read_bytes()?;
            let stored = if blob.digest.is_tree() {
                self.storage.store_tree(&bytes)?
            } else {
                self.storage.store_blob(&bytes, blob.is_executable)?
            };
            // refuse blobs whose declared and actual digest disagree
            if stored != blob.digest {
                return Err(Error::invalid_digest(format!(
                    "declared digest {} but content hashes to {}",
                    blob.digest.hash(),
                    stored.hash()
                )));
            }
        }
        Ok(())
    }

    fn upload_tree(&self, artifacts: &[(PathBuf, ObjectInfo)]) -> Result<Digest> {
        let mut root = DirBuilder::default();
        for (path, info) in artifacts {
            root.add(path, info.clone())?;
        }
        root.build(self)
    }

    fn retrieve_to_paths(&self, infos: &[ObjectInfo], paths: &[PathBuf]) -> Result<()> {
        if infos.len() != paths.len() {
            return Err(Error::invariant(
                "retrieve_to_paths requires one path per artifact",
            ));
        }
        for (info, path) in infos.iter().zip(paths) {
            match info.object_type {
                ObjectType::Tree => self.materialize_tree(&info.digest, path)?,
                ObjectType::Symlink => {
                    let Some(bytes) = self.storage.read_blob(&info.digest, false)? else {
                        return Err(Self::not_available(&info.digest));
                    };
                    let target = String::from_utf8(bytes).map_err(|_| {
                        Error::corrupt_no_path("symlink target is not UTF-8")
                    })?;
                    make_symlink(&target, path)?;
                }
                kind => self.install_blob(&info.digest, kind, path)?,
            }
        }
        Ok(())
    }

    fn retrieve_to_writers(
        &self,
        infos: &[ObjectInfo],
        writers: &mut [&mut dyn Write],
        raw_tree: bool,
    ) -> Result<()> {
        if infos.len() != writers.len() {
            return Err(Error::invariant(
                "retrieve_to_writers requires one writer per artifact",
            ));
        }
        for (info, writer) in infos.iter().zip(writers.iter_mut()) {
            if !self.storage.dump_to_stream(info, *writer, raw_tree)? {
                return Err(Self::not_available(&info.digest));
            }
        }
        Ok(())
    }

    fn retrieve_to_cas(&self, infos: &[ObjectInfo], other: &dyn ExecutionApi) -> Result<()> {
        if other.hash_protocol() != self.storage.protocol() {
            // crossing protocols is the rehash bridge's job
            return Err(Error::protocol_mismatch(
                self.storage.protocol(),
                other.hash_protocol(),
            ));
        }
        let mut visited = HashSet::new();
        for info in infos {
            self.transfer(info, other, &mut visited)?;
        }
        Ok(())
    }

    fn retrieve_to_memory(&self, info: &ObjectInfo) -> Result<Option<Vec<u8>>> {
        if info.object_type.is_tree() {
            let Some(path) = self.storage.tree_path(&info.digest)? else {
                return Ok(None);
            };
            Ok(Some(
                std::fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?,
            ))
        } else {
            self.storage
                .read_blob(&info.digest, info.object_type.is_executable())
        }
    }
}

fn make_symlink(target: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    if path.exists() || path.is_symlink() {
        std::fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, path).map_err(|e| Error::io(e, path, "symlink"))
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(Error::io_no_path(
            std::io::Error::other("symlinks unsupported on this platform"),
            "symlink",
        ))
    }
}
