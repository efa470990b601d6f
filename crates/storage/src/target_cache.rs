//! Target cache: high-level build results keyed by configuration fingerprint
//!
//! A key is the digest of a JSON document naming the content-fixed
//! repository, the `(module, name)` pair and the canonical effective
//! configuration. Entries are sharded by a description of the remote
//! execution backend so results cached against one backend never pollute
//! another; switching backends is a lookup re-root, never a cache bust.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::{Digest, Error, ObjectInfo, ObjectType, Result};
use tracing::{debug, warn};

use crate::file_store::{FileStore, StoreMode};
use crate::local_cas::LocalCas;

/// Capability to pull artifacts from the companion remote CAS
///
/// [`TargetCache::store`] requires every artifact named by an entry to be
/// made available locally before the entry is published, so local readers
/// can serve it offline.
pub trait RemoteSync {
    /// Retrieve the given artifacts into the local CAS
    ///
    /// # Errors
    ///
    /// Returns an error if any artifact cannot be synchronized.
    fn retrieve_to_local(&self, artifacts: &[ObjectInfo]) -> Result<()>;
}

/// [`RemoteSync`] for setups without a remote endpoint
///
/// Everything named by an entry is already local by construction, so
/// syncing is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

impl RemoteSync for NoRemote {
    fn retrieve_to_local(&self, _artifacts: &[ObjectInfo]) -> Result<()> {
        Ok(())
    }
}

/// Key of a target-cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetCacheKey {
    id: ObjectInfo,
}

impl TargetCacheKey {
    /// Derive the key for a target under an effective configuration
    ///
    /// The key document is stored as a CAS blob; its digest is the key
    /// identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be stored.
    pub fn create(
        cas: &LocalCas,
        repo_key: &str,
        module: &str,
        name: &str,
        effective_config: &str,
    ) -> Result<Self> {
        let target_name = serde_json::to_string(&[module, name])
            .map_err(|e| Error::serialization(e.to_string()))?;
        let desc = serde_json::json!({
            "repo_key": repo_key,
            "target_name": target_name,
            "effective_config": effective_config,
        });
        let bytes = serde_json::to_vec_pretty(&desc)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let digest = cas.store_blob(&bytes, false)?;
        Ok(Self {
            id: ObjectInfo::new(digest, ObjectType::File),
        })
    }

    /// Reconstruct a key from its identity
    #[must_use]
    pub fn from_info(id: ObjectInfo) -> Self {
        Self { id }
    }

    /// Identity of this key
    #[must_use]
    pub fn id(&self) -> &ObjectInfo {
        &self.id
    }
}

/// A target-cache entry: the JSON description of a cached target result
///
/// All artifacts inside must be *known*, i.e. carry a concrete digest; the
/// serializer replaced action-produced artifacts with their result digests
/// before the entry was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCacheEntry {
    desc: Value,
}

impl TargetCacheEntry {
    /// Wrap a target-result description
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the value is not a JSON object.
    pub fn from_json(desc: Value) -> Result<Self> {
        if !desc.is_object() {
            return Err(Error::corrupt_no_path(
                "target-cache entry is not a JSON object",
            ));
        }
        Ok(Self { desc })
    }

    /// The underlying JSON description
    #[must_use]
    pub fn to_json(&self) -> &Value {
        &self.desc
    }

    /// Collect every artifact referenced by this entry
    ///
    /// Walks artifacts, runfiles and the provides map (including nested
    /// target results) with an explicit work stack. Entries referencing a
    /// non-known artifact are corrupt and rejected wholesale.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` on any malformed or non-known artifact reference.
    pub fn artifacts(&self, protocol: strata_core::HashProtocol) -> Result<Vec<ObjectInfo>> {
        let mut infos = Vec::new();
        let mut stack: Vec<&Value> = vec![&self.desc];

        while let Some(result) = stack.pop() {
            let obj = result
                .as_object()
                .ok_or_else(|| Error::corrupt_no_path("target result is not an object"))?;

            for map_key in ["artifacts", "runfiles"] {
                let map = obj
                    .get(map_key)
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        Error::corrupt_no_path(format!("target result lacks '{map_key}' map"))
                    })?;
                for desc in map.values() {
                    infos.push(artifact_info(protocol, desc)?);
                }
            }

            let provides = obj
                .get("provides")
                .and_then(Value::as_object)
                .ok_or_else(|| Error::corrupt_no_path("target result lacks 'provides' map"))?;
            let nodes = provides
                .get("nodes")
                .and_then(Value::as_object)
                .ok_or_else(|| Error::corrupt_no_path("provides map lacks 'nodes'"))?;
            let lookup = |name: &Value| -> Result<&Value> {
                let name = name
                    .as_str()
                    .ok_or_else(|| Error::corrupt_no_path("provides reference is not a string"))?;
                nodes.get(name).ok_or_else(|| {
                    Error::corrupt_no_path(format!("provides reference '{name}' unresolved"))
                })
            };

            for name in provides
                .get("provided_artifacts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                infos.push(artifact_info(protocol, lookup(name)?)?);
            }
            for name in provides
                .get("provided_results")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                stack.push(lookup(name)?);
            }
        }
        Ok(infos)
    }
}

/// Decode one known-artifact description
fn artifact_info(protocol: strata_core::HashProtocol, desc: &Value) -> Result<ObjectInfo> {
    let known = desc
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t == "KNOWN");
    if !known {
        return Err(Error::corrupt_no_path(
            "target-cache entry references a non-known artifact",
        ));
    }
    let data = desc
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::corrupt_no_path("known artifact lacks 'data'"))?;
    let hash = data
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::corrupt_no_path("known artifact lacks 'id'"))?;
    let size = data.get("size").and_then(Value::as_u64).unwrap_or(0);
    let object_type = data
        .get("file_type")
        .and_then(Value::as_str)
        .and_then(|s| s.chars().next())
        .map_or(ObjectType::File, ObjectType::from_char);
    let digest = Digest::new(protocol, hash, size, object_type.is_tree())
        .map_err(|e| Error::corrupt_no_path(format!("known artifact: {e}")))?;
    Ok(ObjectInfo::new(digest, object_type))
}

/// Persistent, sharded map from [`TargetCacheKey`] to [`TargetCacheEntry`]
#[derive(Debug, Clone)]
pub struct TargetCache {
    cas: Arc<LocalCas>,
    root: PathBuf,
    shard: String,
    mode: StoreMode,
    file_store: FileStore,
}

impl TargetCache {
    /// Open the target cache of one generation under the given shard
    #[must_use]
    pub fn new(cas: Arc<LocalCas>, root: impl Into<PathBuf>, shard: impl Into<String>, mode: StoreMode) -> Self {
        let root = root.into();
        let shard = shard.into();
        let file_store = FileStore::new(root.join(&shard), ObjectType::File, mode)
            .with_durability(mode == StoreMode::LastWins);
        Self {
            cas,
            root,
            shard,
            mode,
            file_store,
        }
    }

    /// The same cache re-rooted at another backend shard
    #[must_use]
    pub fn with_shard(&self, shard: impl Into<String>) -> Self {
        Self::new(Arc::clone(&self.cas), self.root.clone(), shard, self.mode)
    }

    /// Shard this cache reads and writes
    #[must_use]
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// The CAS backing this cache
    #[must_use]
    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    /// Compute the backend shard from the remote endpoint description
    ///
    /// The canonical JSON of address and platform properties is stored as a
    /// CAS blob; the entry hash is the shard name. A local-only setup uses
    /// a null address.
    ///
    /// # Errors
    ///
    /// Returns an error if the description cannot be stored.
    pub fn backend_shard(
        cas: &LocalCas,
        remote_address: Option<&str>,
        platform_properties: &Value,
    ) -> Result<String> {
        let desc = serde_json::json!({
            "remote_address": remote_address,
            "platform_properties": platform_properties,
        });
        let bytes = serde_json::to_vec_pretty(&desc)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let digest = cas.store_blob(&bytes, false)?;
        Ok(digest.hash().to_string())
    }

    /// Store an entry for a key
    ///
    /// Every artifact named by the entry is first pulled from the remote
    /// CAS into the local one, so later readers can be served offline; only
    /// then are the entry blob and its indirection file published.
    ///
    /// # Errors
    ///
    /// Returns an error on sync or I/O failure.
    pub fn store(
        &self,
        key: &TargetCacheKey,
        entry: &TargetCacheEntry,
        remote: &dyn RemoteSync,
    ) -> Result<()> {
        let artifacts = entry.artifacts(self.cas.protocol())?;
        remote.retrieve_to_local(&artifacts)?;

        let bytes = serde_json::to_vec_pretty(entry.to_json())
            .map_err(|e| Error::serialization(e.to_string()))?;
        let blob = self.cas.store_blob(&bytes, false)?;
        let data = ObjectInfo::new(blob, ObjectType::File).to_canonical_string();
        debug!(key = %key.id(), entry = %data, "caching target result");
        self.file_store
            .add_from_bytes(key.id().digest.hash(), data.as_bytes())
    }

    /// Read the entry for a key, if present
    ///
    /// A corrupt entry (undecodable indirection, absent blob, malformed
    /// JSON or non-known artifacts) is reported as `Corrupt`, to be treated
    /// as absent and dropped by the caller.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` as described, or any I/O error.
    pub fn read(&self, key: &TargetCacheKey) -> Result<Option<(TargetCacheEntry, ObjectInfo)>> {
        let path = self.file_store.entry_path(key.id().digest.hash());
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let info = ObjectInfo::from_string(self.cas.protocol(), content.trim())
            .map_err(|e| Error::corrupt(format!("target-cache entry: {e}"), &path))?;
        let Some(bytes) = self.cas.read_blob(&info.digest, false)? else {
            return Err(Error::corrupt(
                format!(
                    "target-cache entry references absent blob {}",
                    info.digest.hash()
                ),
                &path,
            ));
        };
        let desc: Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(format!("target-cache entry blob: {e}"), &path))?;
        let entry = TargetCacheEntry::from_json(desc)?;
        // decoding invariant: all artifacts must be known
        entry.artifacts(self.cas.protocol())?;
        Ok(Some((entry, info)))
    }

    /// Uplink an entry from this generation into `latest`
    ///
    /// Artifacts first (trees deeply), then the entry blob, then the
    /// indirection file.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or corrupt persisted state.
    pub fn local_uplink_entry(&self, latest: &Self, key: &TargetCacheKey) -> Result<bool> {
        let hash = key.id().digest.hash();
        let path = self.file_store.entry_path(hash);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let info = ObjectInfo::from_string(self.cas.protocol(), content.trim())
            .map_err(|e| Error::corrupt(format!("target-cache entry: {e}"), &path))?;

        let Some(bytes) = self.cas.read_blob(&info.digest, false)? else {
            return Ok(false);
        };
        let desc: Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(format!("target-cache entry blob: {e}"), &path))?;
        let entry = TargetCacheEntry::from_json(desc)?;

        for artifact in entry.artifacts(self.cas.protocol())? {
            let uplinked = if artifact.object_type.is_tree() {
                self.cas.local_uplink_tree(&latest.cas, &artifact.digest)?
            } else {
                let is_exec = artifact.object_type.is_executable();
                self.cas
                    .local_uplink_blob(&latest.cas, &artifact.digest, is_exec, false)?
            };
            if !uplinked {
                warn!(key = %key.id(), artifact = %artifact.digest.hash(), "target-cache uplink missing artifact");
                return Ok(false);
            }
        }
        if !self
            .cas
            .local_uplink_blob(&latest.cas, &info.digest, false, false)?
        {
            return Ok(false);
        }
        latest.file_store.add_from_file(hash, &path, true)?;
        Ok(true)
    }
}
