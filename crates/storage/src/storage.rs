//! The storage facade: youngest-generation access with uplink on every read
//!
//! From the outside a [`Storage`] behaves like a single generation: writes
//! go to generation 0, reads probe all generations. Any read that hits an
//! older generation restores the object, transitively, into generation 0
//! before returning. Every operation holds the advisory storage lock
//! shared for its duration, so a concurrent garbage collection can never
//! rotate directories underneath it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use strata_core::{Digest, HashProtocol, ObjectInfo, Result, StorageConfig};

use crate::action_cache::{ActionCache, ActionResult};
use crate::file_store::StoreMode;
use crate::gc::{self, LockFile};
use crate::generation::Generation;
use crate::local_cas::LocalCas;
use crate::target_cache::{RemoteSync, TargetCache, TargetCacheEntry, TargetCacheKey};
use crate::uplink::GlobalUplinker;

/// Generation-set storage with global uplinking
#[derive(Debug)]
pub struct Storage {
    config: StorageConfig,
    cas: Arc<LocalCas>,
    ac: ActionCache,
    tc: TargetCache,
    uplinker: GlobalUplinker,
}

impl Storage {
    /// Open the storage with the default (local-only) backend shard
    ///
    /// # Errors
    ///
    /// Returns an error if the shard description cannot be recorded.
    pub fn create(config: &StorageConfig) -> Result<Self> {
        Self::create_with_backend(config, None, &serde_json::json!({}))
    }

    /// Open the storage, sharding the target cache by the backend description
    ///
    /// The shard is computed once from the canonical JSON of the remote
    /// endpoint address and platform properties.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard description cannot be recorded.
    pub fn create_with_backend(
        config: &StorageConfig,
        remote_address: Option<&str>,
        platform_properties: &Value,
    ) -> Result<Self> {
        let gen_config = config.generation_config(Generation::YOUNGEST);
        let cas = Arc::new(LocalCas::new(&gen_config, config.exec_write_mode()));
        // Failed results must be overwritable by a successful rerun, so the
        // active caches place entries last-wins.
        let ac = ActionCache::new(Arc::clone(&cas), &gen_config.action_cache, StoreMode::LastWins);
        let shard = TargetCache::backend_shard(&cas, remote_address, platform_properties)?;
        let tc = TargetCache::new(
            Arc::clone(&cas),
            &gen_config.target_cache,
            shard,
            StoreMode::LastWins,
        );
        Ok(Self {
            config: config.clone(),
            cas,
            ac,
            tc,
            uplinker: GlobalUplinker::new(config),
        })
    }

    /// Configuration this storage was opened with
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Hash protocol of this storage
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.config.protocol()
    }

    /// Backend shard of the target cache
    #[must_use]
    pub fn backend_shard(&self) -> &str {
        self.tc.shard()
    }

    /// The youngest generation's CAS (reads do not uplink through this)
    #[must_use]
    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    fn lock(&self) -> Result<LockFile> {
        gc::shared_lock(&self.config)
    }

    /// Store a blob into generation 0
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_blob(&self, data: &[u8], is_executable: bool) -> Result<Digest> {
        let _lock = self.lock()?;
        self.cas.store_blob(data, is_executable)
    }

    /// Store a blob from a file into generation 0
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
        let _lock = self.lock()?;
        self.cas.store_blob_from_file(source, is_executable, is_owner)
    }

    /// Store a tree into generation 0, verifying its invariants
    ///
    /// # Errors
    ///
    /// See [`LocalCas::store_tree`].
    pub fn store_tree(&self, data: &[u8]) -> Result<Digest> {
        let _lock = self.lock()?;
        self.cas.store_tree(data)
    }

    /// Path of a blob; a hit in an older generation uplinks it first
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn blob_path(&self, digest: &Digest, is_executable: bool) -> Result<Option<PathBuf>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_blob(digest, is_executable)?;
        self.cas.blob_path(digest, is_executable)
    }

    /// Path of a tree; a hit in an older generation uplinks it deeply first
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn tree_path(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_tree(digest)?;
        self.cas.tree_path(digest)
    }

    /// Read the raw bytes of a blob, uplinking on hit
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or protocol mismatch.
    pub fn read_blob(&self, digest: &Digest, is_executable: bool) -> Result<Option<Vec<u8>>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_blob(digest, is_executable)?;
        self.cas.read_blob(digest, is_executable)
    }

    /// Immediate children of a tree, uplinking the tree on hit
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt encoding.
    pub fn read_tree_direct(
        &self,
        digest: &Digest,
        parent: &Path,
    ) -> Result<Option<Vec<(PathBuf, ObjectInfo)>>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_tree(digest)?;
        self.cas.read_tree_direct(digest, parent)
    }

    /// All file-like leaves of a tree, uplinking the tree on hit
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt encoding.
    pub fn read_tree_recursive(
        &self,
        digest: &Digest,
        parent: &Path,
    ) -> Result<Option<Vec<(PathBuf, ObjectInfo)>>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_tree(digest)?;
        self.cas.read_tree_recursive(digest, parent)
    }

    /// Stream an object to a sink, uplinking on hit
    ///
    /// Returns `Ok(false)` if the object is present in no generation.
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
        let _lock = self.lock()?;
        if info.object_type.is_tree() {
            self.uplinker.uplink_tree(&info.digest)?;
        } else {
            self.uplinker
                .uplink_blob(&info.digest, info.object_type.is_executable())?;
        }
        self.cas.dump_to_stream(info, sink, raw_tree)
    }

    /// Store an action result into generation 0, last-wins
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_action_result(&self, action_id: &Digest, result: &ActionResult) -> Result<()> {
        let _lock = self.lock()?;
        self.ac.store_result(action_id, result)
    }

    /// Read a cached action result, uplinking entry and artifacts on hit
    ///
    /// Failed results (non-zero exit code) are returned like any other;
    /// refusing to short-circuit on them is the caller's contract.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` for undecodable persisted state.
    pub fn cached_action_result(&self, action_id: &Digest) -> Result<Option<ActionResult>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_action_cache_entry(action_id)?;
        self.ac.read_result(action_id)
    }

    /// Derive the target-cache key for a target
    ///
    /// # Errors
    ///
    /// Returns an error if the key document cannot be stored.
    pub fn target_cache_key(
        &self,
        repo_key: &str,
        module: &str,
        name: &str,
        effective_config: &str,
    ) -> Result<TargetCacheKey> {
        let _lock = self.lock()?;
        TargetCacheKey::create(&self.cas, repo_key, module, name, effective_config)
    }

    /// Store a target-cache entry, syncing its artifacts from the remote
    ///
    /// # Errors
    ///
    /// Returns an error on sync or I/O failure.
    pub fn store_target(
        &self,
        key: &TargetCacheKey,
        entry: &TargetCacheEntry,
        remote: &dyn RemoteSync,
    ) -> Result<()> {
        let _lock = self.lock()?;
        self.tc.store(key, entry, remote)
    }

    /// Read a target-cache entry, uplinking it with all artifacts on hit
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` for undecodable persisted state.
    pub fn read_target(
        &self,
        key: &TargetCacheKey,
    ) -> Result<Option<(TargetCacheEntry, ObjectInfo)>> {
        let _lock = self.lock()?;
        self.uplinker
            .uplink_target_cache_entry(key, self.tc.shard())?;
        self.tc.read(key)
    }

    /// Split a stored blob into chunks with a manifest
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn split_blob(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let _lock = self.lock()?;
        self.cas.split_blob(digest)
    }

    /// Reassemble a blob from a manifest, uplinking the manifest on hit
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or corrupt manifest/chunks.
    pub fn splice_blob(&self, digest: &Digest) -> Result<Option<PathBuf>> {
        let _lock = self.lock()?;
        self.uplinker.uplink_large_blob(digest)?;
        self.cas.splice_blob(digest)
    }
}
