//! Storage configuration
//!
//! A [`StorageConfig`] is an explicit value owned by the application entry
//! point and threaded through every operation; there are no process-global
//! accessors. The hash protocol is decided at construction and immutable
//! afterwards, so every path computation below is a pure function of the
//! config.
//!
//! ## On-disk layout
//!
//! ```text
//! <build_root>/
//!   gc.lock
//!   <protocol-tag>/                  # "git-sha1" or "compatible-sha256"
//!     generation-0/
//!       ephemeral/                   # scratch; safe to wipe
//!       casf/ casx/ cast/            # object CAS lanes
//!       cas-large-f/ cas-large-t/    # large-object manifests
//!       ac/  tc/<shard>/             # action / target cache
//!       validated-trees/             # tree verification markers
//!     generation-1/ ...
//!   tree-map/ commit-tree-map/ ...   # id files outside the generations
//!   rehash/<src>-to-<tgt>/           # cross-protocol digest mappings
//! ```

use crate::hash::HashProtocol;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Default number of storage generations
pub const DEFAULT_NUM_GENERATIONS: usize = 2;

/// Environment variable overriding the build root
pub const ENV_BUILD_ROOT: &str = "STRATA_BUILD_ROOT";

/// Environment variable selecting the compatible hash protocol
pub const ENV_COMPATIBLE: &str = "STRATA_COMPATIBLE";

/// How executable blobs are written to disk
///
/// Writing executables through a forked child avoids writable descriptors
/// on executable files being inherited by concurrently spawned child
/// processes (`ETXTBSY`). Tests inject the in-process variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecWriteMode {
    /// Route the write/copy syscall sequence through a forked child
    ForkedChild,
    /// Perform the write in-process
    InProcess,
}

/// Global storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    build_root: PathBuf,
    num_generations: usize,
    protocol: HashProtocol,
    exec_write_mode: ExecWriteMode,
}

/// Paths of one storage generation
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Hash protocol of the owning storage
    pub protocol: HashProtocol,
    /// File CAS lane
    pub cas_file: PathBuf,
    /// Executable CAS lane
    pub cas_exec: PathBuf,
    /// Tree CAS lane; collapses into the file lane in compatible mode
    pub cas_tree: PathBuf,
    /// Large-object manifests for file blobs
    pub cas_large_file: PathBuf,
    /// Large-object manifests for trees
    pub cas_large_tree: PathBuf,
    /// Action cache directory
    pub action_cache: PathBuf,
    /// Target cache directory (sharded below)
    pub target_cache: PathBuf,
    /// Marker files for trees whose invariants have been verified
    pub validated_trees: PathBuf,
}

impl StorageConfig {
    /// Create a configuration rooted at the given directory
    #[must_use]
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            num_generations: DEFAULT_NUM_GENERATIONS,
            protocol: HashProtocol::Native,
            exec_write_mode: ExecWriteMode::ForkedChild,
        }
    }

    /// Default build root: `<user cache dir>/strata`
    #[must_use]
    pub fn default_build_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("strata")
    }

    /// Create a configuration from the environment
    ///
    /// Honors [`ENV_BUILD_ROOT`] for the root directory and
    /// [`ENV_COMPATIBLE`] (`1`/`true`/`yes`) for protocol selection. No
    /// other environment variables are consulted.
    #[must_use]
    pub fn from_env() -> Self {
        let build_root = std::env::var_os(ENV_BUILD_ROOT)
            .map_or_else(Self::default_build_root, PathBuf::from);
        let mut config = Self::new(build_root);
        if let Ok(value) = std::env::var(ENV_COMPATIBLE) {
            if matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                config.protocol = HashProtocol::Compatible;
            }
        }
        tracing::debug!(
            root = %config.build_root.display(),
            protocol = %config.protocol,
            "storage configuration from environment"
        );
        config
    }

    /// Set the number of generations (must be at least 1)
    ///
    /// # Errors
    ///
    /// Returns an error if `num_generations` is zero.
    pub fn with_num_generations(mut self, num_generations: usize) -> Result<Self> {
        if num_generations == 0 {
            return Err(Error::invariant("number of generations must be at least 1"));
        }
        self.num_generations = num_generations;
        Ok(self)
    }

    /// Set the hash protocol
    #[must_use]
    pub fn with_protocol(mut self, protocol: HashProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the executable write mode
    #[must_use]
    pub fn with_exec_write_mode(mut self, mode: ExecWriteMode) -> Self {
        self.exec_write_mode = mode;
        self
    }

    /// Root directory of all storage
    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Number of storage generations
    #[must_use]
    pub fn num_generations(&self) -> usize {
        self.num_generations
    }

    /// Configured hash protocol
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.protocol
    }

    /// Configured executable write mode
    #[must_use]
    pub fn exec_write_mode(&self) -> ExecWriteMode {
        self.exec_write_mode
    }

    /// Path of the advisory lock file serializing GC against all activity
    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.build_root.join("gc.lock")
    }

    /// Root of the generation directories for the configured protocol
    #[must_use]
    pub fn protocol_root(&self) -> PathBuf {
        self.build_root.join(self.protocol.dir_tag())
    }

    /// Root directory of one storage generation
    #[must_use]
    pub fn generation_cache_root(&self, generation: usize) -> PathBuf {
        debug_assert!(generation < self.num_generations);
        self.protocol_root().join(format!("generation-{generation}"))
    }

    /// Root for ephemeral directories, wiped wholesale by GC rotation
    #[must_use]
    pub fn ephemeral_root(&self) -> PathBuf {
        self.generation_cache_root(0).join("ephemeral")
    }

    /// Root for per-action execution workspaces
    #[must_use]
    pub fn exec_root(&self) -> PathBuf {
        self.ephemeral_root().join("exec_root")
    }

    /// Create a scoped tmp directory for a specific kind of operation
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// tmp directory cannot be allocated.
    pub fn create_typed_tmp_dir(&self, kind: &str) -> Result<tempfile::TempDir> {
        let parent = self.ephemeral_root().join("tmp-workspaces").join(kind);
        std::fs::create_dir_all(&parent)
            .map_err(|e| Error::io(e, &parent, "create_dir_all"))?;
        tempfile::TempDir::new_in(&parent).map_err(|e| Error::io(e, &parent, "tempdir"))
    }

    /// Paths of one storage generation
    ///
    /// In compatible mode trees share both encoding space and hashing with
    /// blobs, so the tree lane collapses into the file lane.
    #[must_use]
    pub fn generation_config(&self, generation: usize) -> GenerationConfig {
        let root = self.generation_cache_root(generation);
        let compatible = self.protocol == HashProtocol::Compatible;
        GenerationConfig {
            protocol: self.protocol,
            cas_file: root.join("casf"),
            cas_exec: root.join("casx"),
            cas_tree: root.join(if compatible { "casf" } else { "cast" }),
            cas_large_file: root.join("cas-large-f"),
            cas_large_tree: root.join(if compatible { "cas-large-f" } else { "cas-large-t" }),
            action_cache: root.join("ac"),
            target_cache: root.join("tc"),
            validated_trees: root.join("validated-trees"),
        }
    }

    /// Id file recording the tree imported for an archive-like content blob
    #[must_use]
    pub fn archive_tree_id_file(&self, repo_type: &str, content: &str) -> PathBuf {
        self.build_root.join("tree-map").join(repo_type).join(content)
    }

    /// Id file recording the tree of a known commit
    #[must_use]
    pub fn commit_tree_id_file(&self, commit: &str) -> PathBuf {
        self.build_root.join("commit-tree-map").join(commit)
    }

    /// Id file recording the tree of a distfile content blob
    #[must_use]
    pub fn distdir_tree_id_file(&self, content: &str) -> PathBuf {
        self.build_root.join("distfiles-tree-map").join(content)
    }

    /// Id file recording a specially resolved tree
    #[must_use]
    pub fn resolved_tree_id_file(&self, mode: &str, tree_hash: &str) -> PathBuf {
        self.build_root
            .join("special-tree-map")
            .join(mode)
            .join(tree_hash)
    }

    /// Rehash mapping file for a source digest
    ///
    /// Mappings live outside the rotating generation directories and are
    /// never garbage collected; an operator wipes them explicitly. The
    /// `generation` parameter addresses historical entries for forward
    /// linking; current writers only produce generation 0, which maps to
    /// the bare directory.
    #[must_use]
    pub fn rehash_id_file(
        &self,
        target_protocol: HashProtocol,
        source_hash: &str,
        from_git: bool,
        generation: usize,
    ) -> PathBuf {
        let mut dir_name = format!("{}-to-{}", self.protocol.dir_tag(), target_protocol.dir_tag());
        if from_git {
            dir_name.push_str("-from-git");
        }
        let mut dir = self.build_root.join("rehash").join(dir_name);
        if generation > 0 {
            dir = dir.join(format!("generation-{generation}"));
        }
        dir.join(&source_hash[..2]).join(&source_hash[2..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_roots_are_protocol_separated() {
        let native = StorageConfig::new("/tmp/root");
        let compatible = StorageConfig::new("/tmp/root").with_protocol(HashProtocol::Compatible);
        assert_eq!(
            native.generation_cache_root(0),
            PathBuf::from("/tmp/root/git-sha1/generation-0")
        );
        assert_eq!(
            compatible.generation_cache_root(0),
            PathBuf::from("/tmp/root/compatible-sha256/generation-0")
        );
    }

    #[test]
    fn tree_lane_collapses_in_compatible_mode() {
        let native = StorageConfig::new("/tmp/root").generation_config(0);
        assert_ne!(native.cas_tree, native.cas_file);

        let compatible = StorageConfig::new("/tmp/root")
            .with_protocol(HashProtocol::Compatible)
            .generation_config(0);
        assert_eq!(compatible.cas_tree, compatible.cas_file);
        assert_eq!(compatible.cas_large_tree, compatible.cas_large_file);
    }

    #[test]
    fn zero_generations_rejected() {
        assert!(StorageConfig::new("/tmp/root").with_num_generations(0).is_err());
        assert!(StorageConfig::new("/tmp/root").with_num_generations(1).is_ok());
    }

    #[test]
    fn lock_file_sits_at_the_root() {
        let config = StorageConfig::new("/tmp/root");
        assert_eq!(config.lock_file_path(), PathBuf::from("/tmp/root/gc.lock"));
    }

    #[test]
    fn rehash_id_file_sharding() {
        let config = StorageConfig::new("/tmp/root");
        let hash = "30d74d258442c7c65512eafab474568dd706c430";
        let path = config.rehash_id_file(HashProtocol::Compatible, hash, false, 0);
        assert_eq!(
            path,
            PathBuf::from("/tmp/root/rehash/git-sha1-to-compatible-sha256")
                .join("30")
                .join("d74d258442c7c65512eafab474568dd706c430")
        );

        let from_git = config.rehash_id_file(HashProtocol::Compatible, hash, true, 1);
        assert!(from_git
            .to_string_lossy()
            .contains("git-sha1-to-compatible-sha256-from-git/generation-1"));
    }

    #[test]
    fn tree_map_id_files_live_outside_the_generations() {
        let config = StorageConfig::new("/tmp/root");
        assert_eq!(
            config.archive_tree_id_file("archive", "abc"),
            PathBuf::from("/tmp/root/tree-map/archive/abc")
        );
        assert_eq!(
            config.commit_tree_id_file("deadbeef"),
            PathBuf::from("/tmp/root/commit-tree-map/deadbeef")
        );
        assert_eq!(
            config.distdir_tree_id_file("abc"),
            PathBuf::from("/tmp/root/distfiles-tree-map/abc")
        );
        assert_eq!(
            config.resolved_tree_id_file("ignore-special", "abc"),
            PathBuf::from("/tmp/root/special-tree-map/ignore-special/abc")
        );
    }

    #[test]
    fn typed_tmp_dir_is_below_ephemeral_root() {
        let root = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(root.path());
        let tmp = config.create_typed_tmp_dir("fetch").unwrap();
        assert!(tmp.path().starts_with(config.ephemeral_root()));
    }
}
