//! Garbage collection by generation rotation
//!
//! A single advisory lock file serializes collection against all other
//! storage activity: every reader and writer holds it *shared* for the
//! duration of its operation, the collector holds it *exclusive* only for
//! the critical renaming section. Rotation renames each generation
//! directory down one slot; the oldest becomes a uniquely named tombstone
//! that is removed outside the lock. Because uplinks happened during
//! normal reads under the shared lock, a rotation drops exactly the
//! objects not read since the previous rotation. Wall-clock age plays no
//! role.

use std::fs;
use std::path::PathBuf;

use strata_core::{Error, Result, StorageConfig};
use tracing::{debug, warn};

use crate::process;

/// Held advisory lock on the storage; released on drop
#[derive(Debug)]
pub struct LockFile {
    file: fs::File,
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}

fn open_lock_file(config: &StorageConfig) -> Result<(fs::File, PathBuf)> {
    let path = config.lock_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| Error::lock(e, &path, "open"))?;
    Ok((file, path))
}

/// Acquire the storage lock shared; blocks until available
///
/// # Errors
///
/// Returns an error if the lock file cannot be opened or locked.
pub fn shared_lock(config: &StorageConfig) -> Result<LockFile> {
    let (file, path) = open_lock_file(config)?;
    loop {
        match fs2::FileExt::lock_shared(&file) {
            Ok(()) => return Ok(LockFile { file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::lock(e, &path, "shared")),
        }
    }
}

/// Acquire the storage lock exclusive; blocks until available
///
/// # Errors
///
/// Returns an error if the lock file cannot be opened or locked.
pub fn exclusive_lock(config: &StorageConfig) -> Result<LockFile> {
    let (file, path) = open_lock_file(config)?;
    loop {
        match fs2::FileExt::lock_exclusive(&file) {
            Ok(()) => return Ok(LockFile { file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::lock(e, &path, "exclusive")),
        }
    }
}

/// Bounded-space eviction by renaming generation directories down one slot
#[derive(Debug)]
pub struct GarbageCollector;

impl GarbageCollector {
    const TOMBSTONE_PREFIX: &'static str = "remove-me-";

    /// Run one collection round
    ///
    /// Tombstones left behind by crashed collectors are removed first
    /// (fatal on failure). The rotation itself runs under the exclusive
    /// lock; removing the fresh tombstone afterwards is best-effort.
    ///
    /// # Errors
    ///
    /// Returns an error if stale tombstones cannot be removed, the lock
    /// cannot be acquired, or a rename fails.
    pub fn trigger_garbage_collection(config: &StorageConfig) -> Result<()> {
        let protocol_root = config.protocol_root();
        Self::remove_stale_tombstones(&protocol_root)?;

        let tombstone = protocol_root.join(format!(
            "{}{}",
            Self::TOMBSTONE_PREFIX,
            process::process_unique_id()
        ));

        {
            let _lock = exclusive_lock(config)?;
            for index in (0..config.num_generations()).rev() {
                let source = config.generation_cache_root(index);
                if !source.is_dir() {
                    // partially populated sets are legal
                    continue;
                }
                let destination = if index + 1 == config.num_generations() {
                    tombstone.clone()
                } else {
                    protocol_root.join(format!("generation-{}", index + 1))
                };
                fs::rename(&source, &destination)
                    .map_err(|e| Error::io(e, &source, "rename"))?;
                debug!(
                    from = %source.display(),
                    to = %destination.display(),
                    "rotated generation"
                );
            }
        }

        if tombstone.is_dir() {
            if let Err(e) = fs::remove_dir_all(&tombstone) {
                warn!(path = %tombstone.display(), error = %e, "failed to remove tombstone");
            }
        }
        Ok(())
    }

    fn remove_stale_tombstones(protocol_root: &std::path::Path) -> Result<()> {
        if !protocol_root.is_dir() {
            return Ok(());
        }
        let entries = fs::read_dir(protocol_root)
            .map_err(|e| Error::io(e, protocol_root, "read_dir"))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, protocol_root, "read_dir"))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(Self::TOMBSTONE_PREFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(|e| Error::io(e, &path, "remove_dir_all"))?;
                debug!(path = %path.display(), "removed stale tombstone");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Generation;

    fn config_at(root: &std::path::Path) -> StorageConfig {
        StorageConfig::new(root).with_num_generations(2).unwrap()
    }

    #[test]
    fn rotation_moves_generation_down_one_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());

        let gen0 = Generation::open(&config, 0);
        let digest = gen0.cas().store_blob(b"test", false).unwrap();

        GarbageCollector::trigger_garbage_collection(&config).unwrap();

        let gen0 = Generation::open(&config, 0);
        let gen1 = Generation::open(&config, 1);
        assert!(gen0.cas().blob_path_no_sync(&digest, false).unwrap().is_none());
        assert!(gen1.cas().blob_path_no_sync(&digest, false).unwrap().is_some());
    }

    #[test]
    fn two_rotations_without_reads_empty_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());

        let gen0 = Generation::open(&config, 0);
        let digest = gen0.cas().store_blob(b"test", false).unwrap();

        GarbageCollector::trigger_garbage_collection(&config).unwrap();
        GarbageCollector::trigger_garbage_collection(&config).unwrap();

        for index in 0..config.num_generations() {
            let generation = Generation::open(&config, index);
            assert!(generation
                .cas()
                .blob_path_no_sync(&digest, false)
                .unwrap()
                .is_none());
        }
        // no tombstone left behind
        let leftovers: Vec<_> = fs::read_dir(config.protocol_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("remove-me-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn gc_on_empty_store_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        GarbageCollector::trigger_garbage_collection(&config).unwrap();
    }

    #[test]
    fn stale_tombstone_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());

        let stale = config.protocol_root().join("remove-me-12345-9");
        fs::create_dir_all(stale.join("casf")).unwrap();
        fs::write(stale.join("casf/leftover"), b"junk").unwrap();

        GarbageCollector::trigger_garbage_collection(&config).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn shared_locks_are_reentrant_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        let a = shared_lock(&config).unwrap();
        let b = shared_lock(&config).unwrap();
        drop(a);
        drop(b);
        let _exclusive = exclusive_lock(&config).unwrap();
    }
}
