//! Atomic placement of content-addressed files
//!
//! A [`FileStore`] installs bytes or an existing file at the deterministic
//! path `root/<ab>/<rest>` (prefix = first hex byte of the identifier).
//! Data is first written to a per-process-and-thread unique staging path on
//! the same filesystem, then moved into place:
//!
//! - *first-wins*: `link` + `unlink`; a concurrent winner surfaces as
//!   `EEXIST`, which is success provided the existing entry is a regular
//!   file. Used for immutable CAS entries.
//! - *last-wins*: plain `rename`, overwriting. Used only for mutable
//!   caches (action/target cache indirection files).

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use strata_core::{Error, ExecWriteMode, ObjectType, Result};
use tracing::trace;

use crate::process;

/// Race resolution policy of a [`FileStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// First thread to place a conflicting file wins
    FirstWins,
    /// Last thread to place a conflicting file wins, overwriting
    LastWins,
}

/// One sharded directory tree of immutable or overwritable files
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    kind: ObjectType,
    mode: StoreMode,
    set_epoch_time: bool,
    durable: bool,
    exec_write_mode: ExecWriteMode,
}

impl FileStore {
    /// Create a store rooted at `root` holding entries of the given kind
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, kind: ObjectType, mode: StoreMode) -> Self {
        Self {
            root: root.into(),
            kind,
            mode,
            set_epoch_time: false,
            durable: false,
            exec_write_mode: ExecWriteMode::InProcess,
        }
    }

    /// Pin entry mtimes to the Unix epoch (CAS entries)
    #[must_use]
    pub fn with_epoch_time(mut self, set_epoch_time: bool) -> Self {
        self.set_epoch_time = set_epoch_time;
        self
    }

    /// Fsync staged bytes before publishing (AC/TC entries)
    #[must_use]
    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Select how executable entries are written
    #[must_use]
    pub fn with_exec_write_mode(mut self, mode: ExecWriteMode) -> Self {
        self.exec_write_mode = mode;
        self
    }

    /// Root directory of this store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path of an entry; pure, no filesystem access
    #[must_use]
    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.root.join(&id[..2]).join(&id[2..])
    }

    fn unix_mode(&self) -> u32 {
        if self.kind.is_executable() { 0o555 } else { 0o444 }
    }

    /// Add an entry from in-memory bytes
    ///
    /// On return the entry exists at [`Self::entry_path`]. A concurrent
    /// writer racing on the same id is indistinguishable from success.
    ///
    /// # Errors
    ///
    /// Returns an error on any I/O failure other than losing a first-wins
    /// race.
    pub fn add_from_bytes(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let target = self.entry_path(id);
        if self.mode == StoreMode::FirstWins && target.is_file() {
            return Ok(());
        }
        self.create_parent(&target)?;
        let staged = process::create_unique_path(&target);
        self.write_staged(&staged, bytes)?;
        self.finalize_entry(&staged)?;
        self.stage(&staged, &target)
    }

    /// Add an entry from an existing file
    ///
    /// With `is_owner` set and in first-wins mode the source is hard-linked
    /// directly when possible (e.g. files generated in an execution
    /// directory); otherwise the content is copied through a staging path.
    ///
    /// # Errors
    ///
    /// Returns an error on any I/O failure other than losing a first-wins
    /// race.
    pub fn add_from_file(&self, id: &str, source: &Path, is_owner: bool) -> Result<()> {
        let target = self.entry_path(id);
        if self.mode == StoreMode::FirstWins && target.is_file() {
            return Ok(());
        }
        self.create_parent(&target)?;

        if self.mode == StoreMode::FirstWins && is_owner {
            match fs::hard_link(source, &target) {
                Ok(()) => {
                    // The linked inode is ours; normalize its permissions.
                    self.finalize_entry(&target)?;
                    trace!(path = %target.display(), "created entry");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return self.verify_regular_file(&target);
                }
                Err(_) => {
                    // Cross-device or permission trouble; fall back to copy.
                }
            }
        }

        let staged = process::create_unique_path(&target);
        self.copy_staged(source, &staged)?;
        self.finalize_entry(&staged)?;
        self.stage(&staged, &target)
    }

    fn create_parent(&self, target: &Path) -> Result<()> {
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))
    }

    fn write_staged(&self, staged: &Path, bytes: &[u8]) -> Result<()> {
        process::write_file_with_mode(staged, bytes, self.unix_mode(), self.exec_write_mode)?;
        if self.durable {
            let file = fs::File::open(staged).map_err(|e| Error::io(e, staged, "open"))?;
            file.sync_all().map_err(|e| Error::io(e, staged, "fsync"))?;
        }
        Ok(())
    }

    fn copy_staged(&self, source: &Path, staged: &Path) -> Result<()> {
        if self.kind.is_executable() && self.exec_write_mode == ExecWriteMode::ForkedChild {
            // Copy through the forked writer so no writable descriptor on
            // the executable exists in this process.
            let bytes = fs::read(source).map_err(|e| Error::io(e, source, "read"))?;
            return process::write_file_with_mode(
                staged,
                &bytes,
                self.unix_mode(),
                self.exec_write_mode,
            );
        }
        fs::copy(source, staged).map_err(|e| Error::io(e, staged, "copy"))?;
        process::set_permissions(staged, self.unix_mode())
    }

    fn finalize_entry(&self, path: &Path) -> Result<()> {
        process::set_permissions(path, self.unix_mode())?;
        if self.set_epoch_time {
            process::set_epoch_time(path)?;
        }
        Ok(())
    }

    fn stage(&self, staged: &Path, target: &Path) -> Result<()> {
        match self.mode {
            StoreMode::FirstWins => match fs::hard_link(staged, target) {
                Ok(()) => {
                    let _ = fs::remove_file(staged);
                    trace!(path = %target.display(), "created entry");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let _ = fs::remove_file(staged);
                    self.verify_regular_file(target)
                }
                Err(e) => {
                    let _ = fs::remove_file(staged);
                    Err(Error::io(e, target, "link"))
                }
            },
            StoreMode::LastWins => fs::rename(staged, target).map_err(|e| {
                let _ = fs::remove_file(staged);
                Error::io(e, target, "rename")
            }),
        }
    }

    fn verify_regular_file(&self, target: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(target).map_err(|e| Error::io(e, target, "stat"))?;
        if meta.is_file() {
            Ok(())
        } else {
            Err(Error::corrupt("existing entry is not a regular file", target))
        }
    }
}

/// Write a small id file atomically via staging and rename
///
/// Used for tree-map entries and similar indirection files living outside
/// the file stores. The content is fsynced before the rename.
///
/// # Errors
///
/// Returns an error on any I/O failure.
pub fn write_id_file(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::io_no_path(std::io::Error::other("path has no parent"), "write"))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    let staged = process::create_unique_path(path);
    let mut file = fs::File::create(&staged).map_err(|e| Error::io(e, &staged, "create"))?;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::io(e, &staged, "write"))?;
    file.sync_all().map_err(|e| Error::io(e, &staged, "fsync"))?;
    drop(file);
    fs::rename(&staged, path).map_err(|e| {
        let _ = fs::remove_file(&staged);
        Error::io(e, path, "rename")
    })
}

/// Read a small id file written by [`write_id_file`]
///
/// # Errors
///
/// Returns an error on I/O failures other than the file being absent.
pub fn read_id_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(e, path, "read")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store(root: &Path, mode: StoreMode) -> FileStore {
        FileStore::new(root, ObjectType::File, mode).with_epoch_time(true)
    }

    const ID: &str = "30d74d258442c7c65512eafab474568dd706c430";

    #[test]
    fn add_from_bytes_places_sharded_entry() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = store(dir.path(), StoreMode::FirstWins);
        fs_store.add_from_bytes(ID, b"test").unwrap();

        let path = fs_store.entry_path(ID);
        assert!(path.starts_with(dir.path().join("30")));
        assert_eq!(fs::read(&path).unwrap(), b"test");
        assert_eq!(
            fs::metadata(&path).unwrap().modified().unwrap(),
            std::time::UNIX_EPOCH
        );
    }

    #[test]
    fn first_wins_keeps_first_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = store(dir.path(), StoreMode::FirstWins);
        fs_store.add_from_bytes(ID, b"first").unwrap();
        fs_store.add_from_bytes(ID, b"second").unwrap();
        assert_eq!(fs::read(fs_store.entry_path(ID)).unwrap(), b"first");
    }

    #[test]
    fn last_wins_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FileStore::new(dir.path(), ObjectType::File, StoreMode::LastWins);
        fs_store.add_from_bytes(ID, b"first").unwrap();
        fs_store.add_from_bytes(ID, b"second").unwrap();
        assert_eq!(fs::read(fs_store.entry_path(ID)).unwrap(), b"second");
    }

    #[test]
    fn concurrent_first_wins_leaves_one_entry_and_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = Arc::new(store(dir.path(), StoreMode::FirstWins));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs_store = Arc::clone(&fs_store);
                std::thread::spawn(move || fs_store.add_from_bytes(ID, b"test"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let shard = dir.path().join(&ID[..2]);
        let entries: Vec<_> = fs::read_dir(&shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(fs::read(fs_store.entry_path(ID)).unwrap(), b"test");
    }

    #[test]
    fn add_from_file_with_ownership_hard_links() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::write(&source, b"test").unwrap();

        let fs_store = store(&dir.path().join("store"), StoreMode::FirstWins);
        fs_store.add_from_file(ID, &source, true).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let a = fs::metadata(&source).unwrap().ino();
            let b = fs::metadata(fs_store.entry_path(ID)).unwrap().ino();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn add_from_file_without_ownership_copies() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::write(&source, b"test").unwrap();

        let fs_store = store(&dir.path().join("store"), StoreMode::FirstWins);
        fs_store.add_from_file(ID, &source, false).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let a = fs::metadata(&source).unwrap().ino();
            let b = fs::metadata(fs_store.entry_path(ID)).unwrap().ino();
            assert_ne!(a, b);
        }
        assert_eq!(fs::read(fs_store.entry_path(ID)).unwrap(), b"test");
    }

    #[test]
    fn executable_store_sets_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FileStore::new(dir.path(), ObjectType::Executable, StoreMode::FirstWins);
        fs_store.add_from_bytes(ID, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(fs_store.entry_path(ID)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o555);
        }
    }

    #[test]
    fn id_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps").join("entry");
        assert_eq!(read_id_file(&path).unwrap(), None);
        write_id_file(&path, "tree-id\n").unwrap();
        assert_eq!(read_id_file(&path).unwrap(), Some("tree-id".to_string()));
        write_id_file(&path, "other").unwrap();
        assert_eq!(read_id_file(&path).unwrap(), Some("other".to_string()));
    }
}
