//! Persistent mapping between digests of the two hash protocols
//!
//! Each mapping is a small file keyed by source protocol, target protocol
//! and source hash, holding the canonical object-info string of the
//! target-protocol digest. Content addressing makes the mapping
//! write-once: overwriting with the same value is success, a different
//! value is unreachable for non-adversarial callers. Mappings live
//! outside the rotating generation directories and are only ever removed
//! by an operator.

use std::fs;

use strata_core::{Digest, Error, ObjectInfo, ObjectType, Result, StorageConfig};
use strata_storage::write_id_file;
use tracing::debug;

/// Look up the rehashed counterpart of a source digest
///
/// Probes the mapping for generation 0 first, then for older generations;
/// a hit from an older generation is hard-linked forward so future calls
/// resolve immediately. When the filesystem refuses another link
/// (`EMLINK`), the entry is re-written instead.
///
/// Returns `Ok(None)` when no mapping exists.
///
/// # Errors
///
/// Returns an error on I/O failure or an undecodable mapping file.
pub fn read_rehashed_digest(
    digest: &Digest,
    source_config: &StorageConfig,
    target_config: &StorageConfig,
    from_git: bool,
) -> Result<Option<ObjectInfo>> {
    let target_protocol = target_config.protocol();
    let mut found = None;
    for generation in 0..source_config.num_generations() {
        let path =
            source_config.rehash_id_file(target_protocol, digest.hash(), from_git, generation);
        if path.is_file() {
            found = Some((generation, path));
            break;
        }
    }
    let Some((generation, path)) = found else {
        return Ok(None);
    };

    let content = fs::read_to_string(&path).map_err(|e| Error::io(e, &path, "read"))?;
    let info = ObjectInfo::from_string(target_protocol, content.trim())
        .map_err(|e| Error::corrupt(format!("rehash mapping: {e}"), &path))?;

    if generation != 0 {
        // make the mapping immediately visible for future calls
        let dest = source_config.rehash_id_file(target_protocol, digest.hash(), from_git, 0);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        match fs::hard_link(&path, &dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) if is_too_many_links(&e) => {
                write_id_file(&dest, content.trim())?;
            }
            Err(e) => return Err(Error::io(e, &dest, "link")),
        }
    }
    Ok(Some(info))
}

/// Record the rehashed counterpart of a source digest
///
/// # Errors
///
/// Returns an error on I/O failure.
pub fn store_rehashed_digest(
    source_digest: &Digest,
    target_digest: &Digest,
    object_type: ObjectType,
    source_config: &StorageConfig,
    target_config: &StorageConfig,
    from_git: bool,
) -> Result<()> {
    let path = source_config.rehash_id_file(
        target_config.protocol(),
        source_digest.hash(),
        from_git,
        0,
    );
    let info = ObjectInfo::new(target_digest.clone(), object_type);
    debug!(source = %source_digest.hash(), target = %info, "recording rehash mapping");
    write_id_file(&path, &info.to_canonical_string())
}

fn is_too_many_links(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EMLINK)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::HashProtocol;

    fn configs(root: &std::path::Path) -> (StorageConfig, StorageConfig) {
        let source = StorageConfig::new(root);
        let target = StorageConfig::new(root).with_protocol(HashProtocol::Compatible);
        (source, target)
    }

    #[test]
    fn missing_mapping_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = configs(dir.path());
        let digest = Digest::file(HashProtocol::Native, b"unmapped");
        assert!(read_rehashed_digest(&digest, &source, &target, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn store_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = configs(dir.path());

        let native = Digest::file(HashProtocol::Native, b"content");
        let compatible = Digest::file(HashProtocol::Compatible, b"content");
        store_rehashed_digest(&native, &compatible, ObjectType::File, &source, &target, false)
            .unwrap();

        let info = read_rehashed_digest(&native, &source, &target, false)
            .unwrap()
            .unwrap();
        assert_eq!(info.digest, compatible);
        assert_eq!(info.object_type, ObjectType::File);
    }

    #[test]
    fn rewriting_same_value_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = configs(dir.path());

        let native = Digest::file(HashProtocol::Native, b"content");
        let compatible = Digest::file(HashProtocol::Compatible, b"content");
        for _ in 0..2 {
            store_rehashed_digest(
                &native,
                &compatible,
                ObjectType::File,
                &source,
                &target,
                false,
            )
            .unwrap();
        }
        assert!(read_rehashed_digest(&native, &source, &target, false)
            .unwrap()
            .is_some());
    }

    #[test]
    fn hit_in_old_generation_links_forward() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = configs(dir.path());

        let native = Digest::file(HashProtocol::Native, b"aged");
        let compatible = Digest::file(HashProtocol::Compatible, b"aged");

        // seed the generation-1 slot directly
        let old_path =
            source.rehash_id_file(HashProtocol::Compatible, native.hash(), false, 1);
        std::fs::create_dir_all(old_path.parent().unwrap()).unwrap();
        std::fs::write(
            &old_path,
            ObjectInfo::new(compatible.clone(), ObjectType::File).to_canonical_string(),
        )
        .unwrap();

        let info = read_rehashed_digest(&native, &source, &target, false)
            .unwrap()
            .unwrap();
        assert_eq!(info.digest, compatible);

        // the mapping is now present in the generation-0 slot as well
        let new_path =
            source.rehash_id_file(HashProtocol::Compatible, native.hash(), false, 0);
        assert!(new_path.is_file());
    }

    #[test]
    fn from_git_mappings_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = configs(dir.path());

        let native = Digest::file(HashProtocol::Native, b"content");
        let compatible = Digest::file(HashProtocol::Compatible, b"content");
        store_rehashed_digest(&native, &compatible, ObjectType::File, &source, &target, true)
            .unwrap();

        assert!(read_rehashed_digest(&native, &source, &target, false)
            .unwrap()
            .is_none());
        assert!(read_rehashed_digest(&native, &source, &target, true)
            .unwrap()
            .is_some());
    }
}
