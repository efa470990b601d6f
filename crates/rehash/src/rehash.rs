//! Rehashing objects from one protocol's storage into the other's
//!
//! Blobs are read from the source CAS (or fetched from the companion
//! remote when absent locally) and re-stored in the target CAS. Trees
//! recurse: children are rehashed first, then a target-protocol tree is
//! built from the rehashed children and stored, so the target side's
//! recursive-satisfiability invariant holds throughout. Every translation
//! is memoized through the mapping cache.

use strata_api::ApiBundle;
use strata_core::{Digest, Error, ObjectInfo, ObjectType, Result};
use strata_storage::tree::{self, TreeEntry};
use strata_storage::Storage;

use crate::cache::{read_rehashed_digest, store_rehashed_digest};

/// Translate object infos from the source storage into the target storage
///
/// Returns the target-protocol infos in input order. Already-known
/// mappings are served from the cache without touching object content.
///
/// # Errors
///
/// Returns an error if an object is available neither locally nor through
/// the optional remote, or on any storage failure.
pub fn rehash_digest(
    infos: &[ObjectInfo],
    source: &Storage,
    target: &Storage,
    apis: Option<&ApiBundle>,
) -> Result<Vec<ObjectInfo>> {
    if source.protocol() == target.protocol() {
        return Err(Error::protocol_mismatch(
            source.protocol(),
            target.protocol(),
        ));
    }
    let mut out = Vec::with_capacity(infos.len());
    for info in infos {
        out.push(rehash_object(info, source, target, apis)?);
    }
    Ok(out)
}

fn rehash_object(
    info: &ObjectInfo,
    source: &Storage,
    target: &Storage,
    apis: Option<&ApiBundle>,
) -> Result<ObjectInfo> {
    if let Some(cached) =
        read_rehashed_digest(&info.digest, source.config(), target.config(), false)?
    {
        return Ok(cached);
    }
    if info.object_type.is_tree() {
        rehash_tree(&info.digest, source, target, apis)
    } else {
        rehash_blob(info, source, target, apis)
    }
}

fn rehash_blob(
    info: &ObjectInfo,
    source: &Storage,
    target: &Storage,
    apis: Option<&ApiBundle>,
) -> Result<ObjectInfo> {
    let is_executable = info.object_type.is_executable();
    let bytes = match source.read_blob(&info.digest, is_executable)? {
        Some(bytes) => bytes,
        None => match apis {
            Some(apis) => apis
                .remote
                .retrieve_to_memory(info)?
                .ok_or_else(|| missing(&info.digest))?,
            None => return Err(missing(&info.digest)),
        },
    };
    let target_digest = target.store_blob(&bytes, is_executable)?;
    store_rehashed_digest(
        &info.digest,
        &target_digest,
        info.object_type,
        source.config(),
        target.config(),
        false,
    )?;
    Ok(ObjectInfo::new(target_digest, info.object_type))
}

fn rehash_tree(
    digest: &Digest,
    source: &Storage,
    target: &Storage,
    apis: Option<&ApiBundle>,
) -> Result<ObjectInfo> {
    let entries = if source.tree_path(digest)?.is_some() {
        source
            .cas()
            .read_tree_entries(digest)?
            .ok_or_else(|| missing(digest))?
    } else if let Some(apis) = apis {
        // parse the remote encoding directly; children resolve one by one
        let info = ObjectInfo::new(digest.clone(), ObjectType::Tree);
        let Some(bytes) = apis.remote.retrieve_to_memory(&info)? else {
            return Err(missing(digest));
        };
        tree::parse(source.protocol(), &bytes)?
    } else {
        return Err(missing(digest));
    };

    let mut target_entries = Vec::with_capacity(entries.len());
    for entry in entries {
        target_entries.push(rehash_tree_entry(&entry, source, target, apis)?);
    }
    let encoded = tree::encode(target.protocol(), &target_entries)?;
    let target_digest = target.store_tree(&encoded)?;
    store_rehashed_digest(
        digest,
        &target_digest,
        ObjectType::Tree,
        source.config(),
        target.config(),
        false,
    )?;
    Ok(ObjectInfo::new(target_digest, ObjectType::Tree))
}

fn rehash_tree_entry(
    entry: &TreeEntry,
    source: &Storage,
    target: &Storage,
    apis: Option<&ApiBundle>,
) -> Result<TreeEntry> {
    match entry.kind {
        ObjectType::Symlink => {
            // native stores the target text as a blob; compatible inlines it
            let target_text = match (&entry.target, &entry.hash) {
                (Some(text), _) => text.clone(),
                (None, Some(hash)) => {
                    let blob =
                        Digest::new(source.protocol(), hash.clone(), entry.size, false)?;
                    let bytes = match source.read_blob(&blob, false)? {
                        Some(bytes) => bytes,
                        None => match apis {
                            Some(apis) => apis
                                .remote
                                .retrieve_to_memory(&ObjectInfo::new(
                                    blob.clone(),
                                    ObjectType::File,
                                ))?
                                .ok_or_else(|| missing(&blob))?,
                            None => return Err(missing(&blob)),
                        },
                    };
                    String::from_utf8(bytes).map_err(|_| {
                        Error::corrupt_no_path(format!(
                            "symlink blob {} is not UTF-8",
                            entry.name
                        ))
                    })?
                }
                (None, None) => {
                    return Err(Error::corrupt_no_path(format!(
                        "symlink entry '{}' has neither hash nor target",
                        entry.name
                    )))
                }
            };
            match target.protocol() {
                strata_core::HashProtocol::Compatible => {
                    Ok(TreeEntry::symlink(entry.name.clone(), target_text))
                }
                strata_core::HashProtocol::Native => {
                    let blob = target.store_blob(target_text.as_bytes(), false)?;
                    Ok(TreeEntry::new(
                        entry.name.clone(),
                        ObjectType::Symlink,
                        blob.hash(),
                        blob.size(),
                    ))
                }
            }
        }
        kind => {
            let Some(hash) = &entry.hash else {
                return Err(Error::corrupt_no_path(format!(
                    "tree entry '{}' carries no hash",
                    entry.name
                )));
            };
            let child = Digest::new(source.protocol(), hash.clone(), entry.size, kind.is_tree())?;
            let child_info = ObjectInfo::new(child, kind);
            let rehashed = rehash_object(&child_info, source, target, apis)?;
            Ok(TreeEntry::new(
                entry.name.clone(),
                kind,
                rehashed.digest.hash(),
                rehashed.digest.size(),
            ))
        }
    }
}

fn missing(digest: &Digest) -> Error {
    Error::io_no_path(
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("object {} not available for rehashing", digest.hash()),
        ),
        "rehash",
    )
}
