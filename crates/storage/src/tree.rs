//! Tree encodings for both hash protocols
//!
//! Native trees use the Git tree object encoding: entries of the form
//! `"<mode> <name>\0<raw hash>"` concatenated in Git name order, hashed
//! with the `"tree <size>\0"` tag. A symlink entry references a blob whose
//! content is the link target.
//!
//! Compatible trees are canonical JSON directory descriptors listing child
//! blobs, subdirectories and symlinks explicitly (entries sorted by name),
//! hashed flat with SHA-256. Symlink targets are stored inline.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;

use strata_core::hash::NATIVE_HASH_LEN;
use strata_core::{Error, HashProtocol, ObjectType, Result};

const MODE_FILE: &str = "100644";
const MODE_EXEC: &str = "100755";
const MODE_TREE: &str = "40000";
const MODE_SYMLINK: &str = "120000";

/// One entry of a parsed tree
///
/// `hash` is absent only for compatible symlinks, whose target is inline;
/// `target` is present only for those. Sizes are zero for native children
/// (the Git encoding does not carry them; digest equality does not honor
/// size).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry name, a single path component
    pub name: String,
    /// Object kind of the child
    pub kind: ObjectType,
    /// Hex hash of the child object, if the encoding references one
    pub hash: Option<String>,
    /// Child size, where the encoding carries it
    pub size: u64,
    /// Inline symlink target, compatible encoding only
    pub target: Option<String>,
}

impl TreeEntry {
    /// Entry referencing a child object by hash
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ObjectType, hash: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            hash: Some(hash.into()),
            size,
            target: None,
        }
    }

    /// Compatible symlink entry with an inline target
    #[must_use]
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectType::Symlink,
            hash: None,
            size: 0,
            target: Some(target.into()),
        }
    }
}

/// Parse a tree encoding under the given protocol
///
/// # Errors
///
/// Returns `Corrupt` if the bytes are not a well-formed tree.
pub fn parse(protocol: HashProtocol, data: &[u8]) -> Result<Vec<TreeEntry>> {
    match protocol {
        HashProtocol::Native => parse_git_tree(data),
        HashProtocol::Compatible => parse_directory(data),
    }
}

/// Encode entries as a tree under the given protocol
///
/// Entries are sorted canonically; the caller need not pre-sort.
///
/// # Errors
///
/// Returns an error if an entry is not expressible under the protocol
/// (e.g. a hash-less symlink in a native tree).
pub fn encode(protocol: HashProtocol, entries: &[TreeEntry]) -> Result<Vec<u8>> {
    match protocol {
        HashProtocol::Native => encode_git_tree(entries),
        HashProtocol::Compatible => encode_directory(entries),
    }
}

fn parse_git_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt_no_path("git tree entry missing mode delimiter"))?;
        let mode = std::str::from_utf8(&rest[..space])
            .map_err(|_| Error::corrupt_no_path("git tree mode is not ASCII"))?;
        let kind = match mode {
            MODE_FILE => ObjectType::File,
            MODE_EXEC => ObjectType::Executable,
            MODE_TREE => ObjectType::Tree,
            MODE_SYMLINK => ObjectType::Symlink,
            _ => {
                return Err(Error::corrupt_no_path(format!(
                    "git tree entry has unsupported mode {mode}"
                )))
            }
        };
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt_no_path("git tree entry missing name delimiter"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::corrupt_no_path("git tree entry name is not UTF-8"))?
            .to_string();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::corrupt_no_path(format!(
                "git tree entry has invalid name '{name}'"
            )));
        }
        rest = &rest[nul + 1..];

        if rest.len() < NATIVE_HASH_LEN {
            return Err(Error::corrupt_no_path("git tree entry truncated hash"));
        }
        let hash = hex::encode(&rest[..NATIVE_HASH_LEN]);
        rest = &rest[NATIVE_HASH_LEN..];

        entries.push(TreeEntry::new(name, kind, hash, 0));
    }
    Ok(entries)
}

fn encode_git_tree(entries: &[TreeEntry]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| git_entry_order(a, b));

    let mut out = Vec::new();
    for entry in sorted {
        let mode = match entry.kind {
            ObjectType::File => MODE_FILE,
            ObjectType::Executable => MODE_EXEC,
            ObjectType::Tree => MODE_TREE,
            ObjectType::Symlink => MODE_SYMLINK,
        };
        let hash = entry.hash.as_deref().ok_or_else(|| {
            Error::invariant(format!(
                "native tree entry '{}' carries no child hash",
                entry.name
            ))
        })?;
        let raw = hex::decode(hash)
            .map_err(|_| Error::invalid_digest(format!("not a hex hash: {hash}")))?;
        if raw.len() != NATIVE_HASH_LEN {
            return Err(Error::invalid_digest(format!(
                "native tree entry hash has {} bytes, expected {NATIVE_HASH_LEN}",
                raw.len()
            )));
        }
        out.extend_from_slice(mode.as_bytes());
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&raw);
    }
    Ok(out)
}

/// Git name order: directories sort as if their name ended in `/`
fn git_entry_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let key = |e: &TreeEntry| {
        let mut k = e.name.clone().into_bytes();
        if e.kind.is_tree() {
            k.push(b'/');
        }
        k
    };
    key(a).cmp(&key(b))
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectoryFile {
    name: String,
    hash: String,
    size: u64,
    executable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectorySubdir {
    name: String,
    hash: String,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectorySymlink {
    name: String,
    target: String,
}

/// Serialized form of a compatible tree
#[derive(Debug, Serialize, Deserialize)]
struct Directory {
    files: Vec<DirectoryFile>,
    directories: Vec<DirectorySubdir>,
    symlinks: Vec<DirectorySymlink>,
}

fn parse_directory(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let dir: Directory = serde_json::from_slice(data)
        .map_err(|e| Error::corrupt_no_path(format!("directory descriptor: {e}")))?;
    let mut entries = Vec::new();
    for f in dir.files {
        let kind = if f.executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        entries.push(TreeEntry::new(f.name, kind, f.hash, f.size));
    }
    for d in dir.directories {
        entries.push(TreeEntry::new(d.name, ObjectType::Tree, d.hash, d.size));
    }
    for l in dir.symlinks {
        entries.push(TreeEntry::symlink(l.name, l.target));
    }
    Ok(entries)
}

fn encode_directory(entries: &[TreeEntry]) -> Result<Vec<u8>> {
    let mut dir = Directory {
        files: Vec::new(),
        directories: Vec::new(),
        symlinks: Vec::new(),
    };
    for entry in entries {
        match entry.kind {
            ObjectType::File | ObjectType::Executable => {
                let hash = entry.hash.clone().ok_or_else(|| {
                    Error::invariant(format!("file entry '{}' carries no hash", entry.name))
                })?;
                dir.files.push(DirectoryFile {
                    name: entry.name.clone(),
                    hash,
                    size: entry.size,
                    executable: entry.kind.is_executable(),
                });
            }
            ObjectType::Tree => {
                let hash = entry.hash.clone().ok_or_else(|| {
                    Error::invariant(format!("subdir entry '{}' carries no hash", entry.name))
                })?;
                dir.directories.push(DirectorySubdir {
                    name: entry.name.clone(),
                    hash,
                    size: entry.size,
                });
            }
            ObjectType::Symlink => {
                let target = entry.target.clone().ok_or_else(|| {
                    Error::invariant(format!(
                        "compatible symlink entry '{}' carries no target",
                        entry.name
                    ))
                })?;
                dir.symlinks.push(DirectorySymlink {
                    name: entry.name.clone(),
                    target,
                });
            }
        }
    }
    dir.files.sort_by(|a, b| a.name.cmp(&b.name));
    dir.directories.sort_by(|a, b| a.name.cmp(&b.name));
    dir.symlinks.sort_by(|a, b| a.name.cmp(&b.name));
    serde_json::to_vec(&dir).map_err(|e| Error::serialization(e.to_string()))
}

/// Check that a symlink target cannot escape the tree it lives in
///
/// The target must be relative and no prefix of its normalized component
/// sequence may ascend above the link's own directory.
#[must_use]
pub fn is_non_upwards_target(target: &str) -> bool {
    if target.is_empty() || target.starts_with('/') {
        return false;
    }
    let mut depth: i64 = 0;
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

/// Render a tree's entries as a human-readable listing
///
/// One `git ls-tree`-style line per entry. Compatible symlinks print the
/// inline target in place of a hash.
#[must_use]
pub fn pretty_print(entries: &[TreeEntry]) -> String {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    for entry in sorted {
        let (mode, kind) = match entry.kind {
            ObjectType::File => (MODE_FILE, "blob"),
            ObjectType::Executable => (MODE_EXEC, "blob"),
            ObjectType::Tree => (MODE_TREE, "tree"),
            ObjectType::Symlink => (MODE_SYMLINK, "link"),
        };
        let reference = entry
            .hash
            .clone()
            .or_else(|| entry.target.clone())
            .unwrap_or_default();
        let _ = writeln!(out, "{mode} {kind} {reference}\t{}", entry.name);
    }
    out
}
