//! Object model: object kinds and the canonical object-info string
//!
//! The canonical textual form `[<hex-hash>:<size>:<type-char>]` is the
//! stable persisted representation used by action-cache entries,
//! target-cache entries and rehash mappings. A liberal parser is provided
//! for the human-facing boundary only.

use crate::digest::Digest;
use crate::hash::HashProtocol;
use crate::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Regular file
    File,
    /// File with the POSIX execute bit; content hash identical to `File`
    Executable,
    /// Directory tree
    Tree,
    /// Symbolic link
    Symlink,
}

impl ObjectType {
    /// Single-character tag used in the canonical string form
    #[must_use]
    pub fn to_char(self) -> char {
        match self {
            Self::File => 'f',
            Self::Executable => 'x',
            Self::Tree => 't',
            Self::Symlink => 'l',
        }
    }

    /// Parse a type character; unknown characters default to `File`
    #[must_use]
    pub fn from_char(c: char) -> Self {
        match c {
            'x' => Self::Executable,
            't' => Self::Tree,
            'l' => Self::Symlink,
            _ => Self::File,
        }
    }

    /// Whether this kind carries the execute bit
    #[must_use]
    pub fn is_executable(self) -> bool {
        self == Self::Executable
    }

    /// Whether this kind is a tree
    #[must_use]
    pub fn is_tree(self) -> bool {
        self == Self::Tree
    }

    /// Whether this kind is file-like (blob content, not a tree)
    #[must_use]
    pub fn is_blob(self) -> bool {
        matches!(self, Self::File | Self::Executable | Self::Symlink)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// A digest together with its object kind
///
/// The `failed` flag is an in-process annotation used by build wiring to
/// propagate action failures alongside artifacts. It is never persisted and
/// does not participate in equality or hashing.
#[derive(Debug, Clone, Eq)]
pub struct ObjectInfo {
    /// Content digest
    pub digest: Digest,
    /// Object kind
    pub object_type: ObjectType,
    /// In-process failure annotation; excluded from equality and persistence
    pub failed: bool,
}

impl ObjectInfo {
    /// Create an object info with the failed flag cleared
    #[must_use]
    pub fn new(digest: Digest, object_type: ObjectType) -> Self {
        Self {
            digest,
            object_type,
            failed: false,
        }
    }

    /// Canonical string form `[<hex-hash>:<size>:<type-char>]`
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        format!(
            "[{}:{}:{}]",
            self.digest.hash(),
            self.digest.size(),
            self.object_type.to_char()
        )
    }

    /// Strict parser for the canonical string form
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the string deviates from the canonical form.
    pub fn from_string(protocol: HashProtocol, s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| Error::corrupt_no_path(format!("object info not bracketed: {s}")))?;
        let mut fields = inner.splitn(3, ':');
        let hash = fields
            .next()
            .ok_or_else(|| Error::corrupt_no_path(format!("object info missing hash: {s}")))?;
        let size: u64 = fields
            .next()
            .ok_or_else(|| Error::corrupt_no_path(format!("object info missing size: {s}")))?
            .parse()
            .map_err(|_| Error::corrupt_no_path(format!("object info has invalid size: {s}")))?;
        let type_str = fields
            .next()
            .ok_or_else(|| Error::corrupt_no_path(format!("object info missing type: {s}")))?;
        let object_type = match type_str {
            "f" => ObjectType::File,
            "x" => ObjectType::Executable,
            "t" => ObjectType::Tree,
            "l" => ObjectType::Symlink,
            _ => {
                return Err(Error::corrupt_no_path(format!(
                    "object info has unknown type '{type_str}': {s}"
                )))
            }
        };
        let digest = Digest::new(protocol, hash, size, object_type.is_tree())
            .map_err(|e| Error::corrupt_no_path(format!("object info: {e}")))?;
        Ok(Self::new(digest, object_type))
    }

    /// Liberal parser for the human-facing boundary
    ///
    /// Tolerates missing brackets, a missing or unparsable size (defaults
    /// to 0, which equality does not honor anyway) and unknown type
    /// suffixes (default `File`; only the first character of the suffix is
    /// inspected).
    ///
    /// # Errors
    ///
    /// Returns an error only if the hash field itself is unusable.
    pub fn liberal_from_string(protocol: HashProtocol, s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix('[').unwrap_or(s);
        let s = s.strip_suffix(']').unwrap_or(s);

        let mut fields = s.splitn(3, ':');
        let hash = fields.next().unwrap_or_default();
        let size = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let object_type = fields
            .next()
            .and_then(|f| f.chars().next())
            .map_or(ObjectType::File, ObjectType::from_char);

        let digest = Digest::new(protocol, hash, size, object_type.is_tree())?;
        Ok(Self::new(digest, object_type))
    }
}

impl PartialEq for ObjectInfo {
    fn eq(&self, other: &Self) -> bool {
        // `failed` is an in-process annotation and must not distinguish an
        // info from its persisted representation.
        self.digest == other.digest && self.object_type == other.object_type
    }
}

impl Hash for ObjectInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Hash::hash(&self.digest, state);
        self.object_type.hash(state);
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}
