//! Content-addressed digests
//!
//! A [`Digest`] names an object by the hex hash of its content under one of
//! the two [`HashProtocol`]s, together with the content size and a tree
//! marker. Equality deliberately ignores the size: two digests naming the
//! same content are equal even when one side lost track of the exact size
//! (e.g. a liberally parsed object-info string).

use crate::hash::{self, HashProtocol, HashTag, HashValue};
use crate::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Administrative marker byte prepended to native blob hashes (`b`)
const BLOB_MARKER: &str = "62";
/// Administrative marker byte prepended to native tree hashes (`t`)
const TREE_MARKER: &str = "74";

/// A content-addressed object identifier
#[derive(Debug, Clone, Eq)]
pub struct Digest {
    protocol: HashProtocol,
    hash: String,
    size: u64,
    is_tree: bool,
}

impl Digest {
    /// Create a digest from a hex hash string
    ///
    /// Accepts both the plain hex form and, under the native protocol, the
    /// administratively marked form (one marker byte prepended); the marker
    /// is stripped.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash is not valid hex of the protocol's
    /// length.
    pub fn new(
        protocol: HashProtocol,
        hash: impl Into<String>,
        size: u64,
        is_tree: bool,
    ) -> Result<Self> {
        let mut hash = hash.into();
        if protocol == HashProtocol::Native && hash.len() == protocol.hex_len() + 2 {
            hash = unprefix(&hash).to_string();
        }
        if hash.len() != protocol.hex_len() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_digest(format!(
                "expected {} hex characters for {protocol}, got '{hash}'",
                protocol.hex_len()
            )));
        }
        hash.make_ascii_lowercase();
        Ok(Self {
            protocol,
            hash,
            size,
            is_tree,
        })
    }

    /// Compute the digest of an in-memory blob
    #[must_use]
    pub fn file(protocol: HashProtocol, data: &[u8]) -> Self {
        Self {
            protocol,
            hash: hash::hash_blob(protocol, data).hex(),
            size: data.len() as u64,
            is_tree: false,
        }
    }

    /// Compute the digest of an in-memory tree encoding
    #[must_use]
    pub fn tree(protocol: HashProtocol, data: &[u8]) -> Self {
        Self {
            protocol,
            hash: hash::hash_tree(protocol, data).hex(),
            size: data.len() as u64,
            is_tree: true,
        }
    }

    /// Compute the digest of a file's content on disk
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn from_file(protocol: HashProtocol, path: impl AsRef<Path>, as_tree: bool) -> Result<Self> {
        let tag = if as_tree { HashTag::Tree } else { HashTag::Blob };
        let (hash, size) = hash::hash_file(protocol, tag, path)?;
        Ok(Self {
            protocol,
            hash: hash.hex(),
            size,
            is_tree: as_tree,
        })
    }

    /// The protocol this digest was computed under
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.protocol
    }

    /// Plain hex hash, without any administrative marker
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Content size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this digest names a tree
    #[must_use]
    pub fn is_tree(&self) -> bool {
        self.is_tree
    }

    /// Raw hash bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hex is malformed, which cannot happen
    /// for digests created through the constructors.
    pub fn raw_hash(&self) -> Result<HashValue> {
        HashValue::from_hex(self.protocol, &self.hash)
    }

    /// Administratively marked hash
    ///
    /// Under the native protocol a marker byte is prepended so that tree
    /// hashes can be told apart from file hashes over the same raw bytes.
    /// The compatible protocol needs no marker.
    #[must_use]
    pub fn tagged_hash(&self) -> String {
        match self.protocol {
            HashProtocol::Native => {
                let marker = if self.is_tree { TREE_MARKER } else { BLOB_MARKER };
                format!("{marker}{}", self.hash)
            }
            HashProtocol::Compatible => self.hash.clone(),
        }
    }
}

/// Strip the administrative marker byte from a native hash, if present
#[must_use]
pub fn unprefix(hash: &str) -> &str {
    if hash.len() == 2 * hash::NATIVE_HASH_LEN + 2
        && (hash.starts_with(BLOB_MARKER) || hash.starts_with(TREE_MARKER))
    {
        &hash[2..]
    } else {
        hash
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        // Size is not honored in equality: content addressing makes the
        // hash authoritative, and liberally parsed digests may lack a size.
        self.protocol == other.protocol
            && self.hash == other.hash
            && self.is_tree == other.is_tree
    }
}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.hash.hash(state);
        self.is_tree.hash(state);
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_digest_from_bytes() {
        let digest = Digest::file(HashProtocol::Native, b"test");
        assert_eq!(digest.hash(), "30d74d258442c7c65512eafab474568dd706c430");
        assert_eq!(digest.size(), 4);
        assert!(!digest.is_tree());
    }

    #[test]
    fn tree_digest_differs_from_file_digest() {
        let file = Digest::file(HashProtocol::Native, b"test");
        let tree = Digest::tree(HashProtocol::Native, b"test");
        assert_ne!(file.hash(), tree.hash());
        assert_ne!(file, tree);
    }

    #[test]
    fn compatible_digests_share_hash_across_kinds() {
        let file = Digest::file(HashProtocol::Compatible, b"test");
        let tree = Digest::tree(HashProtocol::Compatible, b"test");
        assert_eq!(file.hash(), tree.hash());
        // but the tree marker still separates them semantically
        assert_ne!(file, tree);
    }

    #[test]
    fn equality_ignores_size() {
        let a = Digest::new(HashProtocol::Native, "a".repeat(40), 11, false).unwrap();
        let b = Digest::new(HashProtocol::Native, "a".repeat(40), 0, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tagged_hash_roundtrip() {
        let tree = Digest::tree(HashProtocol::Native, b"test");
        let tagged = tree.tagged_hash();
        assert_eq!(tagged.len(), 42);
        assert!(tagged.starts_with("74"));
        assert_eq!(unprefix(&tagged), tree.hash());

        let again = Digest::new(HashProtocol::Native, tagged, tree.size(), true).unwrap();
        assert_eq!(again, tree);
    }

    #[test]
    fn compatible_hash_is_unmarked() {
        let tree = Digest::tree(HashProtocol::Compatible, b"test");
        assert_eq!(tree.tagged_hash(), tree.hash());
    }

    #[test]
    fn unprefix_leaves_plain_hashes_alone() {
        let hash = "30d74d258442c7c65512eafab474568dd706c430";
        assert_eq!(unprefix(hash), hash);
    }

    #[test]
    fn new_rejects_bad_hex() {
        assert!(Digest::new(HashProtocol::Native, "xyz", 0, false).is_err());
        assert!(Digest::new(HashProtocol::Compatible, "a".repeat(40), 0, false).is_err());
    }

    #[test]
    fn from_file_matches_from_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"content").unwrap();
        let from_file = Digest::from_file(HashProtocol::Compatible, &path, false).unwrap();
        assert_eq!(from_file, Digest::file(HashProtocol::Compatible, b"content"));
    }
}
