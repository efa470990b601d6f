//! Hash protocols for content addressing
//!
//! Two protocols coexist. The *native* protocol is SHA-1 with Git-style
//! object tagging: plain hashes are untagged, blob hashes prepend
//! `"blob <size>\0"`, tree hashes prepend `"tree <size>\0"`. The
//! *compatible* protocol is flat SHA-256 over raw content for every object
//! kind. The protocol is decided at storage construction and carried
//! explicitly; nothing in this module consults global state.

use crate::{Error, Result};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hash length in bytes for the native protocol (SHA-1)
pub const NATIVE_HASH_LEN: usize = 20;

/// Hash length in bytes for the compatible protocol (SHA-256)
pub const COMPATIBLE_HASH_LEN: usize = 32;

/// The hash protocol used by a storage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashProtocol {
    /// SHA-1 with Git-style tagging for blobs and trees
    Native,
    /// SHA-256 over raw content for all object kinds
    Compatible,
}

impl HashProtocol {
    /// Directory tag separating the two protocols below the cache root
    #[must_use]
    pub fn dir_tag(self) -> &'static str {
        match self {
            Self::Native => "git-sha1",
            Self::Compatible => "compatible-sha256",
        }
    }

    /// Raw hash length in bytes
    #[must_use]
    pub fn hash_len(self) -> usize {
        match self {
            Self::Native => NATIVE_HASH_LEN,
            Self::Compatible => COMPATIBLE_HASH_LEN,
        }
    }

    /// Hex hash length in characters
    #[must_use]
    pub fn hex_len(self) -> usize {
        2 * self.hash_len()
    }
}

impl fmt::Display for HashProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_tag())
    }
}

/// Tagging applied before hashing under the native protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTag {
    /// No tag; hash over raw content
    Plain,
    /// Git blob tag `"blob <size>\0"`
    Blob,
    /// Git tree tag `"tree <size>\0"`
    Tree,
}

impl HashTag {
    fn header(self, size: u64) -> Option<Vec<u8>> {
        match self {
            Self::Plain => None,
            Self::Blob => Some(format!("blob {size}\0").into_bytes()),
            Self::Tree => Some(format!("tree {size}\0").into_bytes()),
        }
    }
}

/// A finalized hash value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashValue {
    bytes: Vec<u8>,
}

impl HashValue {
    /// Raw hash bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex representation
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Reconstruct from a hex string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex of the protocol's
    /// hash length.
    pub fn from_hex(protocol: HashProtocol, s: &str) -> Result<Self> {
        if s.len() != protocol.hex_len() {
            return Err(Error::invalid_digest(format!(
                "expected {} hex characters for {protocol}, got {}",
                protocol.hex_len(),
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| Error::invalid_digest(format!("not a hex string: {s}")))?;
        Ok(Self { bytes })
    }
}

/// Incremental hasher for one protocol
pub struct Hasher {
    inner: HasherImpl,
}

enum HasherImpl {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    /// Create a plain (untagged) hasher for the given protocol
    #[must_use]
    pub fn new(protocol: HashProtocol) -> Self {
        let inner = match protocol {
            HashProtocol::Native => HasherImpl::Sha1(Sha1::new()),
            HashProtocol::Compatible => HasherImpl::Sha256(Sha256::new()),
        };
        Self { inner }
    }

    /// Feed data into the hasher
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherImpl::Sha1(h) => h.update(data),
            HasherImpl::Sha256(h) => h.update(data),
        }
    }

    /// Finalize and return the hash value
    #[must_use]
    pub fn finalize(self) -> HashValue {
        let bytes = match self.inner {
            HasherImpl::Sha1(h) => h.finalize().to_vec(),
            HasherImpl::Sha256(h) => h.finalize().to_vec(),
        };
        HashValue { bytes }
    }
}

/// Compute a tagged hash over in-memory data
///
/// Tags only apply under the native protocol; the compatible protocol
/// hashes raw content regardless of the tag.
#[must_use]
pub fn hash_tagged(protocol: HashProtocol, tag: HashTag, data: &[u8]) -> HashValue {
    let mut hasher = Hasher::new(protocol);
    if protocol == HashProtocol::Native {
        if let Some(header) = tag.header(data.len() as u64) {
            hasher.update(&header);
        }
    }
    hasher.update(data);
    hasher.finalize()
}

/// Compute a plain hash over in-memory data
#[must_use]
pub fn hash_plain(protocol: HashProtocol, data: &[u8]) -> HashValue {
    hash_tagged(protocol, HashTag::Plain, data)
}

/// Compute a blob hash over in-memory data
#[must_use]
pub fn hash_blob(protocol: HashProtocol, data: &[u8]) -> HashValue {
    hash_tagged(protocol, HashTag::Blob, data)
}

/// Compute a tree hash over in-memory data
#[must_use]
pub fn hash_tree(protocol: HashProtocol, data: &[u8]) -> HashValue {
    hash_tagged(protocol, HashTag::Tree, data)
}

/// Compute a tagged hash of a file's content without loading it whole
///
/// Returns the hash and the file size. The size enters the Git-style tag,
/// so the file is stat'ed first and streamed afterwards.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(
    protocol: HashProtocol,
    tag: HashTag,
    path: impl AsRef<Path>,
) -> Result<(HashValue, u64)> {
    let path = path.as_ref();
    let mut file =
        File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let size = file
        .metadata()
        .map_err(|e| Error::io(e, path, "metadata"))?
        .len();

    let mut hasher = Hasher::new(protocol);
    if protocol == HashProtocol::Native {
        if let Some(header) = tag.header(size) {
            hasher.update(&header);
        }
    }
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finalize(), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_hashes_of_test() {
        let bytes = b"test";

        // same as: echo -n test | sha1sum
        assert_eq!(
            hash_plain(HashProtocol::Native, bytes).hex(),
            "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3"
        );
        // same as: echo -n test | git hash-object --stdin
        assert_eq!(
            hash_blob(HashProtocol::Native, bytes).hex(),
            "30d74d258442c7c65512eafab474568dd706c430"
        );
        // same as: echo -n test | git hash-object -t tree --stdin --literally
        assert_eq!(
            hash_tree(HashProtocol::Native, bytes).hex(),
            "5f0ecc1a989593005e80f457446133250fcc43cc"
        );

        let mut hasher = Hasher::new(HashProtocol::Native);
        hasher.update(bytes);
        assert_eq!(
            hasher.finalize().hex(),
            "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3"
        );
    }

    #[test]
    fn compatible_hashes_of_test() {
        let bytes = b"test";

        // all same as: echo -n test | sha256sum
        let expected = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert_eq!(hash_plain(HashProtocol::Compatible, bytes).hex(), expected);
        assert_eq!(hash_blob(HashProtocol::Compatible, bytes).hex(), expected);
        assert_eq!(hash_tree(HashProtocol::Compatible, bytes).hex(), expected);

        let mut hasher = Hasher::new(HashProtocol::Compatible);
        hasher.update(bytes);
        assert_eq!(hasher.finalize().hex(), expected);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"test").unwrap();

        let (hash, size) = hash_file(HashProtocol::Native, HashTag::Blob, &path).unwrap();
        assert_eq!(size, 4);
        assert_eq!(hash, hash_blob(HashProtocol::Native, b"test"));
    }

    #[test]
    fn hex_roundtrip() {
        let value = hash_plain(HashProtocol::Compatible, b"roundtrip");
        let parsed = HashValue::from_hex(HashProtocol::Compatible, &value.hex()).unwrap();
        assert_eq!(value, parsed);
    }

    #[test]
    fn hex_rejects_wrong_length() {
        assert!(HashValue::from_hex(HashProtocol::Native, "abc").is_err());
        let sha256_hex = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert!(HashValue::from_hex(HashProtocol::Native, sha256_hex).is_err());
    }
}
