//! The execution-API capability consumed and exposed by the storage core
//!
//! The core speaks no wire protocol. Remote transports, a serve endpoint,
//! or another local storage all appear behind this one trait; the local
//! adapter over a [`strata_storage::Storage`] lives in [`crate::local`].

use std::io::Write;
use std::path::PathBuf;

use strata_core::{Digest, HashProtocol, ObjectInfo, Result};

use crate::blob::ArtifactBlob;

/// Capability for synchronizing and staging content-addressed objects
///
/// Implementations must preserve the tree invariants on their receiving
/// side: an uploaded tree may only be accepted once all its referents are
/// present, and `retrieve_to_cas` transfers children before parents.
pub trait ExecutionApi: Send + Sync {
    /// Hash protocol this endpoint speaks
    fn hash_protocol(&self) -> HashProtocol;

    /// Whether a single object is present
    fn is_available(&self, digest: &Digest) -> bool;

    /// The subset of `digests` this endpoint does not hold
    ///
    /// # Errors
    ///
    /// Returns an error on transport or I/O failure.
    fn missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        Ok(digests
            .iter()
            .filter(|d| !self.is_available(d))
            .cloned()
            .collect())
    }

    /// Upload blobs, skipping already-present ones unless told otherwise
    ///
    /// A blob whose declared and actual digest disagree must be refused.
    ///
    /// # Errors
    ///
    /// Returns an error on digest mismatch or transport/I/O failure.
    fn upload(&self, blobs: Vec<ArtifactBlob>, skip_find_missing: bool) -> Result<()>;

    /// Build and store a tree from named artifacts already present here
    ///
    /// Runs the tree-invariant verifier on the receiving side and returns
    /// the root tree digest.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced artifact is absent or an invariant
    /// is violated.
    fn upload_tree(&self, artifacts: &[(PathBuf, ObjectInfo)]) -> Result<Digest>;

    /// Materialize artifacts at the given filesystem paths
    ///
    /// Trees are resolved recursively into directories.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact is absent or cannot be written.
    fn retrieve_to_paths(&self, infos: &[ObjectInfo], paths: &[PathBuf]) -> Result<()>;

    /// Stream artifacts to writers
    ///
    /// Trees are pretty-printed unless `raw_tree` is set, in which case the
    /// raw encoding is written.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact is absent or a writer fails.
    fn retrieve_to_writers(
        &self,
        infos: &[ObjectInfo],
        writers: &mut [&mut dyn Write],
        raw_tree: bool,
    ) -> Result<()>;

    /// Bulk-synchronize artifacts from this endpoint into another
    ///
    /// Trees are resolved and transferred children-first so the receiving
    /// side's recursive-satisfiability invariant holds throughout. Both
    /// endpoints must speak the same hash protocol; crossing protocols is
    /// the job of the rehash bridge.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMismatch` when the endpoints disagree on hashing,
    /// or any transport/I/O error.
    fn retrieve_to_cas(&self, infos: &[ObjectInfo], other: &dyn ExecutionApi) -> Result<()>;

    /// Fetch one artifact into memory
    ///
    /// # Errors
    ///
    /// Returns an error on transport or I/O failure.
    fn retrieve_to_memory(&self, info: &ObjectInfo) -> Result<Option<Vec<u8>>>;
}
