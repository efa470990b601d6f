//! Cross-protocol digest rehashing for the strata storage core
//!
//! Bridges the native (Git-style SHA-1) and compatible (flat SHA-256) hash
//! spaces: objects are re-stored under the other protocol and the digest
//! correspondence is memoized in a small-file mapping cache that survives
//! process boundaries. Calls that cross protocols anywhere else in the
//! core are rejected; this crate is the one sanctioned crossing point.

mod cache;
mod rehash;

pub use cache::{read_rehashed_digest, store_rehashed_digest};
pub use rehash::rehash_digest;
