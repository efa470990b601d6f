//! Generational content-addressed storage for the strata build core
//!
//! This crate implements the local storage layer: atomic file placement,
//! the three-lane content-addressed store with tree invariants, the action
//! and target caches, the age-partitioned generation set with uplink on
//! every read, and garbage collection by whole-generation rotation.
//!
//! ## Architecture
//!
//! Objects live in *generations*, numbered `0` (youngest) upwards. Writes
//! only go to generation 0; reads probe all generations and restore every
//! hit, with all transitive referents, into generation 0 before returning.
//! Garbage collection renames each generation down one slot under an
//! exclusive advisory lock, so one rotation drops exactly the objects that
//! were not read since the previous rotation. Storage is append-only
//! within a process; destruction happens only by whole-generation
//! eviction.
//!
//! Entry points:
//! - [`Storage`]: the generation set, what the build engine talks to
//! - [`GarbageCollector`]: the rotation operation
//! - [`Generation`]: a single generation, used by tests and the uplinker

pub mod action_cache;
pub mod file_store;
pub mod gc;
pub mod generation;
pub mod large;
pub mod local_cas;
pub mod object_cas;
pub mod process;
pub mod storage;
pub mod target_cache;
pub mod tree;
pub mod uplink;

pub use action_cache::{ActionCache, ActionResult, BlobRef, OutputDirectory, OutputFile, OutputSymlink};
pub use file_store::{FileStore, StoreMode, read_id_file, write_id_file};
pub use gc::{GarbageCollector, LockFile, exclusive_lock, shared_lock};
pub use generation::Generation;
pub use large::LargeObjectCas;
pub use local_cas::LocalCas;
pub use object_cas::ObjectCas;
pub use storage::Storage;
pub use target_cache::{NoRemote, RemoteSync, TargetCache, TargetCacheEntry, TargetCacheKey};
pub use tree::{TreeEntry, is_non_upwards_target};
pub use uplink::GlobalUplinker;
