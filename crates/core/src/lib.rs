//! Core types for the strata storage layer
//!
//! This crate carries everything the storage, synchronization and rehashing
//! crates share: the two hash protocols, content-addressed digests, the
//! object model with its canonical textual form, the storage configuration
//! with all path computations, and the common error taxonomy.
//!
//! Nothing in here touches global state. The hash protocol and the build
//! root are decided once, at [`StorageConfig`] construction, and flow
//! through every operation as explicit values.

mod config;
mod digest;
mod error;
pub mod hash;
mod object;

pub use config::{
    DEFAULT_NUM_GENERATIONS, ENV_BUILD_ROOT, ENV_COMPATIBLE, ExecWriteMode, GenerationConfig,
    StorageConfig,
};
pub use digest::{Digest, unprefix};
pub use error::{Error, Result};
pub use hash::{HashProtocol, HashTag, HashValue, Hasher};
pub use object::{ObjectInfo, ObjectType};
