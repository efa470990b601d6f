//! Global uplinker: restore objects found in older generations to the youngest
//!
//! Every successful read through the generation set must leave the object,
//! with all its transitive referents, reachable from generation 0 before
//! the read returns. The uplinker probes generations youngest-first and
//! prefers hard links from older generations over copies from the
//! companion file/executable lane; a cross-lane copy pass runs only when no
//! generation holds a same-lane entry.

use strata_core::{Digest, Result, StorageConfig};

use crate::generation::Generation;
use crate::target_cache::TargetCacheKey;

/// Uplinker over all generations of one storage
#[derive(Debug)]
pub struct GlobalUplinker {
    generations: Vec<Generation>,
}

impl GlobalUplinker {
    /// Open all generations of the configured storage
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        let generations = (0..config.num_generations())
            .map(|i| Generation::open(config, i))
            .collect();
        Self { generations }
    }

    fn latest(&self) -> &Generation {
        &self.generations[Generation::YOUNGEST]
    }

    /// Uplink a blob into the youngest generation
    ///
    /// Returns `true` if the blob was found in any generation.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn uplink_blob(&self, digest: &Digest, is_executable: bool) -> Result<bool> {
        let latest = self.latest();
        // links from any generation beat copies from the companion lane
        for skip_sync in [true, false] {
            for generation in &self.generations {
                if generation.cas().local_uplink_blob(
                    latest.cas(),
                    digest,
                    is_executable,
                    skip_sync,
                )? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Deeply uplink a tree into the youngest generation
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn uplink_tree(&self, digest: &Digest) -> Result<bool> {
        let latest = self.latest();
        for generation in &self.generations {
            if generation.cas().local_uplink_tree(latest.cas(), digest)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Uplink a large-object manifest and its chunks, without reassembling
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn uplink_large_blob(&self, digest: &Digest) -> Result<bool> {
        let latest = self.latest();
        for generation in &self.generations {
            if generation
                .cas()
                .local_uplink_large_blob(latest.cas(), digest)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Uplink an action-cache entry with everything it references
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn uplink_action_cache_entry(&self, action_id: &Digest) -> Result<bool> {
        let latest = self.latest();
        for generation in &self.generations {
            if generation
                .action_cache()
                .local_uplink_entry(latest.action_cache(), action_id)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Uplink a target-cache entry with everything it references
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn uplink_target_cache_entry(&self, key: &TargetCacheKey, shard: &str) -> Result<bool> {
        let latest_tc = self.latest().target_cache(shard);
        for generation in &self.generations {
            if generation
                .target_cache(shard)
                .local_uplink_entry(&latest_tc, key)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
