//! One storage generation: CAS, action cache and target cache under one root
//!
//! Plain generations are the building blocks of the generation set. Their
//! caches use first-wins placement so that uplinking never overwrites a
//! newer entry with an older one; only the youngest generation, accessed
//! through [`crate::storage::Storage`], uses last-wins action/target cache
//! stores.

use std::sync::Arc;

use strata_core::{ExecWriteMode, StorageConfig};

use crate::action_cache::ActionCache;
use crate::file_store::StoreMode;
use crate::local_cas::LocalCas;
use crate::target_cache::TargetCache;

/// A single storage generation
#[derive(Debug, Clone)]
pub struct Generation {
    index: usize,
    exec_write_mode: ExecWriteMode,
    cas: Arc<LocalCas>,
    ac: ActionCache,
    tc_root: std::path::PathBuf,
}

impl Generation {
    /// Index of the youngest generation
    pub const YOUNGEST: usize = 0;

    /// Open generation `index` of the configured storage
    #[must_use]
    pub fn open(config: &StorageConfig, index: usize) -> Self {
        let gen_config = config.generation_config(index);
        let cas = Arc::new(LocalCas::new(&gen_config, config.exec_write_mode()));
        let ac = ActionCache::new(
            Arc::clone(&cas),
            &gen_config.action_cache,
            StoreMode::FirstWins,
        );
        Self {
            index,
            exec_write_mode: config.exec_write_mode(),
            cas,
            ac,
            tc_root: gen_config.target_cache,
        }
    }

    /// Index of this generation; `0` is youngest
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Content-addressed store of this generation
    #[must_use]
    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    /// Shared handle to the CAS
    #[must_use]
    pub fn cas_handle(&self) -> Arc<LocalCas> {
        Arc::clone(&self.cas)
    }

    /// Action cache of this generation
    #[must_use]
    pub fn action_cache(&self) -> &ActionCache {
        &self.ac
    }

    /// Target cache of this generation under the given backend shard
    #[must_use]
    pub fn target_cache(&self, shard: &str) -> TargetCache {
        TargetCache::new(
            Arc::clone(&self.cas),
            &self.tc_root,
            shard,
            StoreMode::FirstWins,
        )
    }

    /// Executable write mode this generation was opened with
    #[must_use]
    pub fn exec_write_mode(&self) -> ExecWriteMode {
        self.exec_write_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_have_disjoint_roots() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        let gen0 = Generation::open(&config, 0);
        let gen1 = Generation::open(&config, 1);

        let digest = gen0.cas().store_blob(b"test", false).unwrap();
        assert!(gen0.cas().blob_path_no_sync(&digest, false).unwrap().is_some());
        assert!(gen1.cas().blob_path_no_sync(&digest, false).unwrap().is_none());
    }
}
