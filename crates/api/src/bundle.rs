//! Bundle of the local and remote execution APIs
//!
//! A value of two capabilities plus the hash protocol they speak. A setup
//! without a remote endpoint aliases the remote slot to the local one, so
//! consumers never branch on presence.

use std::sync::Arc;

use strata_core::{HashProtocol, ObjectInfo, Result};
use strata_storage::RemoteSync;

use crate::api::ExecutionApi;

/// The pair of APIs the storage core operates with
#[derive(Clone)]
pub struct ApiBundle {
    /// The local storage endpoint
    pub local: Arc<dyn ExecutionApi>,
    /// The remote endpoint, or an alias of `local` without one
    pub remote: Arc<dyn ExecutionApi>,
}

impl ApiBundle {
    /// Bundle a local endpoint with an optional remote
    #[must_use]
    pub fn new(local: Arc<dyn ExecutionApi>, remote: Option<Arc<dyn ExecutionApi>>) -> Self {
        let remote = remote.unwrap_or_else(|| Arc::clone(&local));
        Self { local, remote }
    }

    /// Hash protocol both endpoints speak
    #[must_use]
    pub fn protocol(&self) -> HashProtocol {
        self.local.hash_protocol()
    }

    /// Whether a distinct remote endpoint is configured
    #[must_use]
    pub fn has_remote(&self) -> bool {
        !Arc::ptr_eq(&self.local, &self.remote)
    }
}

impl RemoteSync for ApiBundle {
    fn retrieve_to_local(&self, artifacts: &[ObjectInfo]) -> Result<()> {
        if !self.has_remote() {
            // everything named is already local by construction
            return Ok(());
        }
        self.remote.retrieve_to_cas(artifacts, &*self.local)
    }
}
