//! Failover selection over an ordered candidate list.
//!
//! A dispatcher owns no key material. Each call walks its candidates in
//! order and picks the first one that is enabled and has an active token.
//! Nothing is remembered between calls, so a re-enabled candidate becomes
//! eligible on the very next dispatch.

use signet_storage::WorkerId;

use crate::error::{Result, WorkerError};

/// Answers whether a worker can take a request right now.
pub trait WorkerDirectory: Send + Sync {
    /// Returns `true` if `worker` is enabled and its token is active.
    fn is_usable(&self, worker: WorkerId) -> bool;
}

/// A dispatcher worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatcher {
    worker_id: WorkerId,
    candidates: Vec<WorkerId>,
}

impl Dispatcher {
    /// Creates a dispatcher over `candidates` in priority order.
    #[must_use]
    pub fn new(worker_id: WorkerId, candidates: impl IntoIterator<Item = WorkerId>) -> Self {
        Self { worker_id, candidates: candidates.into_iter().collect() }
    }

    /// Returns the dispatcher's own id.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the candidates in priority order.
    #[must_use]
    pub fn candidates(&self) -> &[WorkerId] {
        &self.candidates
    }

    /// Returns the first usable candidate.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::CryptoTokenOffline`] naming this dispatcher if
    /// no candidate is usable.
    pub fn dispatch(&self, directory: &dyn WorkerDirectory) -> Result<WorkerId> {
        for &candidate in &self.candidates {
            if directory.is_usable(candidate) {
                tracing::trace!(
                    worker_id = %self.worker_id,
                    candidate = %candidate,
                    "dispatching to candidate"
                );
                return Ok(candidate);
            }
            tracing::debug!(
                worker_id = %self.worker_id,
                candidate = %candidate,
                "skipping unusable candidate"
            );
        }
        Err(WorkerError::offline(format!(
            "No active worker found among the candidates of dispatcher {}",
            self.worker_id
        )))
    }

    /// Activation is a no-op; a dispatcher has no key material.
    pub fn activate(&self, _secret: &[u8]) -> Result<()> {
        tracing::debug!(worker_id = %self.worker_id, "ignoring activation of dispatcher");
        Ok(())
    }

    /// Deactivation is a no-op; a dispatcher has no key material.
    pub fn deactivate(&self) -> Result<()> {
        tracing::debug!(worker_id = %self.worker_id, "ignoring deactivation of dispatcher");
        Ok(())
    }
}
