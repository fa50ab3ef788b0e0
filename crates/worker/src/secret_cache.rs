//! Process-wide cache of activation secrets.
//!
//! Software tokens store the secret that last activated them here, so a
//! worker reload can re-activate without prompting an operator again.
//! Secrets never reach durable storage and are never logged.
//!
//! # Wiping
//!
//! Every buffer leaving the cache is overwritten with zeros in place before
//! it is dropped, whether it leaves through [`SecretCache::remove`], an
//! overwriting [`SecretCache::put`], or [`SecretCache::clear`]. Callers get
//! copies, so mutating a returned secret never touches the cached slot.
//!
//! # Locking
//!
//! One lock guards the whole map. The cache is small and written rarely
//! compared to signing traffic, so sharding by worker buys nothing.

use std::collections::HashMap;

use parking_lot::Mutex;
use signet_storage::WorkerId;
use zeroize::{Zeroize, Zeroizing};

/// A PIN or password buffer that zeroes itself on drop.
pub type ActivationSecret = Zeroizing<Vec<u8>>;

/// Cache of activation secrets keyed by worker.
#[derive(Default)]
pub struct SecretCache {
    entries: Mutex<HashMap<WorkerId, ActivationSecret>>,
}

impl std::fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCache").field("entries", &self.entries.lock().len()).finish()
    }
}

/// Overwrites the full length of an evicted buffer with zeros.
///
/// The buffer is returned so tests can observe the wiped bytes; production
/// callers drop it immediately.
fn wipe(evicted: Option<ActivationSecret>) -> Option<ActivationSecret> {
    evicted.map(|mut secret| {
        secret.as_mut_slice().zeroize();
        secret
    })
}

impl SecretCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `secret` for `worker`, wiping any previous value.
    pub fn put(&self, worker: WorkerId, secret: &[u8]) {
        drop(self.replace(worker, secret));
    }

    fn replace(&self, worker: WorkerId, secret: &[u8]) -> Option<ActivationSecret> {
        let previous = self.entries.lock().insert(worker, Zeroizing::new(secret.to_vec()));
        wipe(previous)
    }

    /// Returns a copy of the secret cached for `worker`.
    #[must_use]
    pub fn get(&self, worker: WorkerId) -> Option<ActivationSecret> {
        self.entries.lock().get(&worker).map(|secret| Zeroizing::new(secret.to_vec()))
    }

    /// Wipes and removes the secret for `worker`. Missing entries are a no-op.
    pub fn remove(&self, worker: WorkerId) {
        drop(self.take(worker));
    }

    fn take(&self, worker: WorkerId) -> Option<ActivationSecret> {
        let removed = self.entries.lock().remove(&worker);
        wipe(removed)
    }

    /// Returns `true` if a secret is cached for `worker`.
    #[must_use]
    pub fn contains(&self, worker: WorkerId) -> bool {
        self.entries.lock().contains_key(&worker)
    }

    /// Returns the number of cached secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wipes every cached secret. Called on process shutdown.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, secret)| secret).collect();
        for secret in drained {
            drop(wipe(Some(secret)));
        }
    }
}

impl Drop for SecretCache {
    fn drop(&mut self) {
        self.clear();
    }
}
