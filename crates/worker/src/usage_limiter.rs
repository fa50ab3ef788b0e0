//! Durable, exactly-once key usage counters.
//!
//! Each (worker, key generation) pair owns one counter in a
//! [`StorageBackend`]. [`UsageLimiter::check_and_increment`] reads the
//! counter and conditionally bumps it with a compare-and-set, retrying on
//! conflict. Because the conditional write is the only mutation, racing
//! callers near the limit are serialized by the store itself: exactly one
//! of them moves the counter from `L - 1` to `L`, and every other caller
//! re-reads `L` and is rejected.
//!
//! # Key Layout
//!
//! ```text
//! keyusage/{worker_id}/{sha256(public key) hex}  ->  {"count": n}
//! ```
//!
//! Provisioning a new key changes the public key hash and therefore starts a
//! fresh counter.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use signet_storage::{MemoryBackend, WorkerId};
//! use signet_worker::usage_limiter::{UsageDecision, UsageLimiter};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let limiter = UsageLimiter::new(Arc::new(MemoryBackend::new()));
//! let decision = limiter.check_and_increment(WorkerId(1), b"pubkey", Some(2)).await.unwrap();
//! assert_eq!(decision, UsageDecision::Allowed);
//! # });
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use fail::fail_point;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signet_storage::{StorageBackend, StorageError, StorageResult, WorkerId};

/// Prefix shared by every usage counter key.
pub const COUNTER_PREFIX: &str = "keyusage/";

/// Outcome of a usage check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDecision {
    /// The operation may proceed; the counter was incremented.
    Allowed,
    /// The limit is reached; the counter is unchanged.
    LimitExceeded,
}

impl UsageDecision {
    /// Returns `true` for [`UsageDecision::Allowed`].
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRecord {
    count: u64,
}

#[derive(Debug, Default)]
struct LimiterMetrics {
    allowed: AtomicU64,
    rejected: AtomicU64,
    conflicts: AtomicU64,
}

/// Snapshot of usage limiter metrics.
#[derive(Debug, Clone, Default)]
pub struct UsageLimiterMetricsSnapshot {
    /// Increments that were committed.
    pub allowed: u64,
    /// Checks rejected because the limit was reached.
    pub rejected: u64,
    /// Compare-and-set conflicts that forced a re-read.
    pub conflicts: u64,
}

/// Builds the storage key for a worker's counter on a given public key.
#[must_use]
pub fn counter_key(worker: WorkerId, public_key: &[u8]) -> Vec<u8> {
    let digest = hex::encode(Sha256::digest(public_key));
    format!("{COUNTER_PREFIX}{worker}/{digest}").into_bytes()
}

fn decode(bytes: &[u8]) -> StorageResult<u64> {
    serde_json::from_slice::<CounterRecord>(bytes)
        .map(|record| record.count)
        .map_err(|e| StorageError::serialization_with_source("corrupt usage counter", e))
}

fn encode(count: u64) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(&CounterRecord { count })
        .map_err(|e| StorageError::serialization_with_source("failed to encode usage counter", e))
}

/// Enforces per-key signature limits against a shared store.
pub struct UsageLimiter {
    backend: Arc<dyn StorageBackend>,
    metrics: LimiterMetrics,
}

impl std::fmt::Debug for UsageLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLimiter").field("metrics", &self.metrics).finish_non_exhaustive()
    }
}

impl UsageLimiter {
    /// Creates a limiter over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend, metrics: LimiterMetrics::default() }
    }

    /// Atomically checks the counter against `limit` and increments it.
    ///
    /// With `limit: None` the call returns `Allowed` without touching the
    /// store. Otherwise the counter `n` is incremented only when `n < limit`,
    /// and the new value is durable before `Allowed` is returned.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`StorageError`] if the store fails or holds a
    /// corrupt counter. Conflicts are retried internally.
    #[tracing::instrument(skip(self, public_key), fields(worker_id = %worker))]
    pub async fn check_and_increment(
        &self,
        worker: WorkerId,
        public_key: &[u8],
        limit: Option<u64>,
    ) -> StorageResult<UsageDecision> {
        let Some(limit) = limit else {
            return Ok(UsageDecision::Allowed);
        };
        let key = counter_key(worker, public_key);

        loop {
            let current = self.backend.get(&key).await?;
            let count = match &current {
                Some(bytes) => decode(bytes)?,
                None => 0,
            };

            if count >= limit {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(count, limit, "key usage limit reached");
                return Ok(UsageDecision::LimitExceeded);
            }

            fail_point!("limiter-before-cas", |_| {
                Err(StorageError::internal("injected failure before usage counter write"))
            });

            let next = encode(count + 1)?;
            match self.backend.compare_and_set(&key, current.as_deref(), next).await {
                Ok(()) => {
                    self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
                    return Ok(UsageDecision::Allowed);
                },
                Err(StorageError::Conflict) => {
                    self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-mutating check used before an expensive signing operation.
    ///
    /// A `true` result is advisory; only [`check_and_increment`](Self::check_and_increment)
    /// commits a use.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`StorageError`] if the counter cannot be read.
    pub async fn is_within_limit(
        &self,
        worker: WorkerId,
        public_key: &[u8],
        limit: Option<u64>,
    ) -> StorageResult<bool> {
        let Some(limit) = limit else {
            return Ok(true);
        };
        let count = self.counter_value(worker, public_key).await?.unwrap_or(0);
        Ok(count < limit)
    }

    /// Returns the committed counter value, or `None` if no use was recorded.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`StorageError`] if the counter cannot be read.
    pub async fn counter_value(
        &self,
        worker: WorkerId,
        public_key: &[u8],
    ) -> StorageResult<Option<u64>> {
        match self.backend.get(&counter_key(worker, public_key)).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Returns a snapshot of the limiter metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> UsageLimiterMetricsSnapshot {
        UsageLimiterMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            conflicts: self.metrics.conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;
    use signet_storage::{FileBackend, MemoryBackend};
    use tokio::task::JoinSet;

    use super::*;

    const PK: &[u8] = b"public-key-1";

    fn limiter() -> (Arc<MemoryBackend>, UsageLimiter) {
        let backend = Arc::new(MemoryBackend::new());
        let limiter = UsageLimiter::new(Arc::clone(&backend) as Arc<dyn StorageBackend>);
        (backend, limiter)
    }

    #[test]
    fn test_counter_key_layout() {
        let key = String::from_utf8(counter_key(WorkerId(42), b"abc")).unwrap();
        assert_eq!(
            key,
            "keyusage/42/ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_no_limit_never_creates_counter() {
        let (backend, limiter) = limiter();
        for _ in 0..5 {
            let decision = limiter.check_and_increment(WorkerId(1), PK, None).await.unwrap();
            assert_eq!(decision, UsageDecision::Allowed);
        }
        assert!(backend.is_empty());
        assert_eq!(limiter.counter_value(WorkerId(1), PK).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_limit_reached_leaves_counter_unchanged() {
        let (_backend, limiter) = limiter();
        for _ in 0..3 {
            let decision = limiter.check_and_increment(WorkerId(1), PK, Some(3)).await.unwrap();
            assert!(decision.is_allowed());
        }
        for _ in 0..2 {
            let decision = limiter.check_and_increment(WorkerId(1), PK, Some(3)).await.unwrap();
            assert_eq!(decision, UsageDecision::LimitExceeded);
        }
        assert_eq!(limiter.counter_value(WorkerId(1), PK).await.unwrap(), Some(3));

        let snapshot = limiter.metrics_snapshot();
        assert_eq!(snapshot.allowed, 3);
        assert_eq!(snapshot.rejected, 2);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_first_use() {
        let (backend, limiter) = limiter();
        let decision = limiter.check_and_increment(WorkerId(1), PK, Some(0)).await.unwrap();
        assert_eq!(decision, UsageDecision::LimitExceeded);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_counters_are_per_key_generation() {
        let (_backend, limiter) = limiter();
        let use_key = |pk: &'static [u8]| limiter.check_and_increment(WorkerId(1), pk, Some(1));
        assert!(use_key(b"old").await.unwrap().is_allowed());
        assert!(!use_key(b"old").await.unwrap().is_allowed());
        assert!(use_key(b"new").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_is_within_limit_does_not_mutate() {
        let (_backend, limiter) = limiter();
        assert!(limiter.is_within_limit(WorkerId(1), PK, Some(1)).await.unwrap());
        assert_eq!(limiter.counter_value(WorkerId(1), PK).await.unwrap(), None);

        limiter.check_and_increment(WorkerId(1), PK, Some(1)).await.unwrap();
        assert!(!limiter.is_within_limit(WorkerId(1), PK, Some(1)).await.unwrap());
        assert!(limiter.is_within_limit(WorkerId(1), PK, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_serialization_error() {
        let (backend, limiter) = limiter();
        backend.set(counter_key(WorkerId(1), PK), b"not json".to_vec()).await.unwrap();
        let err = limiter.check_and_increment(WorkerId(1), PK, Some(5)).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_at_last_slot_allows_exactly_one() {
        let (_backend, limiter) = limiter();
        let limiter = Arc::new(limiter);
        for _ in 0..9 {
            limiter.check_and_increment(WorkerId(1), PK, Some(10)).await.unwrap();
        }

        let mut set = JoinSet::new();
        for _ in 0..16 {
            let limiter = Arc::clone(&limiter);
            set.spawn(async move { limiter.check_and_increment(WorkerId(1), PK, Some(10)).await });
        }

        let mut allowed = 0;
        while let Some(result) = set.join_next().await {
            if result.expect("task panicked").expect("storage error").is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
        assert_eq!(limiter.counter_value(WorkerId(1), PK).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_counter_survives_reopen_of_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        {
            let backend = Arc::new(FileBackend::open(&path).await.unwrap());
            let limiter = UsageLimiter::new(backend);
            limiter.check_and_increment(WorkerId(3), PK, Some(2)).await.unwrap();
            limiter.check_and_increment(WorkerId(3), PK, Some(2)).await.unwrap();
        }

        let backend = Arc::new(FileBackend::open(&path).await.unwrap());
        let limiter = UsageLimiter::new(backend);
        assert_eq!(limiter.counter_value(WorkerId(3), PK).await.unwrap(), Some(2));
        let decision = limiter.check_and_increment(WorkerId(3), PK, Some(2)).await.unwrap();
        assert_eq!(decision, UsageDecision::LimitExceeded);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_allowed_count_equals_min_of_attempts_and_limit(
            limit in 0u64..20,
            attempts in 0usize..40,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (_backend, limiter) = limiter();
                let mut allowed = 0u64;
                for _ in 0..attempts {
                    let decision =
                        limiter.check_and_increment(WorkerId(1), PK, Some(limit)).await.unwrap();
                    if decision.is_allowed() {
                        allowed += 1;
                    }
                }
                prop_assert_eq!(allowed, limit.min(attempts as u64));
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
