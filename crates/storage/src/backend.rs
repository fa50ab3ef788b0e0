//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the minimal key-value interface the signing workers
//! need from durable storage: point reads and writes, an atomic
//! compare-and-set for exactly-once counters, and prefix scans for status
//! queries.
//!
//! # Design Philosophy
//!
//! - **Keys and values are bytes**: No assumptions about serialization format
//! - **Async by default**: Durable writes may block on I/O
//! - **Object safe**: Components hold an `Arc<dyn StorageBackend>` so the storage engine is a
//!   deployment choice
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Make [`compare_and_set`](StorageBackend::compare_and_set) atomic with respect to every other
//!    writer of the same store, including other processes if the store is shared
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError)
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation and
//! [`FileBackend`](crate::FileBackend) for a durable one.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_prefix`](StorageBackend::get_prefix) | Retrieve every key sharing a prefix |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use signet_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any existing value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// # Semantics
    ///
    /// - **`expected: None`**: insert-if-absent. Succeeds only when the key does not exist. Fails
    ///   with [`Conflict`](crate::StorageError::Conflict) if any value is present.
    /// - **`expected: Some(value)`**: update-if-unchanged. Succeeds only when the current value is
    ///   an exact byte-for-byte match of `value`. Fails with
    ///   [`Conflict`](crate::StorageError::Conflict) if the key is absent or holds a different
    ///   value.
    ///
    /// When this returns `Ok(())` the new value is visible to every
    /// subsequent reader, and for durable backends it has reached stable
    /// storage.
    ///
    /// # Retry Pattern
    ///
    /// `Conflict` is not transient. Implement an application-level CAS loop
    /// that re-reads before retrying:
    ///
    /// ```no_run
    /// use signet_storage::{MemoryBackend, StorageBackend, StorageError};
    ///
    /// async fn increment(backend: &MemoryBackend, key: &[u8]) -> Result<u64, StorageError> {
    ///     loop {
    ///         let current = backend.get(key).await?;
    ///         let n: u64 = match &current {
    ///             Some(bytes) => String::from_utf8_lossy(bytes).parse().unwrap_or(0),
    ///             None => 0,
    ///         };
    ///         let next = (n + 1).to_string().into_bytes();
    ///         match backend.compare_and_set(key, current.as_deref(), next).await {
    ///             Ok(()) => return Ok(n + 1),
    ///             Err(StorageError::Conflict) => continue,
    ///             Err(e) => return Err(e),
    ///         }
    ///     }
    /// }
    /// ```
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Deletes a key.
    ///
    /// If the key doesn't exist, this is a no-op (returns `Ok(())`).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves every key-value pair whose key starts with `prefix`, in
    /// ascending key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>>;

    /// Verifies that the backend is able to serve requests.
    #[must_use = "health checks may fail and errors must be handled"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        (**self).compare_and_set(key, expected, new_value).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        (**self).get_prefix(prefix).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
