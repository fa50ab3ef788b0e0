//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], an in-memory implementation of
//! [`StorageBackend`] suitable for testing and single-process development.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for efficient prefix scans
//! - **Atomic CAS**: Compare and write happen under one write lock
//!
//! # Example
//!
//! ```
//! use signet_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! Data is not persisted; all data is lost when the process exits. Use
//! [`FileBackend`](crate::FileBackend) when counters must survive restarts.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    types::KeyValue,
};

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryBackend {
    /// Creates a new, empty in-memory storage backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.len()).finish()
    }
}

/// Collects every entry of `data` whose key starts with `prefix`.
pub(crate) fn scan_prefix(data: &BTreeMap<Vec<u8>, Bytes>, prefix: &[u8]) -> Vec<KeyValue> {
    data.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
        .collect()
}

/// Evaluates a compare-and-set precondition against the current value.
pub(crate) fn cas_matches(expected: Option<&[u8]>, current: Option<&Bytes>) -> bool {
    match (expected, current) {
        (None, None) => true,
        (Some(exp), Some(cur)) => exp == &cur[..],
        _ => false,
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let data = self.data.read();
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mut data = self.data.write();
        data.insert(key, Bytes::from(value));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();

        if !cas_matches(expected, data.get(key)) {
            return Err(StorageError::Conflict);
        }

        data.insert(key.to_vec(), Bytes::from(new_value));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        data.remove(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let data = self.data.read();
        Ok(scan_prefix(&data, prefix))
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Try to acquire read lock to verify we're not deadlocked
        let _unused = self.data.read();
        Ok(())
    }
}
