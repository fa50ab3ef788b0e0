//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! signet-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use signet_storage::testutil::{make_key, populated_backend};
//! ```

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"` (zero-padded to 6 digits) so that
/// lexicographic ordering matches numeric ordering.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a test value tagged with a task ID and sequence number.
///
/// Produces values like `"task3-val042"`. Useful for concurrent tests where
/// you need to identify which task wrote which value.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// Create a [`MemoryBackend`] pre-populated with `count` keys under `prefix`.
///
/// # Panics
///
/// Panics if any `set` operation fails (should not happen with `MemoryBackend`).
pub async fn populated_backend(prefix: &str, count: usize) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for i in 0..count {
        backend.set(make_key(prefix, i), make_tagged_value(0, i)).await.expect("populate set failed");
    }
    backend
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use signet_storage::assert_conflict;
/// use signet_storage::error::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok` and return the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// Helper to verify that a result is a `Conflict` error.
pub fn is_conflict<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::Conflict))
}
