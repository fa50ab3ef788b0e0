//! Durable key-value storage for signet signing workers.
//!
//! This crate provides the [`StorageBackend`] trait and the backends behind
//! the state that must outlive a single request: the per-key usage counters
//! enforced by the worker crate's usage limiter and the storage-backed
//! archiver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Request Pipeline                         │
//! │        (authorization, crypto token, archiving)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Usage Limiter          │      StorageArchiver        │
//! │  (CAS loop, exactly-once)     │   (archive/<worker>/<id>)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   signet-storage                            │
//! │              StorageBackend trait                           │
//! │   (get, set, compare_and_set, delete, get_prefix)           │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│                FileBackend                   │
//! │   (testing)  │     (durable JSON snapshot, atomic rename)   │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use signet_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Insert-if-absent, then update-if-unchanged
//!     backend.compare_and_set(b"counter", None, b"1".to_vec()).await?;
//!     backend.compare_and_set(b"counter", Some(&b"1"[..]), b"2".to_vec()).await?;
//!
//!     let value = backend.get(b"counter").await?;
//!     assert_eq!(value.as_deref(), Some(&b"2"[..]));
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Persistence |
//! |---------|----------|-------------|
//! | [`MemoryBackend`] | Testing, development | No |
//! | [`FileBackend`] | Single-node deployments | Yes |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (key/value generators,
//!   backend factories, assertion macros). Enable this in `[dev-dependencies]` for integration
//!   tests.

#![deny(unsafe_code)]

pub mod backend;
pub mod error;
pub mod file;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use types::{KeyValue, WorkerId};
