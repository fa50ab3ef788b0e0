//! # Signet Worker
//!
//! Request-processing core of a signet signing server.
//!
//! This crate provides:
//! - **Crypto tokens**: one activation state machine over software keystores
//!   and hardware modules
//! - **Usage limits**: durable, exactly-once per-key signature counters
//! - **Authorization**: fail-closed client matching by certificate or username
//! - **Dispatch**: failover over an ordered list of signers
//! - **Validation**: a TTL cache for revocation results from trusted issuers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RequestPipeline                         │
//! │ authorize ─▶ disabled ─▶ validity ─▶ sign ─▶ archive ─▶ log │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │   AuthorizationGate  │            WorkerRegistry            │
//! │                      │  Signer │ Dispatcher │ Validator     │
//! ├──────────────────────┴─────────┴────────────┴───────────────┤
//! │  CryptoToken (Software │ Hardware)     ValidationService    │
//! ├──────────────┬───────────────────┬──────────────────────────┤
//! │ SecretCache  │   UsageLimiter    │    ValidationCache       │
//! │ (zeroizing)  │ (CAS on storage)  │    (moka, TTL)           │
//! └──────────────┴───────────────────┴──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use signet_storage::{FileBackend, WorkerId};
//! use signet_worker::{
//!     RequestPipeline, SecretCache, TokenServices, UsageLimiter, WorkerRegistry,
//!     audit::TracingAuditLogger,
//!     config::{TokenConfig, WorkerConfig, WorkerKindConfig},
//!     context::RequestContext,
//!     pipeline::ProcessRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(FileBackend::open("/var/lib/signet/counters.json").await?);
//! let services = TokenServices::builder()
//!     .secret_cache(Arc::new(SecretCache::new()))
//!     .limiter(Arc::new(UsageLimiter::new(storage)))
//!     .audit(Arc::new(TracingAuditLogger))
//!     .build();
//! let registry = Arc::new(WorkerRegistry::builder().services(services).build());
//!
//! let config = WorkerConfig::builder()
//!     .id(WorkerId(1))
//!     .name("timestamp-signer")
//!     .key_usage_limit(100_000)
//!     .kind(WorkerKindConfig::signer(TokenConfig::software("/etc/signet/signer.json")))
//!     .build()?;
//! registry.register(config).await?;
//! registry.activate(WorkerId(1), b"foo123").await?;
//!
//! let pipeline = RequestPipeline::builder().registry(registry).build();
//! let mut ctx = RequestContext::default();
//! let request = ProcessRequest::new(1, &b"data"[..]);
//! let response = pipeline.process(&WorkerId(1).into(), request, &mut ctx).await?;
//! println!("signature: {} bytes", response.processed_payload.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`pkcs11`**: Loads hardware modules through PKCS#11 (`cryptoki`).
//! - **`failpoints`**: Enables fault injection points for tests.
//! - **`testutil`**: Enables the `testutil` module with mock hardware modules, recording
//!   collaborators, and assertion macros.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod audit;
pub mod authorization;
pub mod certificate;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod pipeline;
pub mod registry;
pub mod secret_cache;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod token;
pub mod usage_limiter;
pub mod validation;
pub mod worker_log;

// Re-export key types for convenience
pub use authorization::AuthorizationGate;
pub use error::{ErrorKind, Result, WorkerError};
pub use pipeline::{ProcessRequest, ProcessResponse, RequestPipeline, WorkerStatus};
pub use registry::{WorkerRef, WorkerRegistry};
pub use secret_cache::SecretCache;
pub use token::{CryptoToken, CryptoTokenState, TokenServices};
pub use usage_limiter::UsageLimiter;
pub use validation::{ValidationCache, ValidationService};
