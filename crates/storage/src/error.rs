//! Storage error types and result alias.
//!
//! All storage backends map their internal failures onto [`StorageError`].
//! Configuration validation anywhere in the workspace reports [`ConfigError`].
//!
//! A missing key is not an error: `get` returns `Ok(None)`. The only
//! expected failure is [`StorageError::Conflict`], which a compare-and-set
//! caller resolves by re-reading.
//!
//! ```
//! use signet_storage::{StorageError, StorageResult};
//!
//! fn decode_count(bytes: &[u8]) -> StorageResult<u64> {
//!     std::str::from_utf8(bytes)
//!         .ok()
//!         .and_then(|s| s.parse().ok())
//!         .ok_or_else(|| StorageError::serialization("counter is not a number"))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, enabling
/// debugging tools to display the full error context.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases without a
/// semver-breaking change. Downstream match expressions must include a
/// wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A compare-and-set precondition did not hold.
    ///
    /// Another writer changed the key between the caller's read and its
    /// conditional write. Callers typically re-read and retry.
    #[error("Compare-and-set conflict")]
    Conflict,

    /// Filesystem error in a durable backend.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the I/O failure.
        message: String,
        /// The underlying error that caused this failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    ///
    /// Usually indicates a corrupted snapshot or a schema mismatch between
    /// the stored bytes and the reader.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Io` error with a message and source error.
    #[must_use]
    pub fn io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Io { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }
}

/// Errors produced while validating configuration values.
///
/// Returned by validating builders and by component `init` operations when a
/// mandatory property is missing or malformed. A `ConfigError` is reported to
/// the operator; it never brings down the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered for display.
        value: String,
        /// The minimum accepted value, rendered for display.
        min: String,
    },

    /// A mandatory property was not provided.
    #[error("missing mandatory property: {field}")]
    MissingProperty {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A property was provided but could not be used.
    #[error("invalid value for {field} ({value}): {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered for display.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
}
