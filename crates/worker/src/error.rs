//! Worker error taxonomy.
//!
//! Every request-facing failure maps onto one of five [`WorkerError`]
//! variants. Callers classify failures through [`WorkerError::kind`]:
//!
//! | Kind | Meaning | Retry |
//! |------|---------|-------|
//! | `IllegalRequest` | malformed input or failed authorization | never |
//! | `CryptoTokenOffline` | token inactive, usage limit reached, no usable candidate | after reactivation |
//! | `CryptoTokenAuthenticationFailure` | wrong activation secret | with the correct secret |
//! | `ArchiveFailure` | archiver collaborator failed | logged only |
//! | `Internal` | native-boundary or storage failure | opaque to the caller |
//!
//! Failures at the key-store boundary are reported as [`KeyStoreError`] and
//! translated by the token state machine.

use std::{fmt, sync::Arc};

use signet_storage::{BoxError, ConfigError, StorageError};
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Classification of a [`WorkerError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or failed authorization.
    IllegalRequest,
    /// The crypto token cannot be used right now.
    CryptoTokenOffline,
    /// The activation secret was rejected.
    CryptoTokenAuthenticationFailure,
    /// An archiver failed.
    ArchiveFailure,
    /// Unexpected internal failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalRequest => write!(f, "illegal_request"),
            Self::CryptoTokenOffline => write!(f, "crypto_token_offline"),
            Self::CryptoTokenAuthenticationFailure => {
                write!(f, "crypto_token_authentication_failure")
            },
            Self::ArchiveFailure => write!(f, "archive_failure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors surfaced by the request-processing core.
///
/// `Internal` keeps its message and source chain for server-side logging,
/// but its `Display` output never includes them.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases without a
/// semver-breaking change. Downstream match expressions must include a
/// wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Malformed input or failed authorization.
    #[error("{message}")]
    IllegalRequest {
        /// Reason reported to the caller.
        message: String,
    },

    /// Token not active, usage limit exhausted, or no usable dispatch candidate.
    #[error("{message}")]
    CryptoTokenOffline {
        /// Reason reported to the caller.
        message: String,
    },

    /// The activation secret was wrong.
    #[error("{message}")]
    CryptoTokenAuthenticationFailure {
        /// Reason reported to the caller.
        message: String,
    },

    /// An archiving collaborator failed.
    #[error("Archive failure: {message}")]
    ArchiveFailure {
        /// Description of the archiving failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Unexpected native-boundary or storage failure.
    #[error("internal failure")]
    Internal {
        /// Server-side description, never shown to callers.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl WorkerError {
    /// Creates an `IllegalRequest` error.
    #[must_use]
    pub fn illegal_request(message: impl Into<String>) -> Self {
        Self::IllegalRequest { message: message.into() }
    }

    /// Creates a `CryptoTokenOffline` error.
    #[must_use]
    pub fn offline(message: impl Into<String>) -> Self {
        Self::CryptoTokenOffline { message: message.into() }
    }

    /// Creates a `CryptoTokenAuthenticationFailure` error.
    #[must_use]
    pub fn authentication_failure(message: impl Into<String>) -> Self {
        Self::CryptoTokenAuthenticationFailure { message: message.into() }
    }

    /// Creates an `ArchiveFailure` error.
    #[must_use]
    pub fn archive_failure(message: impl Into<String>) -> Self {
        Self::ArchiveFailure { message: message.into(), source: None }
    }

    /// Creates an `ArchiveFailure` error with a source error.
    #[must_use]
    pub fn archive_failure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ArchiveFailure { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates an `Internal` error with a source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalRequest { .. } => ErrorKind::IllegalRequest,
            Self::CryptoTokenOffline { .. } => ErrorKind::CryptoTokenOffline,
            Self::CryptoTokenAuthenticationFailure { .. } => {
                ErrorKind::CryptoTokenAuthenticationFailure
            },
            Self::ArchiveFailure { .. } => ErrorKind::ArchiveFailure,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` if the caller may meaningfully retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CryptoTokenOffline { .. })
    }

    /// Returns the full server-side description, including the detail
    /// withheld from `Display` for internal failures.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Internal { message, .. } => format!("internal failure: {message}"),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for WorkerError {
    fn from(err: StorageError) -> Self {
        Self::internal_with_source("storage operation failed", err)
    }
}

impl From<ConfigError> for WorkerError {
    fn from(err: ConfigError) -> Self {
        Self::internal_with_source("invalid worker configuration", err)
    }
}

/// Failures reported by key stores and hardware modules.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyStoreError {
    /// The activation secret did not unlock the key material.
    #[error("wrong activation secret")]
    WrongSecret,

    /// The key store or hardware module could not be reached.
    #[error("key store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// No key material has been provisioned.
    #[error("no key material present")]
    NoKey,

    /// The key store contents are corrupt or inconsistent.
    #[error("malformed key store: {message}")]
    Malformed {
        /// Description of the inconsistency.
        message: String,
    },

    /// Any other failure inside the native boundary.
    #[error("key store backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl KeyStoreError {
    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Creates a `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed { message: message.into() }
    }

    /// Creates a `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into(), source: None }
    }

    /// Creates a `Backend` error with a source error.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend { message: message.into(), source: Some(Arc::new(source)) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkerError::illegal_request("Authorization failed: no match");
        assert_eq!(err.to_string(), "Authorization failed: no match");

        let err = WorkerError::offline("Crypto token is offline");
        assert_eq!(err.to_string(), "Crypto token is offline");

        let err = WorkerError::archive_failure("disk full");
        assert_eq!(err.to_string(), "Archive failure: disk full");
    }

    #[test]
    fn test_internal_display_is_opaque() {
        let err = WorkerError::internal("PKCS#11 C_Sign returned CKR_DEVICE_ERROR");
        assert_eq!(err.to_string(), "internal failure");
        assert!(err.detail().contains("CKR_DEVICE_ERROR"));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(WorkerError::illegal_request("x").kind(), ErrorKind::IllegalRequest);
        assert_eq!(WorkerError::offline("x").kind(), ErrorKind::CryptoTokenOffline);
        assert_eq!(
            WorkerError::authentication_failure("x").kind(),
            ErrorKind::CryptoTokenAuthenticationFailure
        );
        assert_eq!(WorkerError::archive_failure("x").kind(), ErrorKind::ArchiveFailure);
        assert_eq!(WorkerError::internal("x").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_only_offline_is_retryable() {
        assert!(WorkerError::offline("x").is_retryable());
        assert!(!WorkerError::illegal_request("x").is_retryable());
        assert!(!WorkerError::authentication_failure("x").is_retryable());
        assert!(!WorkerError::internal("x").is_retryable());
    }

    #[test]
    fn test_storage_error_maps_to_internal_with_source() {
        let err: WorkerError = StorageError::internal("backend down").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "internal failure");
        let source = err.source().expect("source should be preserved");
        assert!(source.to_string().contains("backend down"));
    }

    #[test]
    fn test_config_error_maps_to_internal() {
        let err: WorkerError = ConfigError::MissingProperty { field: "keystore_path" }.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_key_store_error_display() {
        assert_eq!(KeyStoreError::WrongSecret.to_string(), "wrong activation secret");
        assert_eq!(
            KeyStoreError::unavailable("slot 0 missing").to_string(),
            "key store unavailable: slot 0 missing"
        );
        assert_eq!(KeyStoreError::NoKey.to_string(), "no key material present");
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::CryptoTokenOffline.to_string(), "crypto_token_offline");
        assert_eq!(ErrorKind::IllegalRequest.to_string(), "illegal_request");
    }
}
