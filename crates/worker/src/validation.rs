//! Certificate validation and the validation result cache.
//!
//! Revocation lookups are slow, so [`ValidationCache`] keeps the latest
//! outcome per certificate for a short TTL. Only results for certificates
//! issued by a configured trusted issuer are cached; everything else is
//! looked up every time.
//!
//! Expiry is checked when an entry is read: an entry older than the TTL is
//! never returned, even if the underlying cache has not evicted it yet.
//!
//! [`ValidationService`] puts the cache in front of an ordered list of
//! [`CertificateValidator`] collaborators.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use signet_storage::WorkerId;
use tokio::time::Instant;

use crate::{
    certificate::{Certificate, normalize_dn},
    config::ValidationCacheConfig,
    error::{Result, WorkerError},
};

/// Upper bound on cached results per validator worker.
const MAX_CACHED_RESULTS: u64 = 10_000;

/// Outcome of validating one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// Valid and not revoked.
    Valid,
    /// Revoked by its issuer.
    Revoked,
    /// Validity period has not started.
    NotYetValid,
    /// Validity period has ended.
    Expired,
    /// The issuer asks that revocation not be checked.
    DontVerify,
    /// A CA in the chain is revoked.
    CaRevoked,
    /// A CA in the chain is not yet valid.
    CaNotYetValid,
    /// A CA in the chain has expired.
    CaExpired,
    /// The certificate cannot serve the requested purpose.
    BadCertType,
    /// No validator handles the issuer.
    IssuerNotSupported,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "VALID",
            Self::Revoked => "REVOKED",
            Self::NotYetValid => "NOT_YET_VALID",
            Self::Expired => "EXPIRED",
            Self::DontVerify => "DONT_VERIFY",
            Self::CaRevoked => "CA_REVOKED",
            Self::CaNotYetValid => "CA_NOT_YET_VALID",
            Self::CaExpired => "CA_EXPIRED",
            Self::BadCertType => "BAD_CERT_TYPE",
            Self::IssuerNotSupported => "ISSUER_NOT_SUPPORTED",
        };
        f.write_str(name)
    }
}

/// Validation outcome with revocation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Overall status.
    pub status: ValidationStatus,
    /// Human-readable detail.
    pub message: String,
    /// When the certificate was revoked, if it was.
    pub revocation_date: Option<DateTime<Utc>>,
    /// CRL reason code, if revoked.
    pub revocation_reason: Option<i32>,
}

impl ValidationResult {
    /// Creates a result without revocation details.
    #[must_use]
    pub fn new(status: ValidationStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), revocation_date: None, revocation_reason: None }
    }

    /// Creates a `Valid` result.
    #[must_use]
    pub fn valid() -> Self {
        Self::new(ValidationStatus::Valid, "This certificate is valid")
    }

    /// Creates a `Revoked` result.
    #[must_use]
    pub fn revoked(revocation_date: DateTime<Utc>, revocation_reason: i32) -> Self {
        Self {
            status: ValidationStatus::Revoked,
            message: "This certificate is revoked".to_owned(),
            revocation_date: Some(revocation_date),
            revocation_reason: Some(revocation_reason),
        }
    }
}

/// Response returned to validation clients.
pub type ValidationResponse = ValidationResult;

/// Purpose a certificate is validated for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertType {
    /// No usage requirement.
    #[default]
    Any,
    /// Client identification; requires `digitalSignature`.
    Identification,
    /// Electronic signatures; requires `nonRepudiation`.
    ElectronicSignature,
}

impl CertType {
    fn permits(self, certificate: &Certificate) -> bool {
        // Without a key usage extension every usage is permitted.
        let Some(usage) = certificate.key_usage() else {
            return true;
        };
        match self {
            Self::Any => true,
            Self::Identification => usage.digital_signature,
            Self::ElectronicSignature => usage.non_repudiation,
        }
    }
}

/// A certificate to validate and the purpose it is validated for.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Certificate under validation.
    pub certificate: Certificate,
    /// Required purpose.
    pub cert_type: CertType,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct CachedResult {
    result: ValidationResult,
    inserted_at: Instant,
}

/// TTL cache of validation results for trusted issuers.
pub struct ValidationCache {
    entries: Cache<String, CachedResult>,
    trusted_issuers: HashSet<String>,
    ttl: Duration,
}

impl fmt::Debug for ValidationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationCache")
            .field("trusted_issuers", &self.trusted_issuers)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl ValidationCache {
    /// Creates a cache for the given issuer DNs and TTL.
    ///
    /// Issuer DNs are normalized before comparison. A zero TTL disables
    /// caching: every read misses.
    #[must_use]
    pub fn new<I, S>(trusted_issuers: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = Cache::builder().max_capacity(MAX_CACHED_RESULTS);
        if !ttl.is_zero() {
            builder = builder.time_to_live(ttl);
        }
        let trusted_issuers =
            trusted_issuers.into_iter().map(|dn| normalize_dn(dn.as_ref())).collect();
        Self { entries: builder.build(), trusted_issuers, ttl }
    }

    /// Creates a cache from validator configuration.
    #[must_use]
    pub fn from_config(config: &ValidationCacheConfig) -> Self {
        Self::new(&config.trusted_issuers, config.ttl)
    }

    /// Returns `true` if results for `issuer_dn` may be cached.
    #[must_use]
    pub fn is_trusted(&self, issuer_dn: &str) -> bool {
        self.trusted_issuers.contains(&normalize_dn(issuer_dn))
    }

    /// Returns the cached result, unless absent or older than the TTL.
    pub async fn get(&self, certificate: &Certificate) -> Option<ValidationResult> {
        let entry = self.entries.get(&certificate.identity()).await?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.result)
    }

    /// Stores `result`, replacing any earlier entry. Ignored for untrusted
    /// issuers.
    pub async fn put(&self, certificate: &Certificate, result: ValidationResult) {
        if !self.is_trusted(certificate.issuer_dn()) {
            tracing::trace!(issuer = %certificate.issuer_dn(), "not caching untrusted issuer");
            return;
        }
        let entry = CachedResult { result, inserted_at: Instant::now() };
        self.entries.insert(certificate.identity(), entry).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// A revocation checker for certificates from particular issuers.
#[async_trait]
pub trait CertificateValidator: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Returns `true` if this validator handles certificates from `issuer_dn`.
    fn supports(&self, issuer_dn: &str) -> bool;

    /// Checks the revocation status of `certificate`.
    async fn validate(&self, certificate: &Certificate) -> Result<ValidationResult>;
}

#[async_trait]
impl<V: CertificateValidator + ?Sized> CertificateValidator for Arc<V> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports(&self, issuer_dn: &str) -> bool {
        (**self).supports(issuer_dn)
    }

    async fn validate(&self, certificate: &Certificate) -> Result<ValidationResult> {
        (**self).validate(certificate).await
    }
}

/// Validation cache in front of an ordered list of validators.
pub struct ValidationService {
    worker_id: WorkerId,
    cache: ValidationCache,
    validators: Vec<Arc<dyn CertificateValidator>>,
}

impl fmt::Debug for ValidationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationService")
            .field("worker_id", &self.worker_id)
            .field("cache", &self.cache)
            .field("validators", &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ValidationService {
    /// Creates a service for `worker_id`.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        cache: ValidationCache,
        validators: Vec<Arc<dyn CertificateValidator>>,
    ) -> Self {
        Self { worker_id, cache, validators }
    }

    /// Returns the result cache.
    #[must_use]
    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    /// Validates `request` at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] if no validator supports the
    /// issuer, or any error raised by the validator.
    #[tracing::instrument(
        skip(self, request),
        fields(worker_id = %self.worker_id, serial = %request.certificate.serial_number())
    )]
    pub async fn validate(&self, request: &ValidationRequest) -> Result<ValidationResponse> {
        let certificate = &request.certificate;
        let now = Utc::now();

        if now < certificate.not_before() {
            return Ok(ValidationResult::new(
                ValidationStatus::NotYetValid,
                format!("Certificate is not valid until {}", certificate.not_before()),
            ));
        }
        if now > certificate.not_after() {
            return Ok(ValidationResult::new(
                ValidationStatus::Expired,
                format!("Certificate expired at {}", certificate.not_after()),
            ));
        }
        if !request.cert_type.permits(certificate) {
            return Ok(ValidationResult::new(
                ValidationStatus::BadCertType,
                format!("Certificate cannot be used for {:?}", request.cert_type),
            ));
        }

        if let Some(cached) = self.cache.get(certificate).await {
            tracing::debug!(status = %cached.status, "validation cache hit");
            return Ok(cached);
        }

        let Some(validator) = self.validators.iter().find(|v| v.supports(certificate.issuer_dn()))
        else {
            return Err(WorkerError::illegal_request(format!(
                "Issuer of given certificate isn't supported: {}",
                certificate.issuer_dn()
            )));
        };

        let result = validator.validate(certificate).await?;
        tracing::debug!(validator = validator.name(), status = %result.status, "validated");
        self.cache.put(certificate, result.clone()).await;
        Ok(result)
    }
}
