//! Shared test utilities for worker testing.
//!
//! Provides an in-memory hardware module, recording collaborators, config
//! and certificate builders, and assertion macros for the error taxonomy.
//! Feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! signet-worker = { path = "../worker", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use signet_worker::testutil::{MockModule, software_token, token_services};
//! ```

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use signet_storage::{MemoryBackend, WorkerId};

use crate::{
    archive::{Archivable, Archiver},
    audit::NoopAuditLogger,
    certificate::{Certificate, SerialNumber, normalize_dn},
    config::{AuthConfig, KdfParams, SecretSource, TokenConfig, WorkerConfig, WorkerKindConfig},
    context::RequestContext,
    error::{KeyStoreError, Result, WorkerError},
    secret_cache::SecretCache,
    token::{
        HardwareModule, KeyStore, ModuleLoader, SoftwareKeyStore, TokenServices,
        UnsupportedModuleLoader,
    },
    usage_limiter::UsageLimiter,
    validation::{CertificateValidator, ValidationResult},
    worker_log::{LogFields, WorkerLogger},
};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The weakest Argon2 parameters that pass validation.
#[must_use]
pub fn fast_kdf() -> KdfParams {
    KdfParams { memory_kib: 8, iterations: 1, parallelism: 1 }
}

/// Software token config at `path` sealed with [`fast_kdf`].
#[must_use]
pub fn software_token(path: &Path) -> TokenConfig {
    TokenConfig::Software {
        keystore_path: path.to_path_buf(),
        kdf: fast_kdf(),
        auto_activation: SecretSource::None,
    }
}

/// Writes a fresh keystore at `path` and returns its public key.
///
/// # Panics
///
/// Panics if the keystore cannot be written.
pub fn provision_software_key(path: &Path, secret: &[u8]) -> Vec<u8> {
    SoftwareKeyStore::new(path, fast_kdf())
        .generate_key(secret)
        .expect("provisioning software key failed")
}

/// Signer named `signer-{id}` that authorizes every client.
///
/// # Panics
///
/// Panics if `token` is invalid.
#[must_use]
pub fn signer_config(id: WorkerId, token: TokenConfig) -> WorkerConfig {
    WorkerConfig::builder()
        .id(id)
        .name(format!("signer-{id}"))
        .auth(AuthConfig::no_auth())
        .kind(WorkerKindConfig::signer(token))
        .build()
        .expect("invalid signer config")
}

/// Token services over an in-memory store without hardware support.
#[must_use]
pub fn token_services() -> TokenServices {
    token_services_with_loader(Arc::new(UnsupportedModuleLoader))
}

/// Token services over an in-memory store using `module_loader`.
#[must_use]
pub fn token_services_with_loader(module_loader: Arc<dyn ModuleLoader>) -> TokenServices {
    TokenServices::builder()
        .secret_cache(Arc::new(SecretCache::new()))
        .limiter(Arc::new(UsageLimiter::new(Arc::new(MemoryBackend::new()))))
        .audit(Arc::new(NoopAuditLogger))
        .module_loader(module_loader)
        .build()
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificates
// ─────────────────────────────────────────────────────────────────────────────

/// A hand-built client certificate valid from yesterday for a year, with no
/// key usage extension.
///
/// # Panics
///
/// Panics if `serial_hex` is not hexadecimal.
#[must_use]
pub fn test_certificate(serial_hex: &str, issuer_dn: &str) -> Certificate {
    let now = Utc::now();
    Certificate::builder()
        .subject_dn("CN=Test Client,O=Signet")
        .issuer_dn(issuer_dn)
        .serial_number(SerialNumber::parse(serial_hex).expect("invalid test serial"))
        .not_before(now - ChronoDuration::days(1))
        .not_after(now + ChronoDuration::days(365))
        .build()
}

// ─────────────────────────────────────────────────────────────────────────────
// Hardware module
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    logged_in: bool,
    unreachable: bool,
    sign_delay: Duration,
    keys: HashMap<String, SigningKey>,
}

/// In-memory [`HardwareModule`] holding Ed25519 keys by label.
pub struct MockModule {
    pin: Vec<u8>,
    state: Mutex<MockState>,
    sign_count: AtomicU64,
}

impl std::fmt::Debug for MockModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockModule")
            .field("logged_in", &state.logged_in)
            .field("unreachable", &state.unreachable)
            .field("keys", &state.keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MockModule {
    /// Creates a reachable module accepting `pin`.
    #[must_use]
    pub fn new(pin: &str) -> Self {
        Self {
            pin: pin.as_bytes().to_vec(),
            state: Mutex::new(MockState::default()),
            sign_count: AtomicU64::new(0),
        }
    }

    /// Makes every call fail as if the device were unplugged.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Delays every signature by `delay`.
    pub fn set_sign_delay(&self, delay: Duration) {
        self.state.lock().sign_delay = delay;
    }

    /// Returns `true` while a session is logged in.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    /// Returns the number of signatures produced.
    #[must_use]
    pub fn sign_count(&self) -> u64 {
        self.sign_count.load(Ordering::Relaxed)
    }

    fn reachable(&self) -> std::result::Result<(), KeyStoreError> {
        if self.state.lock().unreachable {
            return Err(KeyStoreError::unavailable("CKR_DEVICE_REMOVED"));
        }
        Ok(())
    }

    fn key(&self, label: &str) -> std::result::Result<SigningKey, KeyStoreError> {
        self.reachable()?;
        let state = self.state.lock();
        if !state.logged_in {
            return Err(KeyStoreError::unavailable("CKR_USER_NOT_LOGGED_IN"));
        }
        state.keys.get(label).cloned().ok_or(KeyStoreError::NoKey)
    }
}

impl HardwareModule for MockModule {
    fn login(&self, pin: &[u8]) -> std::result::Result<(), KeyStoreError> {
        self.reachable()?;
        if pin != self.pin.as_slice() {
            return Err(KeyStoreError::WrongSecret);
        }
        self.state.lock().logged_in = true;
        Ok(())
    }

    fn logout(&self) -> std::result::Result<(), KeyStoreError> {
        self.state.lock().logged_in = false;
        Ok(())
    }

    fn public_key(&self, label: &str) -> std::result::Result<Vec<u8>, KeyStoreError> {
        Ok(self.key(label)?.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, label: &str, data: &[u8]) -> std::result::Result<Vec<u8>, KeyStoreError> {
        let delay = self.state.lock().sign_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let signature = self.key(label)?.sign(data).to_bytes().to_vec();
        self.sign_count.fetch_add(1, Ordering::Relaxed);
        Ok(signature)
    }

    fn verify(
        &self,
        label: &str,
        data: &[u8],
        signature: &[u8],
    ) -> std::result::Result<(), KeyStoreError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| KeyStoreError::backend_with_source("malformed signature", e))?;
        self.key(label)?
            .verifying_key()
            .verify(data, &signature)
            .map_err(|e| KeyStoreError::backend_with_source("CKR_SIGNATURE_INVALID", e))
    }

    fn generate_key(&self, label: &str) -> std::result::Result<Vec<u8>, KeyStoreError> {
        self.reachable()?;
        let key = SigningKey::generate(&mut OsRng);
        let public_key = key.verifying_key().to_bytes().to_vec();
        self.state.lock().keys.insert(label.to_owned(), key);
        Ok(public_key)
    }

    fn destroy_key(&self, label: &str) -> std::result::Result<(), KeyStoreError> {
        self.reachable()?;
        self.state.lock().keys.remove(label);
        Ok(())
    }

    fn has_key(&self, label: &str) -> std::result::Result<bool, KeyStoreError> {
        self.reachable()?;
        Ok(self.state.lock().keys.contains_key(label))
    }
}

/// [`ModuleLoader`] that hands out one shared [`MockModule`].
#[derive(Debug)]
pub struct MockModuleLoader {
    module: Arc<MockModule>,
    loads: AtomicUsize,
}

impl MockModuleLoader {
    /// Creates a loader for `module`.
    #[must_use]
    pub fn new(module: Arc<MockModule>) -> Self {
        Self { module, loads: AtomicUsize::new(0) }
    }

    /// Returns how often the module was loaded.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl ModuleLoader for MockModuleLoader {
    fn load(
        &self,
        _module_path: &Path,
        _slot_index: usize,
    ) -> std::result::Result<Arc<dyn HardwareModule>, KeyStoreError> {
        self.module.reachable()?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.module) as Arc<dyn HardwareModule>)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Validator answering a fixed result for one issuer.
#[derive(Debug)]
pub struct FixedValidator {
    issuer_dn: String,
    result: ValidationResult,
    calls: AtomicUsize,
}

impl FixedValidator {
    /// Creates a validator for certificates issued by `issuer_dn`.
    #[must_use]
    pub fn new(issuer_dn: &str, result: ValidationResult) -> Self {
        Self { issuer_dn: normalize_dn(issuer_dn), result, calls: AtomicUsize::new(0) }
    }

    /// Returns how many certificates were validated.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CertificateValidator for FixedValidator {
    fn name(&self) -> &str {
        "fixed"
    }

    fn supports(&self, issuer_dn: &str) -> bool {
        normalize_dn(issuer_dn) == self.issuer_dn
    }

    async fn validate(&self, _certificate: &Certificate) -> Result<ValidationResult> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.result.clone())
    }
}

/// Worker logger that keeps every entry.
#[derive(Debug, Default)]
pub struct RecordingWorkerLogger {
    entries: Mutex<Vec<LogFields>>,
}

impl RecordingWorkerLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogFields> {
        self.entries.lock().clone()
    }

    /// Returns the most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<LogFields> {
        self.entries.lock().last().cloned()
    }
}

#[async_trait]
impl WorkerLogger for RecordingWorkerLogger {
    async fn log(&self, fields: &LogFields) -> Result<()> {
        self.entries.lock().push(fields.clone());
        Ok(())
    }
}

/// Archiver that always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingArchiver;

#[async_trait]
impl Archiver for FailingArchiver {
    fn name(&self) -> &str {
        "failing"
    }

    async fn archive(&self, _item: &Archivable, _ctx: &RequestContext) -> Result<bool> {
        Err(WorkerError::archive_failure("archive store unreachable"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assertions
// ─────────────────────────────────────────────────────────────────────────────

/// Assert that a worker result is a `CryptoTokenOffline` error.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use signet_worker::{assert_offline, error::WorkerError};
///
/// let result: Result<(), WorkerError> = Err(WorkerError::offline("Crypto token is offline"));
/// assert_offline!(result);
/// ```
#[macro_export]
macro_rules! assert_offline {
    ($result:expr) => {
        match $result {
            Err(ref e) if e.kind() == $crate::error::ErrorKind::CryptoTokenOffline => {},
            other => panic!("expected CryptoTokenOffline, got: {other:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Err(ref e) if e.kind() == $crate::error::ErrorKind::CryptoTokenOffline => {},
            other => panic!("{}: expected CryptoTokenOffline, got: {other:?}", $msg),
        }
    };
}

/// Assert that a worker result is an `IllegalRequest` error.
#[macro_export]
macro_rules! assert_illegal_request {
    ($result:expr) => {
        match $result {
            Err(ref e) if e.kind() == $crate::error::ErrorKind::IllegalRequest => {},
            other => panic!("expected IllegalRequest, got: {other:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Err(ref e) if e.kind() == $crate::error::ErrorKind::IllegalRequest => {},
            other => panic!("{}: expected IllegalRequest, got: {other:?}", $msg),
        }
    };
}
