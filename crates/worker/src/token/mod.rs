//! Crypto token state machine.
//!
//! A crypto token owns a worker's private key material and its activation
//! state. The state machine is shared by every backend; only the native
//! calls behind [`KeyStore`] differ between software and hardware tokens.
//!
//! ```text
//!                 activate ok
//!   ┌─────────┐ ─────────────▶ ┌────────┐
//!   │ Offline │                │ Active │
//!   └─────────┘ ◀───────────── └────────┘
//!      │    ▲     deactivate       │
//!      │    │                      │ activate with wrong secret
//!      │    │ deactivate /         ▼
//!      │    │ generate_key  ┌──────────────────────┐
//!      └────┼─────────────▶ │ AuthenticationFailed │
//!  wrong    └────────────── └──────────────────────┘
//!  secret
//! ```
//!
//! `AuthenticationFailed` refuses to sign exactly like `Offline`; it exists
//! so operators can tell a rejected PIN apart from an unreachable device.
//!
//! # Native Boundary
//!
//! Key store calls block, so they run on the blocking pool and are bounded
//! by the worker's activation and sign timeouts. A timed-out call fails only
//! the request that made it and leaves the token state untouched.

pub mod hardware;
#[cfg(feature = "pkcs11")]
pub mod pkcs11;
pub mod software;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signet_storage::{ConfigError, WorkerId};
use zeroize::Zeroizing;

pub use self::{
    hardware::{HardwareKeyStore, HardwareModule, ModuleLoader, UnsupportedModuleLoader},
    software::SoftwareKeyStore,
};
use crate::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditResult, SYSTEM_ACTOR, worker_resource},
    config::{DEFAULT_ACTIVATION_TIMEOUT, DEFAULT_SIGN_TIMEOUT, TokenConfig, WorkerConfig},
    error::{KeyStoreError, Result, WorkerError},
    secret_cache::SecretCache,
    usage_limiter::{UsageDecision, UsageLimiter},
};

/// Data signed by [`CryptoToken::test_key`].
const KEY_TEST_PROBE: &[u8] = b"signet key test";

/// Activation state of a crypto token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoTokenState {
    /// Not activated; cannot sign.
    Offline,
    /// Activated; signing is possible.
    Active,
    /// The last activation was rejected; cannot sign.
    AuthenticationFailed,
}

impl fmt::Display for CryptoTokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Active => write!(f, "active"),
            Self::AuthenticationFailed => write!(f, "authentication_failed"),
        }
    }
}

/// Point-in-time view of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    /// Current activation state.
    pub state: CryptoTokenState,
    /// Whether key material is provisioned.
    pub key_present: bool,
    /// SHA-256 fingerprint of the active public key.
    pub key_fingerprint: Option<String>,
}

/// An unlocked key, usable until the token is deactivated.
pub trait KeyHandle: Send + Sync {
    /// Signs `data`.
    fn sign(&self, data: &[u8]) -> std::result::Result<Vec<u8>, KeyStoreError>;

    /// Verifies `signature` over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> std::result::Result<(), KeyStoreError>;

    /// Returns the encoded public key.
    fn public_key(&self) -> &[u8];
}

/// Native key storage behind a crypto token.
///
/// Every method may block and is called from the blocking pool.
pub trait KeyStore: Send + Sync + 'static {
    /// Short backend name for logs and audit metadata.
    fn kind(&self) -> &'static str;

    /// Unlocks the key with `secret`.
    fn open(&self, secret: &[u8]) -> std::result::Result<Arc<dyn KeyHandle>, KeyStoreError>;

    /// Provisions a fresh key protected by `secret`, returning its public key.
    fn generate_key(&self, secret: &[u8]) -> std::result::Result<Vec<u8>, KeyStoreError>;

    /// Removes the key material. Removing an absent key is not an error.
    fn destroy_key(&self) -> std::result::Result<(), KeyStoreError>;

    /// Returns `true` if key material is provisioned.
    fn has_key(&self) -> std::result::Result<bool, KeyStoreError>;

    /// Releases sessions held after a successful [`open`](Self::open).
    fn release(&self) {}

    /// Whether the activation secret should be kept in the secret cache for
    /// automatic re-activation.
    fn caches_secret(&self) -> bool;
}

/// Activation, signing, and key lifecycle for one worker.
#[async_trait]
pub trait CryptoToken: fmt::Debug + Send + Sync {
    /// The worker this token belongs to.
    fn worker_id(&self) -> WorkerId;

    /// Current activation state.
    fn state(&self) -> CryptoTokenState;

    /// Public key of the active key, if the token is active.
    fn public_key(&self) -> Option<Vec<u8>>;

    /// Unlocks the key material with `secret`.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::CryptoTokenAuthenticationFailure`] for a wrong secret; the token moves to
    ///   `AuthenticationFailed`.
    /// - [`WorkerError::CryptoTokenOffline`] if the key store is unreachable, holds no key, or the
    ///   call times out; the state is unchanged.
    async fn activate(&self, secret: &[u8]) -> Result<()>;

    /// Releases the key and discards any cached secret. Idempotent.
    async fn deactivate(&self) -> Result<()>;

    /// Signs `data` and records one use against the usage limit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::CryptoTokenOffline`] if the token is not active,
    /// the call times out, or the usage limit is exhausted. In the last case
    /// the produced signature is discarded.
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Provisions new key material. Not allowed while active.
    async fn generate_key(&self, secret: &[u8]) -> Result<()>;

    /// Destroys the key material. Allowed from `Active` or `Offline`.
    async fn destroy_key(&self) -> Result<()>;

    /// Signs and verifies a probe without counting against the usage limit.
    async fn test_key(&self) -> Result<()>;

    /// Returns the token status.
    async fn status(&self) -> TokenStatus;
}

#[async_trait]
impl<T: CryptoToken + ?Sized> CryptoToken for Arc<T> {
    fn worker_id(&self) -> WorkerId {
        (**self).worker_id()
    }

    fn state(&self) -> CryptoTokenState {
        (**self).state()
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        (**self).public_key()
    }

    async fn activate(&self, secret: &[u8]) -> Result<()> {
        (**self).activate(secret).await
    }

    async fn deactivate(&self) -> Result<()> {
        (**self).deactivate().await
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).sign(data).await
    }

    async fn generate_key(&self, secret: &[u8]) -> Result<()> {
        (**self).generate_key(secret).await
    }

    async fn destroy_key(&self) -> Result<()> {
        (**self).destroy_key().await
    }

    async fn test_key(&self) -> Result<()> {
        (**self).test_key().await
    }

    async fn status(&self) -> TokenStatus {
        (**self).status().await
    }
}

/// Shared services every token needs.
#[derive(Clone, bon::Builder)]
pub struct TokenServices {
    /// Cache for software activation secrets.
    pub secret_cache: Arc<SecretCache>,
    /// Durable usage counters.
    pub limiter: Arc<UsageLimiter>,
    /// Lifecycle audit sink.
    pub audit: Arc<dyn AuditLogger>,
    /// Loader for hardware modules.
    #[builder(default = hardware::default_loader())]
    pub module_loader: Arc<dyn ModuleLoader>,
}

impl fmt::Debug for TokenServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenServices")
            .field("secret_cache", &self.secret_cache)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

/// Software-backed token.
pub type SoftwareToken = ManagedToken<SoftwareKeyStore>;

/// Hardware-backed token.
pub type HardwareToken = ManagedToken<HardwareKeyStore>;

/// Builds the token for a signer worker.
///
/// Nothing is opened or loaded here.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a mandatory token property is missing.
pub fn init_token(
    worker: &WorkerConfig,
    token: &TokenConfig,
    services: &TokenServices,
) -> std::result::Result<Arc<dyn CryptoToken>, ConfigError> {
    token.validate()?;
    let token: Arc<dyn CryptoToken> = match token {
        TokenConfig::Software { keystore_path, kdf, .. } => Arc::new(
            SoftwareToken::builder()
                .worker_id(worker.id())
                .store(SoftwareKeyStore::new(keystore_path.clone(), *kdf))
                .services(services.clone())
                .maybe_key_usage_limit(worker.key_usage_limit())
                .activation_timeout(worker.activation_timeout())
                .sign_timeout(worker.sign_timeout())
                .build(),
        ),
        TokenConfig::Hardware { module_path, slot_index, key_label, .. } => Arc::new(
            HardwareToken::builder()
                .worker_id(worker.id())
                .store(HardwareKeyStore::new(
                    module_path.clone(),
                    *slot_index,
                    key_label.clone(),
                    Arc::clone(&services.module_loader),
                ))
                .services(services.clone())
                .maybe_key_usage_limit(worker.key_usage_limit())
                .activation_timeout(worker.activation_timeout())
                .sign_timeout(worker.sign_timeout())
                .build(),
        ),
    };
    Ok(token)
}

struct TokenInner {
    state: CryptoTokenState,
    handle: Option<Arc<dyn KeyHandle>>,
}

/// The shared state machine over a [`KeyStore`].
pub struct ManagedToken<K: KeyStore> {
    worker_id: WorkerId,
    store: Arc<K>,
    inner: Mutex<TokenInner>,
    // Serializes activate, deactivate and key lifecycle transitions.
    transition: tokio::sync::Mutex<()>,
    services: TokenServices,
    key_usage_limit: Option<u64>,
    activation_timeout: Duration,
    sign_timeout: Duration,
}

impl<K: KeyStore> fmt::Debug for ManagedToken<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedToken")
            .field("worker_id", &self.worker_id)
            .field("kind", &self.store.kind())
            .field("state", &self.inner.lock().state)
            .field("key_usage_limit", &self.key_usage_limit)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl<K: KeyStore> ManagedToken<K> {
    /// Creates an `Offline` token over `store`.
    #[builder]
    pub fn new(
        worker_id: WorkerId,
        store: K,
        services: TokenServices,
        key_usage_limit: Option<u64>,
        #[builder(default = DEFAULT_ACTIVATION_TIMEOUT)] activation_timeout: Duration,
        #[builder(default = DEFAULT_SIGN_TIMEOUT)] sign_timeout: Duration,
    ) -> Self {
        Self {
            worker_id,
            store: Arc::new(store),
            inner: Mutex::new(TokenInner { state: CryptoTokenState::Offline, handle: None }),
            transition: tokio::sync::Mutex::new(()),
            services,
            key_usage_limit,
            activation_timeout,
            sign_timeout,
        }
    }
}

impl<K: KeyStore> ManagedToken<K> {
    fn active_handle(&self) -> Result<Arc<dyn KeyHandle>> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.handle) {
            (CryptoTokenState::Active, Some(handle)) => Ok(Arc::clone(handle)),
            _ => Err(WorkerError::offline("Crypto token is offline")),
        }
    }

    /// Replaces state and key handle, returning the previous handle.
    fn set_state(
        &self,
        state: CryptoTokenState,
        handle: Option<Arc<dyn KeyHandle>>,
    ) -> Option<Arc<dyn KeyHandle>> {
        let mut inner = self.inner.lock();
        inner.state = state;
        std::mem::replace(&mut inner.handle, handle)
    }

    /// Runs a blocking key store call bounded by `limit`.
    async fn run_blocking<T, F>(&self, limit: Duration, operation: &str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, KeyStoreError> + Send + 'static,
    {
        match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
            Err(_elapsed) => Err(WorkerError::offline(format!(
                "Crypto token of worker {} did not complete {operation} within {limit:?}",
                self.worker_id
            ))),
            Ok(Err(join)) => Err(WorkerError::internal_with_source(
                format!("{operation} task failed for worker {}", self.worker_id),
                join,
            )),
            Ok(Ok(result)) => result.map_err(|e| self.map_store_error(operation, e)),
        }
    }

    fn map_store_error(&self, operation: &str, err: KeyStoreError) -> WorkerError {
        match err {
            KeyStoreError::WrongSecret => WorkerError::authentication_failure(format!(
                "Authentication code incorrect for crypto token of worker {}",
                self.worker_id
            )),
            KeyStoreError::Unavailable { message } => WorkerError::offline(format!(
                "Crypto token of worker {} is unavailable: {message}",
                self.worker_id
            )),
            KeyStoreError::NoKey => WorkerError::offline(format!(
                "Crypto token of worker {} has no key material",
                self.worker_id
            )),
            other => WorkerError::internal_with_source(
                format!("{operation} failed for worker {}", self.worker_id),
                other,
            ),
        }
    }

    async fn audit(&self, action: AuditAction, result: AuditResult, fingerprint: Option<String>) {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("token".to_owned(), self.store.kind().to_owned());
        if let Some(fingerprint) = fingerprint {
            metadata.insert("key_fingerprint".to_owned(), fingerprint);
        }
        let event = AuditEvent::builder()
            .actor(SYSTEM_ACTOR)
            .action(action)
            .resource(worker_resource(self.worker_id))
            .result(result)
            .metadata(metadata)
            .build();
        self.services.audit.log(&event).await;
    }

    async fn release_store(&self) {
        let store = Arc::clone(&self.store);
        match tokio::time::timeout(
            self.activation_timeout,
            tokio::task::spawn_blocking(move || store.release()),
        )
        .await
        {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "release task failed");
            },
            Err(_) => tracing::warn!(worker_id = %self.worker_id, "release timed out"),
        }
    }
}

fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

#[async_trait]
impl<K: KeyStore> CryptoToken for ManagedToken<K> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn state(&self) -> CryptoTokenState {
        self.inner.lock().state
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        match inner.state {
            CryptoTokenState::Active => inner.handle.as_ref().map(|h| h.public_key().to_vec()),
            _ => None,
        }
    }

    #[tracing::instrument(skip(self, secret), fields(worker_id = %self.worker_id))]
    async fn activate(&self, secret: &[u8]) -> Result<()> {
        let _transition = self.transition.lock().await;

        let store = Arc::clone(&self.store);
        let owned = Zeroizing::new(secret.to_vec());
        let outcome =
            self.run_blocking(self.activation_timeout, "activation", move || store.open(&owned))
                .await;

        match outcome {
            Ok(handle) => {
                let key_fingerprint = fingerprint(handle.public_key());
                self.set_state(CryptoTokenState::Active, Some(handle));
                if self.store.caches_secret() {
                    self.services.secret_cache.put(self.worker_id, secret);
                }
                tracing::info!(state = %CryptoTokenState::Active, "crypto token activated");
                self.audit(AuditAction::ActivateToken, AuditResult::Success, Some(key_fingerprint))
                    .await;
                Ok(())
            },
            Err(err) => {
                if matches!(err, WorkerError::CryptoTokenAuthenticationFailure { .. }) {
                    let previous = self.set_state(CryptoTokenState::AuthenticationFailed, None);
                    if previous.is_some() {
                        drop(previous);
                        self.release_store().await;
                    }
                }
                tracing::warn!(state = %self.state(), error = %err.detail(), "activation failed");
                self.audit(AuditAction::ActivateToken, AuditResult::Failure(err.detail()), None)
                    .await;
                Err(err)
            },
        }
    }

    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    async fn deactivate(&self) -> Result<()> {
        let _transition = self.transition.lock().await;

        let (previous, handle) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = CryptoTokenState::Offline;
            (previous, inner.handle.take())
        };
        self.services.secret_cache.remove(self.worker_id);

        if handle.is_some() {
            drop(handle);
            self.release_store().await;
        }
        if previous != CryptoTokenState::Offline {
            tracing::info!(%previous, "crypto token deactivated");
            self.audit(AuditAction::DeactivateToken, AuditResult::Success, None).await;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, data), fields(worker_id = %self.worker_id, len = data.len()))]
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let handle = self.active_handle()?;

        let signer = Arc::clone(&handle);
        let payload = data.to_vec();
        let signature =
            self.run_blocking(self.sign_timeout, "signing", move || signer.sign(&payload)).await?;

        let decision = self
            .services
            .limiter
            .check_and_increment(self.worker_id, handle.public_key(), self.key_usage_limit)
            .await?;
        match decision {
            UsageDecision::Allowed => Ok(signature),
            UsageDecision::LimitExceeded => {
                drop(signature);
                tracing::warn!("key usage limit exceeded");
                Err(WorkerError::offline(format!(
                    "Key usage limit exceeded or not initialized for worker {}",
                    self.worker_id
                )))
            },
        }
    }

    #[tracing::instrument(skip(self, secret), fields(worker_id = %self.worker_id))]
    async fn generate_key(&self, secret: &[u8]) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.state() == CryptoTokenState::Active {
            return Err(WorkerError::illegal_request(
                "Cannot generate a key while the crypto token is active",
            ));
        }

        let store = Arc::clone(&self.store);
        let owned = Zeroizing::new(secret.to_vec());
        let result = self
            .run_blocking(self.activation_timeout, "key generation", move || {
                store.generate_key(&owned)
            })
            .await;

        match result {
            Ok(public_key) => {
                self.set_state(CryptoTokenState::Offline, None);
                let key_fingerprint = fingerprint(&public_key);
                tracing::info!(key_fingerprint = %key_fingerprint, "generated key");
                self.audit(AuditAction::GenerateKey, AuditResult::Success, Some(key_fingerprint))
                    .await;
                Ok(())
            },
            Err(err) => {
                self.audit(AuditAction::GenerateKey, AuditResult::Failure(err.detail()), None)
                    .await;
                Err(err)
            },
        }
    }

    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    async fn destroy_key(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let state = self.state();
        if state == CryptoTokenState::AuthenticationFailed {
            return Err(WorkerError::illegal_request(format!(
                "Cannot destroy key of crypto token in state {state}"
            )));
        }

        let handle = self.inner.lock().handle.take();
        if handle.is_some() {
            drop(handle);
            self.release_store().await;
        }
        self.set_state(CryptoTokenState::Offline, None);
        self.services.secret_cache.remove(self.worker_id);

        let store = Arc::clone(&self.store);
        let result =
            self.run_blocking(self.activation_timeout, "key destruction", move || {
                store.destroy_key()
            })
            .await;
        let audit_result = match &result {
            Ok(()) => AuditResult::Success,
            Err(err) => AuditResult::Failure(err.detail()),
        };
        self.audit(AuditAction::DestroyKey, audit_result, None).await;
        result
    }

    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    async fn test_key(&self) -> Result<()> {
        let handle = self.active_handle()?;
        self.run_blocking(self.sign_timeout, "key test", move || {
            let signature = handle.sign(KEY_TEST_PROBE)?;
            handle.verify(KEY_TEST_PROBE, &signature)
        })
        .await
    }

    async fn status(&self) -> TokenStatus {
        let (state, public_key) = {
            let inner = self.inner.lock();
            (inner.state, inner.handle.as_ref().map(|h| h.public_key().to_vec()))
        };
        let key_present = match public_key {
            Some(_) => true,
            None => {
                let store = Arc::clone(&self.store);
                self.run_blocking(self.activation_timeout, "key lookup", move || store.has_key())
                    .await
                    .unwrap_or(false)
            },
        };
        TokenStatus { state, key_present, key_fingerprint: public_key.as_deref().map(fingerprint) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use signet_storage::MemoryBackend;

    use super::*;
    use crate::{
        assert_offline,
        audit::NoopAuditLogger,
        error::ErrorKind,
        testutil::{MockModule, MockModuleLoader, fast_kdf},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        services: TokenServices,
        token: SoftwareToken,
    }

    fn services(module_loader: Arc<dyn ModuleLoader>) -> TokenServices {
        TokenServices::builder()
            .secret_cache(Arc::new(SecretCache::new()))
            .limiter(Arc::new(UsageLimiter::new(Arc::new(MemoryBackend::new()))))
            .audit(Arc::new(NoopAuditLogger))
            .module_loader(module_loader)
            .build()
    }

    fn software(limit: Option<u64>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let services = services(Arc::new(UnsupportedModuleLoader));
        let token = SoftwareToken::builder()
            .worker_id(WorkerId(1))
            .store(SoftwareKeyStore::new(dir.path().join("signer.json"), fast_kdf()))
            .services(services.clone())
            .maybe_key_usage_limit(limit)
            .build();
        Fixture { _dir: dir, services, token }
    }

    fn hardware(module: &Arc<MockModule>) -> (TokenServices, HardwareToken) {
        let loader: Arc<dyn ModuleLoader> = Arc::new(MockModuleLoader::new(Arc::clone(module)));
        let services = services(Arc::clone(&loader));
        let token = HardwareToken::builder()
            .worker_id(WorkerId(2))
            .store(HardwareKeyStore::new("/usr/lib/mock.so", 0, "key", loader))
            .services(services.clone())
            .activation_timeout(Duration::from_millis(200))
            .sign_timeout(Duration::from_millis(200))
            .build();
        (services, token)
    }

    #[tokio::test]
    async fn test_initial_state_is_offline() {
        let fx = software(None);
        assert_eq!(fx.token.state(), CryptoTokenState::Offline);
        assert!(fx.token.public_key().is_none());
        assert_offline!(fx.token.sign(b"data").await);
    }

    #[tokio::test]
    async fn test_activate_sign_deactivate() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();
        assert_eq!(fx.token.state(), CryptoTokenState::Active);

        let signature = fx.token.sign(b"data").await.unwrap();
        assert_eq!(signature.len(), 64);

        fx.token.deactivate().await.unwrap();
        assert_eq!(fx.token.state(), CryptoTokenState::Offline);
        assert_offline!(fx.token.sign(b"data").await);
    }

    #[tokio::test]
    async fn test_software_activation_caches_secret_and_deactivate_discards_it() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();
        assert_eq!(
            fx.services.secret_cache.get(WorkerId(1)).unwrap().as_slice(),
            b"foo123"
        );

        fx.token.deactivate().await.unwrap();
        assert!(fx.services.secret_cache.get(WorkerId(1)).is_none());
    }

    #[tokio::test]
    async fn test_wrong_secret_moves_to_authentication_failed() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        let err = fx.token.activate(b"wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoTokenAuthenticationFailure);
        assert_eq!(fx.token.state(), CryptoTokenState::AuthenticationFailed);
        assert!(fx.services.secret_cache.get(WorkerId(1)).is_none());
        assert_offline!(fx.token.sign(b"data").await);

        // A correct secret recovers the token.
        fx.token.activate(b"foo123").await.unwrap();
        assert_eq!(fx.token.state(), CryptoTokenState::Active);
    }

    #[tokio::test]
    async fn test_wrong_secret_from_active_drops_key() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();
        assert!(fx.token.activate(b"wrong").await.is_err());
        assert_eq!(fx.token.state(), CryptoTokenState::AuthenticationFailed);
        assert!(fx.token.public_key().is_none());
    }

    #[tokio::test]
    async fn test_activate_without_key_stays_offline() {
        let fx = software(None);
        assert_offline!(fx.token.activate(b"foo123").await);
        assert_eq!(fx.token.state(), CryptoTokenState::Offline);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let fx = software(None);
        fx.token.deactivate().await.unwrap();
        fx.token.deactivate().await.unwrap();
        assert_eq!(fx.token.state(), CryptoTokenState::Offline);
    }

    #[tokio::test]
    async fn test_limit_exceeded_is_offline_and_discards_signature() {
        let fx = software(Some(2));
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();

        fx.token.sign(b"1").await.unwrap();
        fx.token.sign(b"2").await.unwrap();
        let err = fx.token.sign(b"3").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoTokenOffline);
        assert!(err.to_string().contains("Key usage limit exceeded"));

        // The token itself stays active; only the key is exhausted.
        assert_eq!(fx.token.state(), CryptoTokenState::Active);
        let public_key = fx.token.public_key().unwrap();
        assert_eq!(
            fx.services.limiter.counter_value(WorkerId(1), &public_key).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_generate_key_rejected_while_active() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();
        let err = fx.token.generate_key(b"foo123").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalRequest);
    }

    #[tokio::test]
    async fn test_destroy_key_requires_new_key() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();

        fx.token.destroy_key().await.unwrap();
        assert_eq!(fx.token.state(), CryptoTokenState::Offline);
        assert!(fx.services.secret_cache.get(WorkerId(1)).is_none());
        assert_offline!(fx.token.activate(b"foo123").await);

        fx.token.generate_key(b"bar456").await.unwrap();
        fx.token.activate(b"bar456").await.unwrap();
        fx.token.sign(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_key_rejected_after_authentication_failure() {
        let fx = software(None);
        fx.token.generate_key(b"foo123").await.unwrap();
        let _ = fx.token.activate(b"wrong").await;
        let err = fx.token.destroy_key().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalRequest);
    }

    #[tokio::test]
    async fn test_test_key_does_not_count_usage() {
        let fx = software(Some(1));
        fx.token.generate_key(b"foo123").await.unwrap();
        fx.token.activate(b"foo123").await.unwrap();

        for _ in 0..3 {
            fx.token.test_key().await.unwrap();
        }
        fx.token.sign(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_key_and_fingerprint() {
        let fx = software(None);
        let status = fx.token.status().await;
        assert_eq!(status.state, CryptoTokenState::Offline);
        assert!(!status.key_present);
        assert!(status.key_fingerprint.is_none());

        fx.token.generate_key(b"foo123").await.unwrap();
        assert!(fx.token.status().await.key_present);

        fx.token.activate(b"foo123").await.unwrap();
        let status = fx.token.status().await;
        assert_eq!(status.state, CryptoTokenState::Active);
        assert_eq!(status.key_fingerprint.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_hardware_token_does_not_cache_secret() {
        let module = Arc::new(MockModule::new("1234"));
        let (services, token) = hardware(&module);
        token.generate_key(b"1234").await.unwrap();
        token.activate(b"1234").await.unwrap();
        assert!(services.secret_cache.get(WorkerId(2)).is_none());
        token.sign(b"data").await.unwrap();

        token.deactivate().await.unwrap();
        assert!(!module.is_logged_in());
    }

    #[tokio::test]
    async fn test_wrong_pin_from_active_logs_out_module() {
        let module = Arc::new(MockModule::new("1234"));
        let (_services, token) = hardware(&module);
        token.generate_key(b"1234").await.unwrap();
        token.activate(b"1234").await.unwrap();
        assert!(module.is_logged_in());

        let err = token.activate(b"9999").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoTokenAuthenticationFailure);
        assert_eq!(token.state(), CryptoTokenState::AuthenticationFailed);
        assert!(token.public_key().is_none());
        assert!(!module.is_logged_in(), "the old session must not outlive its key handle");

        token.activate(b"1234").await.unwrap();
        token.sign(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn test_hardware_unreachable_stays_offline() {
        let module = Arc::new(MockModule::new("1234"));
        let (_services, token) = hardware(&module);
        token.generate_key(b"1234").await.unwrap();
        module.set_unreachable(true);

        assert_offline!(token.activate(b"1234").await);
        assert_eq!(token.state(), CryptoTokenState::Offline);
    }

    #[tokio::test]
    async fn test_slow_sign_times_out_and_token_stays_active() {
        let module = Arc::new(MockModule::new("1234"));
        let (_services, token) = hardware(&module);
        token.generate_key(b"1234").await.unwrap();
        token.activate(b"1234").await.unwrap();

        module.set_sign_delay(Duration::from_secs(2));
        assert_offline!(token.sign(b"data").await);
        assert_eq!(token.state(), CryptoTokenState::Active);
    }

    #[tokio::test]
    async fn test_init_token_rejects_missing_property() {
        let worker =
            crate::testutil::signer_config(WorkerId(9), TokenConfig::software("/tmp/signer.json"));
        let services = services(Arc::new(UnsupportedModuleLoader));
        let err = init_token(&worker, &TokenConfig::software(""), &services).unwrap_err();
        assert_eq!(err, ConfigError::MissingProperty { field: "keystore_path" });
    }
}
