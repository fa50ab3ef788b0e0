//! Registry of configured workers.
//!
//! The registry owns every worker's runtime: the crypto token of a signer,
//! the candidate list of a dispatcher, or the validation service of a
//! validator. Registering or reloading a worker builds that runtime from
//! scratch and then tries to activate a signer's token automatically, first
//! with a secret remembered in the [`SecretCache`](crate::secret_cache::SecretCache)
//! and then with the configured [`SecretSource`](crate::config::SecretSource).

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use signet_storage::{ConfigError, WorkerId};

use crate::{
    certificate::Certificate,
    config::{TokenConfig, WorkerConfig, WorkerKindConfig},
    dispatcher::{Dispatcher, WorkerDirectory},
    error::{Result, WorkerError},
    secret_cache::ActivationSecret,
    token::{CryptoToken, CryptoTokenState, TokenServices, init_token},
    validation::{CertificateValidator, ValidationCache, ValidationService},
};

/// Reference to a worker by id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerRef {
    /// Numeric worker id.
    Id(WorkerId),
    /// Configured worker name.
    Name(String),
}

impl From<WorkerId> for WorkerRef {
    fn from(id: WorkerId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for WorkerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Kind-specific runtime of a worker.
pub enum WorkerRuntime {
    /// A signer and its token.
    Signer {
        /// The worker's crypto token.
        token: Arc<dyn CryptoToken>,
        /// Certificate of the signing key, if configured.
        signer_certificate: Option<Certificate>,
    },
    /// A failover dispatcher.
    Dispatcher(Dispatcher),
    /// A certificate validation service.
    Validator(Arc<ValidationService>),
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signer { token, signer_certificate } => f
                .debug_struct("Signer")
                .field("state", &token.state())
                .field("signer_certificate", signer_certificate)
                .finish(),
            Self::Dispatcher(dispatcher) => f.debug_tuple("Dispatcher").field(dispatcher).finish(),
            Self::Validator(service) => f.debug_tuple("Validator").field(service).finish(),
        }
    }
}

/// One registered worker.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    runtime: WorkerRuntime,
    disabled: AtomicBool,
}

impl Worker {
    /// Returns the worker id.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.config.id()
    }

    /// Returns the configuration the worker was built from.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the kind-specific runtime.
    #[must_use]
    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    /// Returns `true` if the worker is administratively disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Returns the signer's token, if this is a signer.
    #[must_use]
    pub fn token(&self) -> Option<&Arc<dyn CryptoToken>> {
        match &self.runtime {
            WorkerRuntime::Signer { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Returns the signer certificate, if configured.
    #[must_use]
    pub fn signer_certificate(&self) -> Option<&Certificate> {
        match &self.runtime {
            WorkerRuntime::Signer { signer_certificate, .. } => signer_certificate.as_ref(),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Workers {
    by_id: HashMap<WorkerId, Arc<Worker>>,
    by_name: HashMap<String, WorkerId>,
    /// Ids and names claimed by a registration still being built.
    pending: HashMap<WorkerId, String>,
}

impl Workers {
    fn check_free(
        &self,
        config: &WorkerConfig,
        replacing: Option<WorkerId>,
    ) -> std::result::Result<(), ConfigError> {
        let id = config.id();
        let taken = self.by_id.contains_key(&id) || self.pending.contains_key(&id);
        if replacing.is_none() && taken {
            return Err(ConfigError::InvalidValue {
                field: "id",
                value: id.to_string(),
                reason: "worker id is already registered".to_owned(),
            });
        }
        let pending_owner = self
            .pending
            .iter()
            .find_map(|(owner, name)| (name == config.name()).then_some(*owner));
        match self.by_name.get(config.name()).copied().or(pending_owner) {
            Some(owner) if Some(owner) != replacing => Err(ConfigError::InvalidValue {
                field: "name",
                value: config.name().to_owned(),
                reason: format!("name is already used by worker {owner}"),
            }),
            _ => Ok(()),
        }
    }
}

/// Claim on an id and name for the duration of one registration.
struct Reservation<'a> {
    workers: &'a RwLock<Workers>,
    id: WorkerId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.workers.write().pending.remove(&self.id);
    }
}

/// All workers of one process.
pub struct WorkerRegistry {
    services: TokenServices,
    validators: Vec<Arc<dyn CertificateValidator>>,
    workers: RwLock<Workers>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.read().by_id.len())
            .field("validators", &self.validators.len())
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl WorkerRegistry {
    /// Creates an empty registry.
    ///
    /// # Optional Fields
    ///
    /// * `validators` - Revocation checkers handed to validator workers (default: none).
    #[builder]
    pub fn new(
        services: TokenServices,
        #[builder(default)] validators: Vec<Arc<dyn CertificateValidator>>,
    ) -> Self {
        Self { services, validators, workers: RwLock::new(Workers::default()) }
    }
}

impl WorkerRegistry {
    /// Returns the shared token services.
    #[must_use]
    pub fn services(&self) -> &TokenServices {
        &self.services
    }

    /// Builds and registers a new worker.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid, the signer
    /// certificate cannot be loaded, or the id or name is already taken.
    #[tracing::instrument(skip(self, config), fields(worker_id = %config.id()))]
    pub async fn register(&self, config: WorkerConfig) -> std::result::Result<(), ConfigError> {
        let _reservation = self.reserve(&config)?;
        let worker = self.prepare(config).await?;
        let carried = self.services.secret_cache.get(worker.id());
        self.start(&worker, carried).await;
        self.insert(worker, None);
        Ok(())
    }

    /// Rebuilds a registered worker from a new configuration.
    ///
    /// The new worker is built before the old one is touched, so a rejected
    /// configuration leaves the running worker and its cached secret as they
    /// were. Once the new worker is built the old token is deactivated and a
    /// secret cached by it is used to re-activate the new one.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid, or if the
    /// worker is not registered.
    #[tracing::instrument(skip(self, config), fields(worker_id = %config.id()))]
    pub async fn reload(&self, config: WorkerConfig) -> std::result::Result<(), ConfigError> {
        let id = config.id();
        let Some(old) = self.get(id) else {
            return Err(ConfigError::InvalidValue {
                field: "id",
                value: id.to_string(),
                reason: "worker is not registered".to_owned(),
            });
        };
        self.workers.read().check_free(&config, Some(id))?;
        let worker = self.prepare(config).await?;

        // Deactivation drops the cache entry; the new token puts it back.
        let carried = self.services.secret_cache.get(id);
        if let Some(token) = old.token() {
            if let Err(e) = token.deactivate().await {
                tracing::warn!(error = %e, "deactivating replaced token failed");
            }
        }
        self.start(&worker, carried).await;
        self.insert(worker, Some(old.config.name()));
        tracing::info!("worker reloaded");
        Ok(())
    }

    /// Removes a worker, deactivating its token.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] if the worker is unknown.
    pub async fn remove(&self, id: WorkerId) -> Result<()> {
        let removed = {
            let mut workers = self.workers.write();
            let removed = workers.by_id.remove(&id);
            if let Some(worker) = &removed {
                workers.by_name.remove(worker.config.name());
            }
            removed
        };
        let worker = removed.ok_or_else(|| unknown_worker(&WorkerRef::Id(id)))?;
        if let Some(token) = worker.token() {
            token.deactivate().await?;
        }
        self.services.secret_cache.remove(id);
        tracing::info!(worker_id = %id, "worker removed");
        Ok(())
    }

    /// Returns the worker registered under `id`.
    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.read().by_id.get(&id).cloned()
    }

    /// Resolves a reference to a registered worker id.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] if no such worker exists.
    pub fn resolve(&self, worker: &WorkerRef) -> Result<WorkerId> {
        let workers = self.workers.read();
        let id = match worker {
            WorkerRef::Id(id) => workers.by_id.contains_key(id).then_some(*id),
            WorkerRef::Name(name) => workers.by_name.get(name).copied(),
        };
        id.ok_or_else(|| unknown_worker(worker))
    }

    /// Sets or clears the administrative disabled flag.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] if the worker is unknown.
    pub fn set_disabled(&self, id: WorkerId, disabled: bool) -> Result<()> {
        let worker = self.get(id).ok_or_else(|| unknown_worker(&WorkerRef::Id(id)))?;
        worker.disabled.store(disabled, Ordering::Release);
        tracing::info!(worker_id = %id, disabled, "worker disabled flag changed");
        Ok(())
    }

    /// Returns every registered id in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers.read().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Activates a worker with an operator-supplied secret.
    ///
    /// Dispatchers and validators hold no key material; activating them
    /// succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] for an unknown worker, or the
    /// token's activation error.
    pub async fn activate(&self, id: WorkerId, secret: &[u8]) -> Result<()> {
        let worker = self.get(id).ok_or_else(|| unknown_worker(&WorkerRef::Id(id)))?;
        match &worker.runtime {
            WorkerRuntime::Signer { token, .. } => token.activate(secret).await,
            WorkerRuntime::Dispatcher(dispatcher) => dispatcher.activate(secret),
            WorkerRuntime::Validator(_) => Ok(()),
        }
    }

    /// Deactivates a worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] for an unknown worker, or the
    /// token's deactivation error.
    pub async fn deactivate(&self, id: WorkerId) -> Result<()> {
        let worker = self.get(id).ok_or_else(|| unknown_worker(&WorkerRef::Id(id)))?;
        match &worker.runtime {
            WorkerRuntime::Signer { token, .. } => token.deactivate().await,
            WorkerRuntime::Dispatcher(dispatcher) => dispatcher.deactivate(),
            WorkerRuntime::Validator(_) => Ok(()),
        }
    }

    /// Claims the id and name of a new worker until the returned guard drops.
    fn reserve(&self, config: &WorkerConfig) -> std::result::Result<Reservation<'_>, ConfigError> {
        let mut workers = self.workers.write();
        workers.check_free(config, None)?;
        workers.pending.insert(config.id(), config.name().to_owned());
        Ok(Reservation { workers: &self.workers, id: config.id() })
    }

    fn insert(&self, worker: Worker, old_name: Option<&str>) {
        let id = worker.id();
        let name = worker.config.name().to_owned();
        let mut workers = self.workers.write();
        if let Some(old_name) = old_name {
            workers.by_name.remove(old_name);
        }
        workers.by_name.insert(name, id);
        workers.by_id.insert(id, Arc::new(worker));
    }

    /// Builds a worker without side effects on running workers or the
    /// secret cache. Signer tokens come back offline.
    async fn prepare(&self, config: WorkerConfig) -> std::result::Result<Worker, ConfigError> {
        config.validate()?;
        let runtime = match config.kind() {
            WorkerKindConfig::Signer { token, signer_certificate } => {
                let certificate = match signer_certificate {
                    Some(path) => Some(load_certificate(path).await?),
                    None => None,
                };
                let crypto_token = init_token(&config, token, &self.services)?;
                WorkerRuntime::Signer { token: crypto_token, signer_certificate: certificate }
            },
            WorkerKindConfig::Dispatcher { candidates } => {
                WorkerRuntime::Dispatcher(Dispatcher::new(config.id(), candidates.iter().copied()))
            },
            WorkerKindConfig::Validator { validation_cache } => {
                WorkerRuntime::Validator(Arc::new(ValidationService::new(
                    config.id(),
                    ValidationCache::from_config(validation_cache),
                    self.validators.clone(),
                )))
            },
        };
        tracing::info!(kind = config.kind().name(), name = config.name(), "worker initialized");
        let disabled = AtomicBool::new(config.disabled());
        Ok(Worker { config, runtime, disabled })
    }

    /// Activates a prepared signer's token automatically, if it can.
    async fn start(&self, worker: &Worker, carried: Option<ActivationSecret>) {
        let WorkerRuntime::Signer { token, .. } = &worker.runtime else {
            return;
        };
        if let WorkerKindConfig::Signer { token: config, .. } = worker.config.kind() {
            self.auto_activate(token.as_ref(), config, carried).await;
        }
    }

    async fn auto_activate(
        &self,
        token: &dyn CryptoToken,
        config: &TokenConfig,
        carried: Option<ActivationSecret>,
    ) {
        if let Some(secret) = carried {
            match token.activate(&secret).await {
                Ok(()) => {
                    tracing::info!("token re-activated with cached secret");
                    return;
                },
                Err(e) => tracing::warn!(error = %e, "re-activation with cached secret failed"),
            }
        }

        let secret = match config.auto_activation().load().await {
            Ok(Some(secret)) => secret,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "loading automatic activation secret failed");
                return;
            },
        };
        match token.activate(&secret).await {
            Ok(()) => tracing::info!("token activated automatically"),
            Err(e) => tracing::warn!(
                error = %e,
                state = %token.state(),
                "automatic activation failed"
            ),
        }
    }
}

impl WorkerDirectory for WorkerRegistry {
    fn is_usable(&self, worker: WorkerId) -> bool {
        self.get(worker).is_some_and(|w| {
            !w.is_disabled() && w.token().is_some_and(|t| t.state() == CryptoTokenState::Active)
        })
    }
}

async fn load_certificate(path: &std::path::Path) -> std::result::Result<Certificate, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        field: "signer_certificate",
        value: path.display().to_string(),
        reason,
    };
    let der = tokio::fs::read(path).await.map_err(|e| invalid(e.to_string()))?;
    Certificate::from_der(&der).map_err(|e| invalid(e.to_string()))
}

fn unknown_worker(worker: &WorkerRef) -> WorkerError {
    WorkerError::illegal_request(format!("No such worker: {worker}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        config::{SecretSource, ValidationCacheConfig},
        error::ErrorKind,
        testutil::{provision_software_key, signer_config, software_token, token_services},
    };

    const SECRET: &[u8] = b"foo123";

    struct Fixture {
        dir: tempfile::TempDir,
        registry: WorkerRegistry,
    }

    fn fixture() -> Fixture {
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            registry: WorkerRegistry::builder().services(token_services()).build(),
        }
    }

    impl Fixture {
        fn signer(&self, id: i64, auto: SecretSource) -> WorkerConfig {
            let path = self.dir.path().join(format!("signer-{id}.json"));
            provision_software_key(&path, SECRET);
            signer_config(WorkerId(id), software_token(&path).with_auto_activation(auto))
        }

        fn secret_file(&self) -> SecretSource {
            let path = self.dir.path().join("pin.txt");
            std::fs::write(&path, b"foo123\n").unwrap();
            SecretSource::File { path }
        }

        fn state(&self, id: i64) -> CryptoTokenState {
            self.registry.get(WorkerId(id)).unwrap().token().unwrap().state()
        }
    }

    #[tokio::test]
    async fn test_register_without_secret_stays_offline() {
        let fx = fixture();
        fx.registry.register(fx.signer(1, SecretSource::None)).await.unwrap();
        assert_eq!(fx.state(1), CryptoTokenState::Offline);
        assert!(!fx.registry.is_usable(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_register_auto_activates_from_file() {
        let fx = fixture();
        fx.registry.register(fx.signer(1, fx.secret_file())).await.unwrap();
        assert_eq!(fx.state(1), CryptoTokenState::Active);
        assert!(fx.registry.is_usable(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_wrong_auto_activation_secret_is_logged_not_fatal() {
        let fx = fixture();
        let path = fx.dir.path().join("wrong.txt");
        std::fs::write(&path, b"nope").unwrap();
        fx.registry.register(fx.signer(1, SecretSource::File { path })).await.unwrap();
        assert_eq!(fx.state(1), CryptoTokenState::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_reload_reactivates_with_cached_secret() {
        let fx = fixture();
        let config = fx.signer(1, SecretSource::None);
        fx.registry.register(config.clone()).await.unwrap();
        fx.registry.activate(WorkerId(1), SECRET).await.unwrap();
        let old_token = Arc::clone(fx.registry.get(WorkerId(1)).unwrap().token().unwrap());

        fx.registry.reload(config).await.unwrap();

        assert_eq!(old_token.state(), CryptoTokenState::Offline);
        assert_eq!(fx.state(1), CryptoTokenState::Active);
        assert!(fx.registry.services().secret_cache.contains(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_rejected_reload_keeps_running_worker() {
        let fx = fixture();
        let config = fx.signer(1, SecretSource::None);
        fx.registry.register(config.clone()).await.unwrap();
        fx.registry.activate(WorkerId(1), SECRET).await.unwrap();
        let running = Arc::clone(fx.registry.get(WorkerId(1)).unwrap().token().unwrap());

        let WorkerKindConfig::Signer { token, .. } = config.kind().clone() else {
            panic!("expected a signer config");
        };
        let broken = WorkerConfig::builder()
            .id(WorkerId(1))
            .name("signer-1")
            .kind(WorkerKindConfig::Signer {
                token,
                signer_certificate: Some(fx.dir.path().join("missing.der")),
            })
            .build()
            .unwrap();
        let err = fx.registry.reload(broken).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "signer_certificate", .. }));

        let current = Arc::clone(fx.registry.get(WorkerId(1)).unwrap().token().unwrap());
        assert!(Arc::ptr_eq(&running, &current), "the old worker stays registered");
        assert_eq!(fx.state(1), CryptoTokenState::Active);
        assert!(fx.registry.services().secret_cache.contains(WorkerId(1)));
        running.sign(b"still signing").await.unwrap();

        // A later valid reload still finds the cached secret.
        fx.registry.reload(config).await.unwrap();
        assert_eq!(fx.state(1), CryptoTokenState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_register_of_one_id_activates_once() {
        let fx = fixture();
        let config = fx.signer(1, fx.secret_file());

        let (first, second) =
            tokio::join!(fx.registry.register(config.clone()), fx.registry.register(config));
        assert!(first.is_ok() ^ second.is_ok(), "exactly one registration wins");
        let err = first.err().or(second.err()).unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { field: "id", .. }));

        assert_eq!(fx.state(1), CryptoTokenState::Active);
        assert!(fx.registry.services().secret_cache.contains(WorkerId(1)));
        assert_eq!(fx.registry.ids(), vec![WorkerId(1)]);
    }

    #[tokio::test]
    async fn test_reload_unknown_worker_fails() {
        let fx = fixture();
        let err = fx.registry.reload(fx.signer(5, SecretSource::None)).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "id", .. }));
    }

    #[tokio::test]
    async fn test_duplicate_id_and_name_are_rejected() {
        let fx = fixture();
        fx.registry.register(fx.signer(1, SecretSource::None)).await.unwrap();

        let err = fx.registry.register(fx.signer(1, SecretSource::None)).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "id", .. }));

        let path = fx.dir.path().join("other.json");
        let same_name = WorkerConfig::builder()
            .id(WorkerId(2))
            .name("signer-1")
            .kind(WorkerKindConfig::signer(software_token(&path)))
            .build()
            .unwrap();
        let err = fx.registry.register(same_name).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "name", .. }));
    }

    #[tokio::test]
    async fn test_missing_signer_certificate_is_config_error() {
        let fx = fixture();
        let path = fx.dir.path().join("signer.json");
        let config = WorkerConfig::builder()
            .id(WorkerId(3))
            .name("with-cert")
            .kind(WorkerKindConfig::Signer {
                token: software_token(&path),
                signer_certificate: Some(fx.dir.path().join("missing.der")),
            })
            .build()
            .unwrap();

        let err = fx.registry.register(config).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "signer_certificate", .. }));
        assert!(fx.registry.get(WorkerId(3)).is_none());

        // The failed registration releases its claim on the id and name.
        let retry = WorkerConfig::builder()
            .id(WorkerId(3))
            .name("with-cert")
            .kind(WorkerKindConfig::signer(software_token(&path)))
            .build()
            .unwrap();
        fx.registry.register(retry).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_by_id_and_name() {
        let fx = fixture();
        fx.registry.register(fx.signer(4, SecretSource::None)).await.unwrap();

        assert_eq!(fx.registry.resolve(&WorkerRef::Id(WorkerId(4))).unwrap(), WorkerId(4));
        assert_eq!(fx.registry.resolve(&"signer-4".into()).unwrap(), WorkerId(4));

        let err = fx.registry.resolve(&"nobody".into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalRequest);
        let err = fx.registry.resolve(&WorkerRef::Id(WorkerId(99))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalRequest);
    }

    #[tokio::test]
    async fn test_disabled_worker_is_not_usable() {
        let fx = fixture();
        fx.registry.register(fx.signer(1, fx.secret_file())).await.unwrap();

        fx.registry.set_disabled(WorkerId(1), true).unwrap();
        assert!(!fx.registry.is_usable(WorkerId(1)));
        fx.registry.set_disabled(WorkerId(1), false).unwrap();
        assert!(fx.registry.is_usable(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_remove_deactivates_and_forgets_secret() {
        let fx = fixture();
        fx.registry.register(fx.signer(1, fx.secret_file())).await.unwrap();
        let token = Arc::clone(fx.registry.get(WorkerId(1)).unwrap().token().unwrap());

        fx.registry.remove(WorkerId(1)).await.unwrap();

        assert_eq!(token.state(), CryptoTokenState::Offline);
        assert!(fx.registry.get(WorkerId(1)).is_none());
        assert!(fx.registry.resolve(&"signer-1".into()).is_err());
        assert!(!fx.registry.services().secret_cache.contains(WorkerId(1)));
        assert!(fx.registry.remove(WorkerId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_and_validator_runtimes() {
        let fx = fixture();
        let dispatcher = WorkerConfig::builder()
            .id(WorkerId(10))
            .name("dispatcher")
            .kind(WorkerKindConfig::dispatcher([WorkerId(1), WorkerId(2)]))
            .build()
            .unwrap();
        let validator = WorkerConfig::builder()
            .id(WorkerId(20))
            .name("validator")
            .kind(WorkerKindConfig::validator(ValidationCacheConfig::default()))
            .build()
            .unwrap();
        fx.registry.register(dispatcher).await.unwrap();
        fx.registry.register(validator).await.unwrap();

        let worker = fx.registry.get(WorkerId(10)).unwrap();
        let WorkerRuntime::Dispatcher(d) = worker.runtime() else {
            panic!("expected a dispatcher runtime");
        };
        assert_eq!(d.candidates(), &[WorkerId(1), WorkerId(2)]);
        assert!(!fx.registry.is_usable(WorkerId(10)));
        fx.registry.activate(WorkerId(10), b"ignored").await.unwrap();
        fx.registry.deactivate(WorkerId(10)).await.unwrap();

        let worker = fx.registry.get(WorkerId(20)).unwrap();
        assert!(matches!(worker.runtime(), WorkerRuntime::Validator(_)));
        assert_eq!(fx.registry.ids(), vec![WorkerId(10), WorkerId(20)]);
    }
}
