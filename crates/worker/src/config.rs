//! Worker configuration.
//!
//! [`WorkerConfig`] is the per-worker property set consumed by the request
//! core: the `DISABLED` flag, `KEYUSAGELIMIT`, the authorized-client list,
//! signer validity checks, native-boundary timeouts, and the kind-specific
//! settings of signers, dispatchers and validators.
//!
//! Configurations deserialize with `serde` (unknown fields rejected,
//! durations in humantime notation) or are assembled with the validating
//! builder:
//!
//! ```no_run
//! use signet_storage::WorkerId;
//! use signet_worker::config::{TokenConfig, WorkerConfig, WorkerKindConfig};
//!
//! let config = WorkerConfig::builder()
//!     .id(WorkerId(5802))
//!     .name("PDFSigner")
//!     .key_usage_limit(10_000)
//!     .kind(WorkerKindConfig::signer(TokenConfig::software("/var/lib/signet/5802.json")))
//!     .build()?;
//! # Ok::<(), signet_storage::ConfigError>(())
//! ```
//!
//! Deserialized configurations are checked with [`WorkerConfig::validate`]
//! when they are registered.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use signet_storage::{ConfigError, WorkerId};
use zeroize::Zeroizing;

use crate::{certificate::SerialNumber, secret_cache::ActivationSecret};

/// Default bound on a single activation attempt (30 seconds).
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single signing call (10 seconds).
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest accepted native-boundary timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Default validation cache TTL (10 seconds).
pub const DEFAULT_VALIDATION_TTL: Duration = Duration::from_secs(10);

fn default_activation_timeout() -> Duration {
    DEFAULT_ACTIVATION_TIMEOUT
}

fn default_sign_timeout() -> Duration {
    DEFAULT_SIGN_TIMEOUT
}

fn default_validation_ttl() -> Duration {
    DEFAULT_VALIDATION_TTL
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Activation secrets
// ─────────────────────────────────────────────────────────────────────────────

/// Where a token finds its activation secret for automatic activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case", deny_unknown_fields)]
pub enum SecretSource {
    /// No automatic activation; an operator activates the token.
    #[default]
    None,
    /// Read the secret from an environment variable.
    Env {
        /// Variable name.
        var: String,
    },
    /// Read the secret from a file. One trailing newline is stripped.
    File {
        /// Path to the secret file.
        path: PathBuf,
    },
}

impl SecretSource {
    /// Loads the secret, returning `None` for [`SecretSource::None`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the variable is unset or the
    /// file cannot be read.
    pub async fn load(&self) -> Result<Option<ActivationSecret>, ConfigError> {
        match self {
            Self::None => Ok(None),
            Self::Env { var } => match std::env::var_os(var) {
                Some(value) => Ok(Some(Zeroizing::new(value.into_encoded_bytes()))),
                None => Err(ConfigError::InvalidValue {
                    field: "auto_activation",
                    value: var.clone(),
                    reason: "environment variable is not set".to_owned(),
                }),
            },
            Self::File { path } => {
                let mut bytes = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
                    ConfigError::InvalidValue {
                        field: "auto_activation",
                        value: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?);
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                    if bytes.last() == Some(&b'\r') {
                        bytes.pop();
                    }
                }
                Ok(Some(bytes))
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Crypto tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Argon2id parameters used to seal software keystores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iteration count.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { memory_kib: 65_536, iterations: 3, parallelism: 4 }
    }
}

impl KdfParams {
    /// Checks the Argon2 lower bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for a zero iteration count, zero
    /// parallelism, or less than 8 KiB of memory per lane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations < 1 {
            return Err(ConfigError::BelowMinimum {
                field: "kdf.iterations",
                value: self.iterations.to_string(),
                min: "1".to_owned(),
            });
        }
        if self.parallelism < 1 {
            return Err(ConfigError::BelowMinimum {
                field: "kdf.parallelism",
                value: self.parallelism.to_string(),
                min: "1".to_owned(),
            });
        }
        let min_memory = 8 * self.parallelism;
        if self.memory_kib < min_memory {
            return Err(ConfigError::BelowMinimum {
                field: "kdf.memory_kib",
                value: self.memory_kib.to_string(),
                min: min_memory.to_string(),
            });
        }
        Ok(())
    }
}

/// Backend of a signer's crypto token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TokenConfig {
    /// Ed25519 key sealed in a keystore file.
    Software {
        /// Keystore file path.
        keystore_path: PathBuf,
        /// Sealing parameters for newly generated keys.
        #[serde(default)]
        kdf: KdfParams,
        /// Automatic activation secret source.
        #[serde(default)]
        auto_activation: SecretSource,
    },
    /// Key held by a hardware module.
    Hardware {
        /// Path of the native module library.
        module_path: PathBuf,
        /// Index into the slots that hold a token.
        #[serde(default)]
        slot_index: usize,
        /// Label of the signing key object.
        key_label: String,
        /// Automatic activation secret source.
        #[serde(default)]
        auto_activation: SecretSource,
    },
}

impl TokenConfig {
    /// Software token at `keystore_path` with default sealing parameters.
    #[must_use]
    pub fn software(keystore_path: impl Into<PathBuf>) -> Self {
        Self::Software {
            keystore_path: keystore_path.into(),
            kdf: KdfParams::default(),
            auto_activation: SecretSource::None,
        }
    }

    /// Hardware token using `key_label` on the first slot of `module_path`.
    #[must_use]
    pub fn hardware(module_path: impl Into<PathBuf>, key_label: impl Into<String>) -> Self {
        Self::Hardware {
            module_path: module_path.into(),
            slot_index: 0,
            key_label: key_label.into(),
            auto_activation: SecretSource::None,
        }
    }

    /// Returns the configured automatic activation source.
    #[must_use]
    pub fn auto_activation(&self) -> &SecretSource {
        match self {
            Self::Software { auto_activation, .. } | Self::Hardware { auto_activation, .. } => {
                auto_activation
            },
        }
    }

    /// Replaces the automatic activation source.
    #[must_use]
    pub fn with_auto_activation(mut self, source: SecretSource) -> Self {
        match &mut self {
            Self::Software { auto_activation, .. } | Self::Hardware { auto_activation, .. } => {
                *auto_activation = source;
            },
        }
        self
    }

    /// Checks mandatory properties.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingProperty`] for an empty path or label,
    /// or a [`KdfParams`] validation error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Software { keystore_path, kdf, .. } => {
                if is_empty_path(keystore_path) {
                    return Err(ConfigError::MissingProperty { field: "keystore_path" });
                }
                kdf.validate()
            },
            Self::Hardware { module_path, key_label, .. } => {
                if is_empty_path(module_path) {
                    return Err(ConfigError::MissingProperty { field: "module_path" });
                }
                if key_label.trim().is_empty() {
                    return Err(ConfigError::MissingProperty { field: "key_label" });
                }
                Ok(())
            },
        }
    }
}

fn is_empty_path(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization
// ─────────────────────────────────────────────────────────────────────────────

/// How a worker authenticates its clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Match the client certificate's serial number and issuer DN.
    #[default]
    ClientCertificate,
    /// Match the username of a username/password credential.
    Username,
    /// Accept every request. Must be chosen explicitly.
    NoAuth,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientCertificate => write!(f, "client_certificate"),
            Self::Username => write!(f, "username"),
            Self::NoAuth => write!(f, "no_auth"),
        }
    }
}

/// One entry of a worker's authorized-client list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthorizedClient {
    /// A client certificate identified by serial number and issuer.
    Certificate {
        /// Certificate serial number (hex).
        serial_number: SerialNumber,
        /// Issuer distinguished name.
        issuer_dn: String,
    },
    /// A username credential.
    Username {
        /// Account name.
        username: String,
    },
}

impl AuthorizedClient {
    /// Certificate entry from a hex serial and an issuer DN.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `serial_hex` is not hex.
    pub fn certificate(
        serial_hex: &str,
        issuer_dn: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::Certificate {
            serial_number: SerialNumber::parse(serial_hex)?,
            issuer_dn: issuer_dn.into(),
        })
    }

    /// Username entry.
    #[must_use]
    pub fn username(username: impl Into<String>) -> Self {
        Self::Username { username: username.into() }
    }
}

/// Client authorization settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Credential type to check.
    #[serde(default)]
    pub auth_type: AuthType,
    /// Clients allowed to use the worker. Empty denies everyone.
    #[serde(default)]
    pub authorized_clients: Vec<AuthorizedClient>,
}

impl AuthConfig {
    /// Authorization settings with the given type and clients.
    #[must_use]
    pub fn new(auth_type: AuthType, authorized_clients: Vec<AuthorizedClient>) -> Self {
        Self { auth_type, authorized_clients }
    }

    /// Explicitly disables client authorization.
    #[must_use]
    pub fn no_auth() -> Self {
        Self { auth_type: AuthType::NoAuth, authorized_clients: Vec::new() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signer validity
// ─────────────────────────────────────────────────────────────────────────────

/// Signer certificate validity checks performed before each signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignerValidityConfig {
    /// Enforce the certificate validity period.
    #[serde(default = "default_true")]
    pub check_certificate_validity: bool,
    /// Enforce the private key usage period extension.
    #[serde(default = "default_true")]
    pub check_private_key_validity: bool,
    /// Stop signing this many days before the certificate expires.
    #[serde(default)]
    pub min_remaining_validity_days: u32,
}

impl Default for SignerValidityConfig {
    fn default() -> Self {
        Self {
            check_certificate_validity: true,
            check_private_key_validity: true,
            min_remaining_validity_days: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Validation cache settings of a validator worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationCacheConfig {
    /// Issuer DNs whose results may be cached.
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    /// Lifetime of a cached result.
    #[serde(with = "humantime_serde", default = "default_validation_ttl")]
    pub ttl: Duration,
}

impl Default for ValidationCacheConfig {
    fn default() -> Self {
        Self { trusted_issuers: Vec::new(), ttl: DEFAULT_VALIDATION_TTL }
    }
}

/// Kind-specific worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkerKindConfig {
    /// A worker that signs with its own crypto token.
    Signer {
        /// Crypto token backend.
        token: TokenConfig,
        /// DER file holding the signer certificate, if any.
        #[serde(default)]
        signer_certificate: Option<PathBuf>,
    },
    /// A worker that forwards to the first usable candidate.
    Dispatcher {
        /// Candidate workers in priority order.
        candidates: Vec<WorkerId>,
    },
    /// A certificate validation service.
    Validator {
        /// Validation cache settings.
        #[serde(default)]
        validation_cache: ValidationCacheConfig,
    },
}

impl WorkerKindConfig {
    /// Signer without a signer certificate.
    #[must_use]
    pub fn signer(token: TokenConfig) -> Self {
        Self::Signer { token, signer_certificate: None }
    }

    /// Dispatcher over `candidates`.
    #[must_use]
    pub fn dispatcher(candidates: impl IntoIterator<Item = WorkerId>) -> Self {
        Self::Dispatcher { candidates: candidates.into_iter().collect() }
    }

    /// Validator with the given cache settings.
    #[must_use]
    pub fn validator(validation_cache: ValidationCacheConfig) -> Self {
        Self::Validator { validation_cache }
    }

    /// Short name of the kind, used in logs and status.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Signer { .. } => "signer",
            Self::Dispatcher { .. } => "dispatcher",
            Self::Validator { .. } => "validator",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkerConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Complete configuration of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub(crate) id: WorkerId,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) disabled: bool,
    #[serde(default)]
    pub(crate) key_usage_limit: Option<u64>,
    #[serde(default)]
    pub(crate) auth: AuthConfig,
    #[serde(default)]
    pub(crate) signer_validity: SignerValidityConfig,
    #[serde(with = "humantime_serde", default = "default_activation_timeout")]
    pub(crate) activation_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_sign_timeout")]
    pub(crate) sign_timeout: Duration,
    pub(crate) kind: WorkerKindConfig,
}

#[bon::bon]
impl WorkerConfig {
    /// Creates a validated worker configuration.
    ///
    /// # Optional Fields
    ///
    /// * `disabled` - Administratively disabled (default: false).
    /// * `key_usage_limit` - Maximum signatures per key (default: unlimited).
    /// * `auth` - Client authorization (default: client certificates, none authorized).
    /// * `signer_validity` - Signer certificate checks (default: all enabled, no margin).
    /// * `activation_timeout` - Bound on activation (default: 30 seconds).
    /// * `sign_timeout` - Bound on signing (default: 10 seconds).
    ///
    /// # Errors
    ///
    /// Returns any error reported by [`WorkerConfig::validate`].
    #[builder]
    pub fn new(
        id: WorkerId,
        #[builder(into)] name: String,
        #[builder(default)] disabled: bool,
        key_usage_limit: Option<u64>,
        #[builder(default)] auth: AuthConfig,
        #[builder(default)] signer_validity: SignerValidityConfig,
        #[builder(default = DEFAULT_ACTIVATION_TIMEOUT)] activation_timeout: Duration,
        #[builder(default = DEFAULT_SIGN_TIMEOUT)] sign_timeout: Duration,
        kind: WorkerKindConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            id,
            name,
            disabled,
            key_usage_limit,
            auth,
            signer_validity,
            activation_timeout,
            sign_timeout,
            kind,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every mandatory property and lower bound.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingProperty`] for an empty name, an empty token path or label, or a
    ///   dispatcher without candidates
    /// - [`ConfigError::BelowMinimum`] for timeouts under [`MIN_TIMEOUT`] or weak KDF parameters
    /// - [`ConfigError::InvalidValue`] for a dispatcher listing itself as a candidate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingProperty { field: "name" });
        }

        for (field, value) in
            [("activation_timeout", self.activation_timeout), ("sign_timeout", self.sign_timeout)]
        {
            if value < MIN_TIMEOUT {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: format!("{value:?}"),
                    min: format!("{MIN_TIMEOUT:?}"),
                });
            }
        }

        match &self.kind {
            WorkerKindConfig::Signer { token, .. } => token.validate(),
            WorkerKindConfig::Dispatcher { candidates } => {
                if candidates.is_empty() {
                    return Err(ConfigError::MissingProperty { field: "candidates" });
                }
                if candidates.contains(&self.id) {
                    return Err(ConfigError::InvalidValue {
                        field: "candidates",
                        value: self.id.to_string(),
                        reason: "a dispatcher cannot dispatch to itself".to_owned(),
                    });
                }
                Ok(())
            },
            WorkerKindConfig::Validator { .. } => Ok(()),
        }
    }

    /// Returns the worker id.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configured disabled flag.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the key usage limit, `None` when unlimited.
    #[must_use]
    pub fn key_usage_limit(&self) -> Option<u64> {
        self.key_usage_limit
    }

    /// Returns the authorization settings.
    #[must_use]
    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    /// Returns the signer validity settings.
    #[must_use]
    pub fn signer_validity(&self) -> &SignerValidityConfig {
        &self.signer_validity
    }

    /// Returns the activation timeout.
    #[must_use]
    pub fn activation_timeout(&self) -> Duration {
        self.activation_timeout
    }

    /// Returns the signing timeout.
    #[must_use]
    pub fn sign_timeout(&self) -> Duration {
        self.sign_timeout
    }

    /// Returns the kind-specific settings.
    #[must_use]
    pub fn kind(&self) -> &WorkerKindConfig {
        &self.kind
    }
}
