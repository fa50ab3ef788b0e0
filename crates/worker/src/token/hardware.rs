//! Hardware key store: keys held by a native signing module.
//!
//! [`HardwareModule`] is the native boundary. Every call may block on device
//! I/O, so the token state machine runs them on the blocking pool under the
//! configured timeouts. The module itself is loaded lazily by a
//! [`ModuleLoader`] on first use, which keeps worker registration cheap and
//! lets an unreachable device surface as an offline token rather than a
//! configuration error.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use super::{KeyHandle, KeyStore};
use crate::error::KeyStoreError;

/// Operations a hardware signing module exposes for one slot.
///
/// Keys are addressed by label. Implementations must be usable from several
/// threads; serializing access to an underlying session is their concern.
pub trait HardwareModule: Send + Sync {
    /// Logs in to the slot with the user PIN.
    ///
    /// Returns [`KeyStoreError::WrongSecret`] for an incorrect PIN.
    fn login(&self, pin: &[u8]) -> Result<(), KeyStoreError>;

    /// Logs out of the slot. Logging out when not logged in is not an error.
    fn logout(&self) -> Result<(), KeyStoreError>;

    /// Returns the public key for `label`, or [`KeyStoreError::NoKey`].
    fn public_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError>;

    /// Signs `data` with the private key for `label`.
    fn sign(&self, label: &str, data: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Verifies `signature` over `data` with the public key for `label`.
    fn verify(&self, label: &str, data: &[u8], signature: &[u8]) -> Result<(), KeyStoreError>;

    /// Generates a key pair under `label` and returns its public key.
    fn generate_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError>;

    /// Destroys both halves of the key pair under `label`.
    fn destroy_key(&self, label: &str) -> Result<(), KeyStoreError>;

    /// Returns `true` if a key pair exists under `label`.
    fn has_key(&self, label: &str) -> Result<bool, KeyStoreError>;
}

/// Loads a [`HardwareModule`] for a library path and slot.
pub trait ModuleLoader: Send + Sync {
    /// Opens `slot_index` of the module at `module_path`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Unavailable`] when the library or slot
    /// cannot be reached.
    fn load(
        &self,
        module_path: &Path,
        slot_index: usize,
    ) -> Result<Arc<dyn HardwareModule>, KeyStoreError>;
}

/// Loader used when the crate is built without native module support.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedModuleLoader;

impl ModuleLoader for UnsupportedModuleLoader {
    fn load(
        &self,
        module_path: &Path,
        _slot_index: usize,
    ) -> Result<Arc<dyn HardwareModule>, KeyStoreError> {
        Err(KeyStoreError::unavailable(format!(
            "cannot load {}: built without the pkcs11 feature",
            module_path.display()
        )))
    }
}

/// Returns the loader matching the enabled crate features.
#[must_use]
pub fn default_loader() -> Arc<dyn ModuleLoader> {
    #[cfg(feature = "pkcs11")]
    let loader: Arc<dyn ModuleLoader> = Arc::new(super::pkcs11::Pkcs11Loader);
    #[cfg(not(feature = "pkcs11"))]
    let loader: Arc<dyn ModuleLoader> = Arc::new(UnsupportedModuleLoader);
    loader
}

/// Key store backed by a labelled key in a hardware module slot.
pub struct HardwareKeyStore {
    module_path: PathBuf,
    slot_index: usize,
    key_label: String,
    loader: Arc<dyn ModuleLoader>,
    module: Mutex<Option<Arc<dyn HardwareModule>>>,
}

impl std::fmt::Debug for HardwareKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareKeyStore")
            .field("module_path", &self.module_path)
            .field("slot_index", &self.slot_index)
            .field("key_label", &self.key_label)
            .field("loaded", &self.module.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl HardwareKeyStore {
    /// Creates a store; the module is not loaded until first use.
    #[must_use]
    pub fn new(
        module_path: impl Into<PathBuf>,
        slot_index: usize,
        key_label: impl Into<String>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            slot_index,
            key_label: key_label.into(),
            loader,
            module: Mutex::new(None),
        }
    }

    /// Returns the key label.
    #[must_use]
    pub fn key_label(&self) -> &str {
        &self.key_label
    }

    fn module(&self) -> Result<Arc<dyn HardwareModule>, KeyStoreError> {
        let mut slot = self.module.lock();
        if let Some(module) = slot.as_ref() {
            return Ok(Arc::clone(module));
        }
        let module = self.loader.load(&self.module_path, self.slot_index)?;
        tracing::debug!(
            module = %self.module_path.display(),
            slot = self.slot_index,
            "loaded hardware module"
        );
        *slot = Some(Arc::clone(&module));
        Ok(module)
    }
}

impl KeyStore for HardwareKeyStore {
    fn kind(&self) -> &'static str {
        "hardware"
    }

    fn open(&self, secret: &[u8]) -> Result<Arc<dyn KeyHandle>, KeyStoreError> {
        let module = self.module()?;
        module.login(secret)?;
        match module.public_key(&self.key_label) {
            Ok(public_key) => Ok(Arc::new(HardwareKeyHandle {
                module,
                label: self.key_label.clone(),
                public_key,
            })),
            Err(e) => {
                if let Err(logout) = module.logout() {
                    tracing::warn!(error = %logout, "logout after failed key lookup failed");
                }
                Err(e)
            },
        }
    }

    fn generate_key(&self, secret: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let module = self.module()?;
        module.login(secret)?;
        let result = module.generate_key(&self.key_label);
        if let Err(e) = module.logout() {
            tracing::warn!(error = %e, "logout after key generation failed");
        }
        result
    }

    fn destroy_key(&self) -> Result<(), KeyStoreError> {
        self.module()?.destroy_key(&self.key_label)
    }

    fn has_key(&self) -> Result<bool, KeyStoreError> {
        self.module()?.has_key(&self.key_label)
    }

    fn release(&self) {
        let loaded = self.module.lock().clone();
        if let Some(module) = loaded {
            if let Err(e) = module.logout() {
                tracing::warn!(error = %e, "hardware module logout failed");
            }
        }
    }

    fn caches_secret(&self) -> bool {
        false
    }
}

struct HardwareKeyHandle {
    module: Arc<dyn HardwareModule>,
    label: String,
    public_key: Vec<u8>,
}

impl KeyHandle for HardwareKeyHandle {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.module.sign(&self.label, data)
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), KeyStoreError> {
        self.module.verify(&self.label, data, signature)
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}
