//! PKCS#11 hardware modules via `cryptoki`.
//!
//! Keys are ECDSA P-256 pairs identified by label and looked up on every
//! call. Data is hashed with SHA-256 before raw ECDSA signing, since not
//! every module supports the combined mechanism.

use std::{path::Path, sync::Arc};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    mechanism::Mechanism,
    object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle},
    session::{Session, UserType},
    types::AuthPin,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::hardware::{HardwareModule, ModuleLoader};
use crate::error::KeyStoreError;

/// DER-encoded OID of secp256r1 (1.2.840.10045.3.1.7).
const P256_EC_PARAMS: &str = "06082a8648ce3d030107";

fn map_error(context: &'static str, err: CryptokiError) -> KeyStoreError {
    match err {
        CryptokiError::Pkcs11(RvError::PinIncorrect | RvError::PinInvalid, _) => {
            KeyStoreError::WrongSecret
        },
        CryptokiError::Pkcs11(
            RvError::DeviceRemoved | RvError::DeviceError | RvError::TokenNotPresent,
            _,
        ) => KeyStoreError::unavailable(format!("{context}: {err}")),
        other => KeyStoreError::backend_with_source(context, other),
    }
}

/// Loads PKCS#11 libraries and opens a read-write session on a slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pkcs11Loader;

impl ModuleLoader for Pkcs11Loader {
    fn load(
        &self,
        module_path: &Path,
        slot_index: usize,
    ) -> Result<Arc<dyn HardwareModule>, KeyStoreError> {
        let unavailable = |e: CryptokiError| {
            KeyStoreError::unavailable(format!("cannot load {}: {e}", module_path.display()))
        };
        let pkcs11 = Pkcs11::new(module_path).map_err(unavailable)?;
        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(unavailable)?;

        let slots = pkcs11.get_slots_with_token().map_err(unavailable)?;
        let slot = slots.get(slot_index).copied().ok_or_else(|| {
            KeyStoreError::unavailable(format!("no token present in slot index {slot_index}"))
        })?;
        let session = pkcs11.open_rw_session(slot).map_err(unavailable)?;

        Ok(Arc::new(Pkcs11Module { _pkcs11: pkcs11, session: Mutex::new(session) }))
    }
}

/// One read-write session on a PKCS#11 slot.
pub struct Pkcs11Module {
    _pkcs11: Pkcs11,
    session: Mutex<Session>,
}

impl Pkcs11Module {
    fn find_key(
        session: &Session,
        label: &str,
        class: ObjectClass,
    ) -> Result<Option<ObjectHandle>, KeyStoreError> {
        let template = [Attribute::Class(class), Attribute::Label(label.as_bytes().to_vec())];
        let handles =
            session.find_objects(&template).map_err(|e| map_error("object lookup failed", e))?;
        Ok(handles.into_iter().next())
    }

    fn ec_point(session: &Session, handle: ObjectHandle) -> Result<Vec<u8>, KeyStoreError> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::EcPoint])
            .map_err(|e| map_error("reading public key failed", e))?;
        attrs
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::EcPoint(bytes) => Some(bytes),
                _ => None,
            })
            .ok_or_else(|| KeyStoreError::malformed("public key object has no EC point"))
    }
}

impl HardwareModule for Pkcs11Module {
    fn login(&self, pin: &[u8]) -> Result<(), KeyStoreError> {
        let pin = std::str::from_utf8(pin).map_err(|_| KeyStoreError::WrongSecret)?;
        let session = self.session.lock();
        match session.login(UserType::User, Some(&AuthPin::new(pin.to_owned()))) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(e) => Err(map_error("login failed", e)),
        }
    }

    fn logout(&self) -> Result<(), KeyStoreError> {
        match self.session.lock().logout() {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
            Err(e) => Err(map_error("logout failed", e)),
        }
    }

    fn public_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError> {
        let session = self.session.lock();
        let handle =
            Self::find_key(&session, label, ObjectClass::PUBLIC_KEY)?.ok_or(KeyStoreError::NoKey)?;
        Self::ec_point(&session, handle)
    }

    fn sign(&self, label: &str, data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let session = self.session.lock();
        let handle = Self::find_key(&session, label, ObjectClass::PRIVATE_KEY)?
            .ok_or(KeyStoreError::NoKey)?;
        let digest = Sha256::digest(data);
        session.sign(&Mechanism::Ecdsa, handle, &digest).map_err(|e| map_error("sign failed", e))
    }

    fn verify(&self, label: &str, data: &[u8], signature: &[u8]) -> Result<(), KeyStoreError> {
        let session = self.session.lock();
        let handle =
            Self::find_key(&session, label, ObjectClass::PUBLIC_KEY)?.ok_or(KeyStoreError::NoKey)?;
        let digest = Sha256::digest(data);
        session
            .verify(&Mechanism::Ecdsa, handle, &digest, signature)
            .map_err(|e| map_error("verify failed", e))
    }

    fn generate_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError> {
        let ec_params = hex::decode(P256_EC_PARAMS)
            .map_err(|e| KeyStoreError::backend_with_source("invalid EC parameters", e))?;
        let label_bytes = label.as_bytes().to_vec();

        let public_template = [
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(ec_params),
            Attribute::Label(label_bytes.clone()),
        ];
        let private_template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Label(label_bytes),
        ];

        let session = self.session.lock();
        let (public, _private) = session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &public_template, &private_template)
            .map_err(|e| map_error("key generation failed", e))?;
        Self::ec_point(&session, public)
    }

    fn destroy_key(&self, label: &str) -> Result<(), KeyStoreError> {
        let session = self.session.lock();
        for class in [ObjectClass::PRIVATE_KEY, ObjectClass::PUBLIC_KEY] {
            if let Some(handle) = Self::find_key(&session, label, class)? {
                session.destroy_object(handle).map_err(|e| map_error("destroy failed", e))?;
            }
        }
        Ok(())
    }

    fn has_key(&self, label: &str) -> Result<bool, KeyStoreError> {
        let session = self.session.lock();
        Ok(Self::find_key(&session, label, ObjectClass::PUBLIC_KEY)?.is_some())
    }
}
