//! Software key store: an Ed25519 key sealed in a JSON file.
//!
//! The sealing key is derived from the activation secret with Argon2id and
//! the private key is encrypted with ChaCha20-Poly1305. A wrong secret
//! derives a different sealing key, so AEAD authentication fails and the
//! store reports [`KeyStoreError::WrongSecret`].
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "algorithm": "ed25519",
//!   "kdf": { "memory_kib": 65536, "iterations": 3, "parallelism": 4 },
//!   "salt": "<base64, 16 bytes>",
//!   "nonce": "<base64, 12 bytes>",
//!   "ciphertext": "<base64>",
//!   "public_key": "<base64, 32 bytes>"
//! }
//! ```
//!
//! The KDF parameters are stored with the key, so changing the configured
//! parameters only affects keys generated afterwards.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{KeyHandle, KeyStore};
use crate::{config::KdfParams, error::KeyStoreError};

const FORMAT_VERSION: u32 = 1;
const ALGORITHM: &str = "ed25519";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SealedKeyFile {
    version: u32,
    algorithm: String,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
    public_key: String,
}

/// Key store backed by a sealed keystore file.
#[derive(Debug, Clone)]
pub struct SoftwareKeyStore {
    path: PathBuf,
    kdf: KdfParams,
}

impl SoftwareKeyStore {
    /// Creates a store over `path`; nothing is read until [`KeyStore::open`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kdf: KdfParams) -> Self {
        Self { path: path.into(), kdf }
    }

    /// Returns the keystore file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_sealed(&self) -> Result<SealedKeyFile, KeyStoreError> {
        let bytes = std::fs::read(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => KeyStoreError::NoKey,
            _ => KeyStoreError::unavailable(format!(
                "cannot read keystore {}: {e}",
                self.path.display()
            )),
        })?;
        let sealed: SealedKeyFile = serde_json::from_slice(&bytes)
            .map_err(|e| KeyStoreError::malformed(format!("keystore is not valid JSON: {e}")))?;
        if sealed.version != FORMAT_VERSION {
            return Err(KeyStoreError::malformed(format!(
                "unsupported keystore version {}",
                sealed.version
            )));
        }
        if sealed.algorithm != ALGORITHM {
            return Err(KeyStoreError::malformed(format!(
                "unsupported key algorithm {}",
                sealed.algorithm
            )));
        }
        Ok(sealed)
    }

    fn write_sealed(&self, sealed: &SealedKeyFile) -> Result<(), KeyStoreError> {
        let io_err =
            |e: io::Error| KeyStoreError::backend_with_source("failed to write keystore", e);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(sealed)
            .map_err(|e| KeyStoreError::backend_with_source("failed to encode keystore", e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, KeyStoreError> {
    STANDARD
        .decode(value)
        .map_err(|e| KeyStoreError::malformed(format!("invalid base64 in {name}: {e}")))
}

fn derive_sealing_key(
    secret: &[u8],
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyStoreError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| KeyStoreError::backend(format!("invalid key derivation parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(secret, salt, &mut key[..])
        .map_err(|e| KeyStoreError::backend(format!("key derivation failed: {e}")))?;
    Ok(key)
}

impl KeyStore for SoftwareKeyStore {
    fn kind(&self) -> &'static str {
        "software"
    }

    fn open(&self, secret: &[u8]) -> Result<Arc<dyn KeyHandle>, KeyStoreError> {
        let sealed = self.read_sealed()?;
        let salt = decode_field("salt", &sealed.salt)?;
        let nonce = decode_field("nonce", &sealed.nonce)?;
        let ciphertext = decode_field("ciphertext", &sealed.ciphertext)?;
        let public_key = decode_field("public_key", &sealed.public_key)?;
        if nonce.len() != NONCE_LEN {
            return Err(KeyStoreError::malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }

        let sealing_key = derive_sealing_key(secret, &salt, &sealed.kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sealing_key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| KeyStoreError::WrongSecret)?,
        );

        let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
        if plaintext.len() != KEY_LEN {
            return Err(KeyStoreError::malformed("sealed private key has the wrong length"));
        }
        key_bytes.copy_from_slice(&plaintext);
        let signing_key = SigningKey::from_bytes(&key_bytes);

        if signing_key.verifying_key().as_bytes().as_slice() != public_key.as_slice() {
            return Err(KeyStoreError::malformed("public key does not match sealed private key"));
        }

        Ok(Arc::new(SoftwareKeyHandle { signing_key, public_key }))
    }

    fn generate_key(&self, secret: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes().to_vec();

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealing_key = derive_sealing_key(secret, &salt, &self.kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sealing_key[..]));
        let private_key = Zeroizing::new(signing_key.to_bytes());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), private_key.as_slice())
            .map_err(|_| KeyStoreError::backend("failed to seal private key"))?;

        self.write_sealed(&SealedKeyFile {
            version: FORMAT_VERSION,
            algorithm: ALGORITHM.to_owned(),
            kdf: self.kdf,
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            public_key: STANDARD.encode(&public_key),
        })?;

        tracing::info!(path = %self.path.display(), "generated software key");
        Ok(public_key)
    }

    fn destroy_key(&self) -> Result<(), KeyStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyStoreError::backend_with_source("failed to remove keystore", e)),
        }
    }

    fn has_key(&self) -> Result<bool, KeyStoreError> {
        self.path.try_exists().map_err(|e| {
            KeyStoreError::unavailable(format!("cannot stat keystore {}: {e}", self.path.display()))
        })
    }

    fn caches_secret(&self) -> bool {
        true
    }
}

/// An unsealed Ed25519 key. The signing key zeroes itself on drop.
struct SoftwareKeyHandle {
    signing_key: SigningKey,
    public_key: Vec<u8>,
}

impl KeyHandle for SoftwareKeyHandle {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        Ok(self.signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), KeyStoreError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| KeyStoreError::backend_with_source("malformed signature", e))?;
        let verifying_key: VerifyingKey = self.signing_key.verifying_key();
        verifying_key
            .verify(data, &signature)
            .map_err(|e| KeyStoreError::backend_with_source("signature verification failed", e))
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}
