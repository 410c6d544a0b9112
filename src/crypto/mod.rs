//! Field-level encryption for state records.
//!
//! Sensitive captured values are sealed with AES-256-GCM under a key that a
//! [`KeySource`] derives on first use. The key is cached inside the
//! [`EncryptionContext`] until [`EncryptionContext::clear_cache`] wipes it.
//!
//! Sealed values are stored as text blobs:
//!
//! ```text
//! v1:<base64(nonce || ciphertext || tag)>
//! ```
//!
//! Each call to [`EncryptionContext::protect`] draws a fresh 96-bit nonce, so
//! sealing the same plaintext twice yields different blobs.
pub mod key_source;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub use key_source::{KeySource, MachineBound, Passphrase, StaticKey};

/// Prefix identifying the blob format version.
pub const BLOB_PREFIX: &str = "v1:";

/// Length of the AES-GCM nonce in bytes.
const NONCE_LEN: usize = 12;

/// Length of the AES-GCM authentication tag in bytes.
const TAG_LEN: usize = 16;

/// 256-bit key material, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; 32]);

impl KeyMaterial {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Process-wide encryption state: a key source plus the lazily derived key.
///
/// Shared by reference between providers; derivation happens at most once
/// per cache lifetime, under the internal mutex.
pub struct EncryptionContext {
    source: Box<dyn KeySource>,
    key: Mutex<Option<Arc<KeyMaterial>>>,
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("source", &self.source.describe())
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl EncryptionContext {
    /// Create a context that derives its key from `source` on first use.
    #[must_use]
    pub fn new(source: impl KeySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            key: Mutex::new(None),
        }
    }

    /// Whether key material is currently cached.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop the cached key; the next call re-derives it.
    ///
    /// The key bytes are zeroized once the last in-flight user releases them.
    pub fn clear_cache(&self) {
        let taken = self
            .key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(taken);
        tracing::debug!("encryption key cache cleared");
    }

    fn key(&self) -> Result<Arc<KeyMaterial>, CryptoError> {
        let mut guard = self.key.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = guard.as_ref() {
            return Ok(Arc::clone(key));
        }
        tracing::debug!("deriving encryption key from {}", self.source.describe());
        let key = Arc::new(self.source.derive()?);
        *guard = Some(Arc::clone(&key));
        Ok(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        let key = self.key()?;
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }

    /// Seal `plaintext` into a versioned text blob.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation or encryption fails.
    pub fn protect(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption("AES-GCM seal failed".to_string()))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(format!("{BLOB_PREFIX}{}", STANDARD.encode(payload)))
    }

    /// Open a blob produced by [`protect`](Self::protect).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if `blob` is not ciphertext, was
    /// produced under a different key, or has been tampered with.
    pub fn unprotect(&self, blob: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = blob
            .strip_prefix(BLOB_PREFIX)
            .ok_or_else(|| CryptoError::Decryption("unrecognized blob format".to_string()))?;
        let payload = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption("blob is truncated".to_string()));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let cipher = self.cipher()?;
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))
    }
}

/// Whether `value` looks like a blob produced by [`EncryptionContext::protect`].
#[must_use]
pub fn is_blob(value: &str) -> bool {
    value.starts_with(BLOB_PREFIX)
}
