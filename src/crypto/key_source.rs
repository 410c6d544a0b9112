//! Sources of encryption key material.
use std::fmt;

use argon2::Argon2;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::KeyMaterial;
use crate::error::CryptoError;

/// Minimum salt length accepted by Argon2.
const MIN_SALT_LEN: usize = 8;

/// Produces the 256-bit key used by the
/// [`EncryptionContext`](super::EncryptionContext).
pub trait KeySource: Send + Sync + fmt::Debug {
    /// Derive key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if the inputs are unusable.
    fn derive(&self) -> Result<KeyMaterial, CryptoError>;

    /// Short label for logs; never includes secret material.
    fn describe(&self) -> String;
}

/// Argon2id over a passphrase and a configured salt.
///
/// Records sealed under a passphrase can be restored on any machine that is
/// given the same passphrase and salt.
pub struct Passphrase {
    passphrase: Zeroizing<String>,
    salt: Vec<u8>,
}

impl Passphrase {
    /// Create a passphrase source.
    #[must_use]
    pub fn new(passphrase: impl Into<String>, salt: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            salt: salt.into(),
        }
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("salt_len", &self.salt.len())
            .finish_non_exhaustive()
    }
}

impl KeySource for Passphrase {
    fn derive(&self) -> Result<KeyMaterial, CryptoError> {
        if self.passphrase.is_empty() {
            return Err(CryptoError::KeyDerivation("passphrase is empty".to_string()));
        }
        if self.salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::KeyDerivation(format!(
                "salt must be at least {MIN_SALT_LEN} bytes"
            )));
        }
        let mut out = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), &self.salt, out.as_mut())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(KeyMaterial::new(*out))
    }

    fn describe(&self) -> String {
        "passphrase".to_string()
    }
}

/// Key bound to this machine, the current user and an application label.
///
/// Ciphertext sealed under this source only opens on the same machine for
/// the same user.
#[derive(Debug, Clone)]
pub struct MachineBound {
    machine_id: String,
    user: String,
    label: String,
}

impl MachineBound {
    /// Create a machine-bound source from explicit identity parts.
    #[must_use]
    pub fn new(
        machine_id: impl Into<String>,
        user: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            user: user.into(),
            label: label.into(),
        }
    }

    /// Bind to the machine and user this process runs as.
    ///
    /// # Errors
    ///
    /// Returns an error if the machine identifier cannot be read.
    pub fn detect(label: impl Into<String>) -> Result<Self, CryptoError> {
        let machine_id = crate::platform::machine_id()
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self::new(machine_id, crate::platform::user_name(), label))
    }
}

impl KeySource for MachineBound {
    fn derive(&self) -> Result<KeyMaterial, CryptoError> {
        if self.machine_id.trim().is_empty() {
            return Err(CryptoError::KeyDerivation(
                "machine identifier is empty".to_string(),
            ));
        }
        let mut hasher = Sha256::new();
        for part in [&self.machine_id, &self.user, &self.label] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Ok(KeyMaterial::new(hasher.finalize().into()))
    }

    fn describe(&self) -> String {
        format!("machine-bound key for {}", self.user)
    }
}

/// A fixed key supplied by the caller.
#[derive(Clone)]
pub struct StaticKey(KeyMaterial);

impl StaticKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(KeyMaterial::new(bytes))
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticKey(..)")
    }
}

impl KeySource for StaticKey {
    fn derive(&self) -> Result<KeyMaterial, CryptoError> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "static key".to_string()
    }
}
