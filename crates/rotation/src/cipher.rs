//! Pluggable secret cipher
//!
//! A [`SecretCipher`] seals a record's plaintext under a key derived from the
//! master secret and the record's entity factor. Rotation only relies on the
//! contract: decrypt under the old master secret, re-encrypt under the new
//! one, same factor.
//!
//! [`AesGcmCipher`] is the shipped default: Argon2id key derivation and
//! AES-256-GCM sealing.
//!
//! # Wire format
//!
//! ```text
//! +---------+-----------+------------------------+
//! | version | nonce     | ciphertext || GCM tag  |
//! | 1 byte  | 12 bytes  | n + 16 bytes           |
//! +---------+-----------+------------------------+
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CipherError;
use crate::secret::{EncryptedSecret, EntityFactor, MasterSecret};

/// Current wire format version
pub const FORMAT_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SALT_CONTEXT: &[u8] = b"rekey/record-key/v1";

/// Seals and opens record secrets
pub trait SecretCipher: Send + Sync {
    /// Encrypts `plaintext` under `(master, factor)`
    fn encrypt(
        &self,
        master: &MasterSecret,
        factor: &EntityFactor,
        plaintext: &[u8],
    ) -> Result<EncryptedSecret, CipherError>;

    /// Decrypts a record sealed under `(master, factor)`
    fn decrypt(
        &self,
        master: &MasterSecret,
        factor: &EntityFactor,
        encrypted: &EncryptedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError>;

    /// Moves a record from `old` to `new`
    ///
    /// The plaintext only lives in a zeroizing buffer between the two steps.
    /// Any error from the decrypt step is returned unchanged so callers can
    /// tell a wrong old secret apart from a sealing failure.
    fn reencrypt(
        &self,
        old: &MasterSecret,
        new: &MasterSecret,
        factor: &EntityFactor,
        encrypted: &EncryptedSecret,
    ) -> Result<EncryptedSecret, ReencryptError> {
        let plaintext = self
            .decrypt(old, factor, encrypted)
            .map_err(ReencryptError::Open)?;
        self.encrypt(new, factor, &plaintext)
            .map_err(ReencryptError::Seal)
    }
}

/// Which half of a [`SecretCipher::reencrypt`] failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReencryptError {
    /// Decrypting under the old secret failed
    Open(CipherError),
    /// Encrypting under the new secret failed
    Seal(CipherError),
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Number of passes
    pub iterations: u32,

    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19_456, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Argon2id + AES-256-GCM cipher
#[derive(Debug, Clone)]
pub struct AesGcmCipher {
    params: Params,
}

impl AesGcmCipher {
    /// Builds a cipher, validating the Argon2 parameters up front
    pub fn new(config: CipherConfig) -> Result<Self, CipherError> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CipherError::KeyDerivation {
            reason: e.to_string(),
        })?;
        Ok(Self { params })
    }

    fn derive_key(
        &self,
        master: &MasterSecret,
        factor: &EntityFactor,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
        // Length prefix keeps (master, factor) pairs unambiguous
        let master_len = u32::try_from(master.len()).map_err(|_| CipherError::KeyDerivation {
            reason: "master secret too long".to_string(),
        })?;
        let mut password = Zeroizing::new(Vec::with_capacity(
            4 + master.len() + factor.expose().len(),
        ));
        password.extend_from_slice(&master_len.to_be_bytes());
        password.extend_from_slice(master.expose());
        password.extend_from_slice(factor.expose());

        let mut hasher = Sha256::new();
        hasher.update(SALT_CONTEXT);
        hasher.update(factor.expose());
        let salt = hasher.finalize();

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(&password, &salt[..], &mut key[..])
            .map_err(|e| CipherError::KeyDerivation {
                reason: e.to_string(),
            })?;
        Ok(key)
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(
        &self,
        master: &MasterSecret,
        factor: &EntityFactor,
        plaintext: &[u8],
    ) -> Result<EncryptedSecret, CipherError> {
        let key = self.derive_key(master, factor)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Encryption)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(EncryptedSecret::new(out))
    }

    fn decrypt(
        &self,
        master: &MasterSecret,
        factor: &EntityFactor,
        encrypted: &EncryptedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let bytes = encrypted.as_bytes();
        if bytes.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(CipherError::Malformed {
                reason: format!("{} bytes is shorter than the minimum", bytes.len()),
            });
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(CipherError::Malformed {
                reason: format!("unsupported format version {}", bytes[0]),
            });
        }

        let (nonce, sealed) = bytes[1..].split_at(NONCE_LEN);
        let key = self.derive_key(master, factor)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| CipherError::Decryption)
    }
}
