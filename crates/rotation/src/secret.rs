//! Secret material handled during rotation
//!
//! - [`MasterSecret`]: the system-wide key-derivation input
//! - [`EntityFactor`]: per-record secret material mixed into key derivation
//! - [`EncryptedSecret`]: the stored ciphertext of a record
//!
//! Plaintext-bearing types zeroize on drop and never print their contents.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// System-wide master secret
///
/// Equality is constant-time so comparing an operator-supplied secret against
/// the current one does not leak a matching prefix length.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    /// Wraps raw secret bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes for key derivation
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Whether the secret has no content
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for MasterSecret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for MasterSecret {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl PartialEq for MasterSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for MasterSecret {}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// Entity-specific factor (e.g. the owning account's credential hash)
///
/// Compromising the master secret alone is not enough to decrypt a record;
/// this factor is also required.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EntityFactor(Vec<u8>);

impl EntityFactor {
    /// Wraps raw factor bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes for key derivation
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for EntityFactor {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl fmt::Debug for EntityFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntityFactor([REDACTED])")
    }
}

/// Ciphertext of a stored secret, serialized as standard base64
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EncryptedSecret(Vec<u8>);

impl EncryptedSecret {
    /// Wraps ciphertext bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Ciphertext bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the wrapper
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Base64 rendering used by persistent formats
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Parses the base64 rendering
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded).map(Self)
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret({} bytes)", self.0.len())
    }
}

impl Serialize for EncryptedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncryptedSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
