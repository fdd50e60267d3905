//! Collaborator contracts consumed by rotation
//!
//! Implementations live outside the rotation core; [`crate::memory`] ships
//! in-process versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LookupError, StoreResult};
use crate::key::RecordKey;
use crate::secret::{EncryptedSecret, EntityFactor, MasterSecret};

/// A stored secret encrypted under the current master secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Composite `(domain, entity)` key
    pub key: RecordKey,

    /// Ciphertext under `(master secret, entity factor)`
    pub encrypted_secret: EncryptedSecret,
}

impl SecretRecord {
    /// Creates a record
    pub fn new(key: RecordKey, encrypted_secret: EncryptedSecret) -> Self {
        Self {
            key,
            encrypted_secret,
        }
    }
}

/// Durable records owned by one rotation participant
///
/// Implementations must give read-your-writes consistency within a process:
/// a `find_by_key` after `persist` returns the persisted value.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Every record in the store
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>>;

    /// One record, or [`StoreError::NotFound`](crate::error::StoreError::NotFound)
    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord>;

    /// Inserts or replaces a record
    async fn persist(&self, record: SecretRecord) -> StoreResult<()>;
}

/// Resolves the entity-specific factor used in key derivation
#[async_trait]
pub trait AccountCredentialLookup: Send + Sync {
    /// Factor for `entity`, or [`LookupError::EntityNotFound`]
    async fn credential_factor(&self, entity: &str) -> Result<EntityFactor, LookupError>;
}

/// Holder of the current master secret
#[async_trait]
pub trait MasterSecretStore: Send + Sync {
    /// The current master secret
    async fn current(&self) -> StoreResult<MasterSecret>;

    /// Replaces the current master secret
    ///
    /// Called exactly once per successful rotation, after every handler
    /// applied.
    async fn set_current(&self, secret: MasterSecret) -> StoreResult<()>;
}
