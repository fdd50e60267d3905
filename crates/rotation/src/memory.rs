//! In-memory collaborators
//!
//! Suitable for embedding and tests. Records keep insertion order so
//! enumeration is deterministic.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{LookupError, StoreError, StoreResult};
use crate::key::RecordKey;
use crate::secret::{EntityFactor, MasterSecret};
use crate::store::{AccountCredentialLookup, MasterSecretStore, SecretRecord, SecretStore};

/// In-memory [`SecretStore`]
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: RwLock<IndexMap<RecordKey, SecretRecord>>,
}

impl MemorySecretStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store holding `records`
    pub fn with_records(records: impl IntoIterator<Item = SecretRecord>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.records.write();
            for record in records {
                map.insert(record.key.clone(), record);
            }
        }
        Arc::new(store)
    }

    /// Snapshot of every record in insertion order
    pub fn snapshot(&self) -> Vec<SecretRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>> {
        Ok(self.snapshot())
    }

    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn persist(&self, record: SecretRecord) -> StoreResult<()> {
        self.records.write().insert(record.key.clone(), record);
        Ok(())
    }
}

/// In-memory [`AccountCredentialLookup`] keyed by entity name
#[derive(Debug, Default)]
pub struct MemoryAccountDirectory {
    accounts: RwLock<HashMap<String, String>>,
}

impl MemoryAccountDirectory {
    /// Create an empty directory
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers or replaces an account's credential hash
    pub fn insert(&self, entity: impl Into<String>, credential_hash: impl Into<String>) {
        self.accounts
            .write()
            .insert(entity.into(), credential_hash.into());
    }

    /// Removes an account
    pub fn remove(&self, entity: &str) -> bool {
        self.accounts.write().remove(entity).is_some()
    }
}

#[async_trait]
impl AccountCredentialLookup for MemoryAccountDirectory {
    async fn credential_factor(&self, entity: &str) -> Result<EntityFactor, LookupError> {
        self.accounts
            .read()
            .get(entity)
            .map(|hash| EntityFactor::from(hash.as_str()))
            .ok_or_else(|| LookupError::EntityNotFound {
                entity: entity.to_string(),
            })
    }
}

/// In-memory [`MasterSecretStore`] that counts `set_current` calls
#[derive(Debug)]
pub struct MemoryMasterSecretStore {
    current: RwLock<MasterSecret>,
    updates: AtomicUsize,
}

impl MemoryMasterSecretStore {
    /// Create a store holding `initial`
    pub fn new(initial: impl Into<MasterSecret>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(initial.into()),
            updates: AtomicUsize::new(0),
        })
    }

    /// How many times `set_current` succeeded
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterSecretStore for MemoryMasterSecretStore {
    async fn current(&self) -> StoreResult<MasterSecret> {
        Ok(self.current.read().clone())
    }

    async fn set_current(&self, secret: MasterSecret) -> StoreResult<()> {
        *self.current.write() = secret;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
