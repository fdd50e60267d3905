//! File-backed collaborators for the operator CLI
//!
//! - [`FileStateStore`]: accounts and certificate records in one JSON document
//! - [`FileMasterSecretStore`]: the current master secret, base64 in its own file
//!
//! Every write replaces the file atomically.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::RwLock;
use rekey_rotation::error::StoreResult;
use rekey_rotation::{
    AccountCredentialLookup, EntityFactor, LookupError, MasterSecret, MasterSecretStore, RecordKey,
    SecretRecord, SecretStore, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Current state document version
const STATE_VERSION: u32 = 1;

/// Atomically write data to a file
///
/// Writes a temporary file in the same directory, restricts it to the owner
/// on Unix, then renames it over the target.
async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_file_name(format!(
        "{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("rekey"),
        Uuid::new_v4()
    ));

    tokio::fs::write(&temp_path, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&temp_path, perms).await?;
    }

    tokio::fs::rename(&temp_path, path).await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, String>,
    #[serde(default)]
    certificates: Vec<SecretRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            accounts: BTreeMap::new(),
            certificates: Vec::new(),
        }
    }
}

/// Accounts and certificate records persisted as one JSON document
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    document: RwLock<StateDocument>,
}

impl FileStateStore {
    /// Opens the state file; a missing file is an empty state
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Arc<Self>> {
        let path = path.into();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let document: StateDocument = serde_json::from_slice(&bytes)?;
                if document.version > STATE_VERSION {
                    return Err(StoreError::backend(format!(
                        "state file version {} is newer than supported version {STATE_VERSION}",
                        document.version
                    )));
                }
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(
            path = %path.display(),
            accounts = document.accounts.len(),
            certificates = document.certificates.len(),
            "Opened state file"
        );
        Ok(Arc::new(Self {
            path,
            document: RwLock::new(document),
        }))
    }

    /// Registers or replaces an account's credential hash
    pub async fn add_account(&self, username: &str, credential_hash: &str) -> StoreResult<()> {
        self.document
            .write()
            .accounts
            .insert(username.to_string(), credential_hash.to_string());
        self.save().await
    }

    /// Whether `username` has an account
    pub fn has_account(&self, username: &str) -> bool {
        self.document.read().accounts.contains_key(username)
    }

    async fn save(&self) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(&*self.document.read())?;
        atomic_write(&self.path, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileStateStore {
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>> {
        Ok(self.document.read().certificates.clone())
    }

    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord> {
        self.document
            .read()
            .certificates
            .iter()
            .find(|record| &record.key == key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn persist(&self, record: SecretRecord) -> StoreResult<()> {
        {
            let mut document = self.document.write();
            match document
                .certificates
                .iter_mut()
                .find(|existing| existing.key == record.key)
            {
                Some(existing) => *existing = record,
                None => document.certificates.push(record),
            }
        }
        self.save().await
    }
}

#[async_trait]
impl AccountCredentialLookup for FileStateStore {
    async fn credential_factor(&self, entity: &str) -> Result<EntityFactor, LookupError> {
        self.document
            .read()
            .accounts
            .get(entity)
            .map(|hash| EntityFactor::from(hash.as_str()))
            .ok_or_else(|| LookupError::EntityNotFound {
                entity: entity.to_string(),
            })
    }
}

/// Current master secret kept base64-encoded in its own file
#[derive(Debug, Clone)]
pub struct FileMasterSecretStore {
    path: PathBuf,
}

impl FileMasterSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    /// Whether a master secret has been written
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MasterSecretStore for FileMasterSecretStore {
    async fn current(&self) -> StoreResult<MasterSecret> {
        let encoded = match tokio::fs::read_to_string(&self.path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::backend(format!(
                    "no master secret at {}; run `rekey master init` first",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        STANDARD
            .decode(encoded.trim())
            .map(MasterSecret::new)
            .map_err(|e| StoreError::backend(format!("master secret file is not base64: {e}")))
    }

    async fn set_current(&self, secret: MasterSecret) -> StoreResult<()> {
        let encoded = STANDARD.encode(secret.expose());
        atomic_write(&self.path, encoded.as_bytes()).await?;
        debug!(path = %self.path.display(), "Master secret file replaced");
        Ok(())
    }
}
