//! Project-specific user certificate handler
//!
//! Each project member's certificate keystore password is stored encrypted
//! under the master secret and the member's account credential hash. Records
//! are keyed `(project name, username)`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

use crate::cipher::{ReencryptError, SecretCipher};
use crate::compensation::{CompensationEntry, CompensationLog};
use crate::error::{HandlerError, HandlerResult, StoreResult};
use crate::handler::{DivergentRecord, HandlerPhase, RollbackReport, RotationHandler};
use crate::key::{HandlerId, RecordKey};
use crate::secret::MasterSecret;
use crate::store::{AccountCredentialLookup, SecretRecord, SecretStore};

/// Default registration id of the certificate handler
pub const CERTIFICATE_HANDLER_ID: &str = "project-user-certs";

#[derive(Debug, Default)]
struct AttemptState {
    phase: HandlerPhase,
    log: CompensationLog,
}

impl AttemptState {
    fn advance(&mut self, handler: &HandlerId, next: HandlerPhase) -> HandlerResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(HandlerError::InvalidPhase {
                handler: handler.clone(),
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }
}

/// Moves an interrupted `apply` from `Applying` to `Failed`
///
/// Dropping the `apply` future (timeout, task abort) skips the code that
/// settles the phase; the guard settles it instead so the captured entries
/// stay reachable by `rollback`.
struct ApplyGuard<'a> {
    handler: &'a CertificateSecretHandler,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.handler.state.lock();
        if state.phase == HandlerPhase::Applying {
            warn!(
                handler = %self.handler.id,
                captured = state.log.len(),
                "Certificate password re-encryption interrupted, rollback required"
            );
            state.phase = HandlerPhase::Failed;
        }
    }
}

/// Rotates certificate keystore passwords
pub struct CertificateSecretHandler {
    id: HandlerId,
    accounts: Arc<dyn AccountCredentialLookup>,
    cipher: Arc<dyn SecretCipher>,
    store: OnceLock<Arc<dyn SecretStore>>,
    state: Mutex<AttemptState>,
}

impl CertificateSecretHandler {
    /// Handler registered as [`CERTIFICATE_HANDLER_ID`]
    pub fn new(accounts: Arc<dyn AccountCredentialLookup>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self::with_id(
            HandlerId::from_static(CERTIFICATE_HANDLER_ID),
            accounts,
            cipher,
        )
    }

    /// Handler registered under a custom id
    pub fn with_id(
        id: HandlerId,
        accounts: Arc<dyn AccountCredentialLookup>,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        Self {
            id,
            accounts,
            cipher,
            store: OnceLock::new(),
            state: Mutex::new(AttemptState::default()),
        }
    }

    /// Number of compensation entries held for the in-flight attempt
    pub fn pending_compensations(&self) -> usize {
        self.state.lock().log.len()
    }

    fn transition(&self, next: HandlerPhase) -> HandlerResult<()> {
        self.state.lock().advance(&self.id, next)
    }

    async fn reencrypt_all(
        &self,
        store: &dyn SecretStore,
        old: &MasterSecret,
        new: &MasterSecret,
    ) -> HandlerResult<Vec<RecordKey>> {
        let records = store
            .list_all()
            .await
            .map_err(|source| HandlerError::Listing { source })?;

        let mut updated = Vec::with_capacity(records.len());
        for SecretRecord {
            key,
            encrypted_secret,
        } in records
        {
            // Captured before anything below can persist a new value
            self.state.lock().log.capture(&key, &encrypted_secret);

            let factor = self
                .accounts
                .credential_factor(key.entity())
                .await
                .map_err(|source| HandlerError::EntityNotFound {
                    key: key.clone(),
                    source,
                })?;

            // Argon2 runs twice per record; keep it off the async workers
            let cipher = Arc::clone(&self.cipher);
            let (old, new) = (old.clone(), new.clone());
            let rotated = tokio::task::spawn_blocking(move || {
                cipher.reencrypt(&old, &new, &factor, &encrypted_secret)
            })
            .await
            .map_err(|e| HandlerError::Worker {
                key: key.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| match e {
                    ReencryptError::Open(source) => HandlerError::Decryption {
                        key: key.clone(),
                        source,
                    },
                    ReencryptError::Seal(source) => HandlerError::Encryption {
                        key: key.clone(),
                        source,
                    },
                })?;

            store
                .persist(SecretRecord::new(key.clone(), rotated))
                .await
                .map_err(|source| HandlerError::Store {
                    key: key.clone(),
                    source,
                })?;

            debug!(handler = %self.id, record = %key, "Re-encrypted certificate password");
            updated.push(key);
        }

        Ok(updated)
    }

    async fn restore(store: &dyn SecretStore, entry: &CompensationEntry) -> StoreResult<()> {
        let mut record = store.find_by_key(&entry.key).await?;
        record.encrypted_secret = entry.prior.clone();
        store.persist(record).await
    }
}

impl std::fmt::Debug for CertificateSecretHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSecretHandler")
            .field("id", &self.id)
            .field("bound", &self.store.get().is_some())
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

#[async_trait]
impl RotationHandler for CertificateSecretHandler {
    fn id(&self) -> &HandlerId {
        &self.id
    }

    fn bind_store(&self, store: Arc<dyn SecretStore>) -> HandlerResult<()> {
        self.store
            .set(store)
            .map_err(|_| HandlerError::AlreadyBound {
                handler: self.id.clone(),
            })
    }

    fn phase(&self) -> HandlerPhase {
        self.state.lock().phase
    }

    async fn apply(&self, old: &MasterSecret, new: &MasterSecret) -> HandlerResult<Vec<RecordKey>> {
        let store = self
            .store
            .get()
            .cloned()
            .ok_or_else(|| HandlerError::NotBound {
                handler: self.id.clone(),
            })?;
        self.transition(HandlerPhase::Applying)?;
        let _interrupted = ApplyGuard { handler: self };

        match self.reencrypt_all(store.as_ref(), old, new).await {
            Ok(updated) => {
                self.transition(HandlerPhase::Applied)?;
                info!(
                    handler = %self.id,
                    updated = updated.len(),
                    "Certificate passwords re-encrypted under the new master secret"
                );
                Ok(updated)
            }
            Err(e) => {
                self.transition(HandlerPhase::Failed)?;
                error!(
                    handler = %self.id,
                    captured = self.pending_compensations(),
                    error = %e,
                    "Certificate password re-encryption failed, rollback required"
                );
                Err(e)
            }
        }
    }

    async fn rollback(&self) -> RollbackReport {
        // Entries stay in the log until every restore was attempted, so an
        // interrupted rollback can be replayed from `RolledBack`.
        let entries = {
            let mut state = self.state.lock();
            if !state.phase.needs_compensation() {
                debug!(handler = %self.id, phase = %state.phase, "Nothing to roll back");
                return RollbackReport::empty(self.id.clone());
            }
            if state.phase != HandlerPhase::RolledBack {
                if let Err(e) = state.advance(&self.id, HandlerPhase::RolledBack) {
                    error!(handler = %self.id, error = %e, "Cannot start rollback");
                    return RollbackReport::empty(self.id.clone());
                }
            }
            state.log.entries().collect::<Vec<_>>()
        };

        debug!(handler = %self.id, entries = entries.len(), "Rolling back");
        let mut report = RollbackReport::empty(self.id.clone());
        for entry in entries {
            let result = match self.store.get() {
                Some(store) => Self::restore(store.as_ref(), &entry)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("no store bound".to_string()),
            };

            match result {
                Ok(()) => report.restored.push(entry.key),
                Err(reason) => {
                    error!(
                        handler = %self.id,
                        record = %entry.key,
                        reason = %reason,
                        "Could not restore certificate password, record is divergent"
                    );
                    report.divergent.push(DivergentRecord {
                        key: entry.key,
                        prior: entry.prior,
                        reason,
                    });
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.log.clear();
            if let Err(e) = state.advance(&self.id, HandlerPhase::Idle) {
                error!(handler = %self.id, error = %e, "Cannot settle after rollback");
            }
        }

        if report.is_complete() {
            info!(
                handler = %self.id,
                restored = report.restored.len(),
                "Certificate passwords rolled back"
            );
        } else {
            warn!(
                handler = %self.id,
                restored = report.restored.len(),
                divergent = report.divergent.len(),
                "Certificate password rollback incomplete"
            );
        }
        report
    }

    fn commit(&self) -> HandlerResult<()> {
        let mut state = self.state.lock();
        if state.phase != HandlerPhase::Applied {
            return Err(HandlerError::InvalidPhase {
                handler: self.id.clone(),
                from: state.phase,
                to: HandlerPhase::Idle,
            });
        }
        state.advance(&self.id, HandlerPhase::Idle)?;
        state.log.clear();
        Ok(())
    }
}
