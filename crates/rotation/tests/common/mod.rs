//! Shared fixtures for rotation integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use rekey_rotation::error::{HandlerResult, StoreResult};
use rekey_rotation::events::RotationEvent;
use rekey_rotation::prelude::*;
use rekey_rotation::{
    EntityFactor, HandlerError, HandlerPhase, ObserverError, RollbackReport, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, Weak};
use tokio::sync::Notify;

mock! {
    pub Master {}

    #[async_trait]
    impl MasterSecretStore for Master {
        async fn current(&self) -> StoreResult<MasterSecret>;
        async fn set_current(&self, secret: MasterSecret) -> StoreResult<()>;
    }
}

/// Mock master store whose current secret is `current`
pub fn mock_master(current: &'static str) -> MockMaster {
    let mut master = MockMaster::new();
    master
        .expect_current()
        .returning(move || Ok(MasterSecret::from(current)));
    master
}

/// Cheap Argon2 parameters so tests stay fast
pub fn test_cipher() -> Arc<AesGcmCipher> {
    let config = CipherConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
    Arc::new(AesGcmCipher::new(config).unwrap())
}

/// Accounts and cipher shared by the certificate handlers of a test
pub struct Fixture {
    pub accounts: Arc<MemoryAccountDirectory>,
    pub cipher: Arc<AesGcmCipher>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            accounts: MemoryAccountDirectory::new(),
            cipher: test_cipher(),
        }
    }

    fn factor(user: &str) -> String {
        format!("credential-hash-{user}")
    }

    pub fn plaintext(user: &str) -> Vec<u8> {
        format!("keystore-password-{user}").into_bytes()
    }

    /// Registers `user` and seals their certificate password under `master`
    pub fn record(&self, project: &str, user: &str, master: &str) -> SecretRecord {
        self.accounts.insert(user, Self::factor(user));
        let encrypted = self
            .cipher
            .encrypt(
                &MasterSecret::from(master),
                &EntityFactor::from(Self::factor(user).as_str()),
                &Self::plaintext(user),
            )
            .unwrap();
        SecretRecord::new(RecordKey::new(project, user).unwrap(), encrypted)
    }

    /// Store holding one record per user, all sealed under `master`
    pub fn store(&self, project: &str, users: &[&str], master: &str) -> Arc<MemorySecretStore> {
        MemorySecretStore::with_records(users.iter().map(|u| self.record(project, u, master)))
    }

    pub fn handler(&self, id: &str) -> Arc<CertificateSecretHandler> {
        Arc::new(CertificateSecretHandler::with_id(
            HandlerId::new(id).unwrap(),
            self.accounts.clone(),
            self.cipher.clone(),
        ))
    }

    /// Decrypts `record` under `master`
    pub fn open(&self, record: &SecretRecord, master: &str) -> Option<Vec<u8>> {
        let factor = Self::factor(record.key.entity());
        self.cipher
            .decrypt(
                &MasterSecret::from(master),
                &EntityFactor::from(factor.as_str()),
                &record.encrypted_secret,
            )
            .ok()
            .map(|plaintext| plaintext.to_vec())
    }
}

/// Ordered log of handler calls shared across handlers
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Handler that records every call and optionally fails `apply`
pub struct RecordingHandler {
    id: HandlerId,
    calls: CallLog,
    fail: bool,
    phase: Mutex<HandlerPhase>,
}

impl RecordingHandler {
    pub fn new(id: &str, calls: &CallLog, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            id: HandlerId::new(id).unwrap(),
            calls: calls.clone(),
            fail,
            phase: Mutex::new(HandlerPhase::Idle),
        })
    }
}

#[async_trait]
impl RotationHandler for RecordingHandler {
    fn id(&self) -> &HandlerId {
        &self.id
    }

    fn bind_store(&self, _store: Arc<dyn SecretStore>) -> HandlerResult<()> {
        Ok(())
    }

    fn phase(&self) -> HandlerPhase {
        *self.phase.lock()
    }

    async fn apply(&self, _old: &MasterSecret, _new: &MasterSecret) -> HandlerResult<Vec<RecordKey>> {
        self.calls.lock().push(format!("apply:{}", self.id));
        if self.fail {
            *self.phase.lock() = HandlerPhase::Failed;
            return Err(HandlerError::Listing {
                source: StoreError::backend("injected listing failure"),
            });
        }
        *self.phase.lock() = HandlerPhase::Applied;
        Ok(Vec::new())
    }

    async fn rollback(&self) -> RollbackReport {
        self.calls.lock().push(format!("rollback:{}", self.id));
        *self.phase.lock() = HandlerPhase::Idle;
        RollbackReport::empty(self.id.clone())
    }

    fn commit(&self) -> HandlerResult<()> {
        self.calls.lock().push(format!("commit:{}", self.id));
        *self.phase.lock() = HandlerPhase::Idle;
        Ok(())
    }
}

/// Handler whose `apply` parks until released
pub struct GatedHandler {
    id: HandlerId,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedHandler {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: HandlerId::new(id).unwrap(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        })
    }
}

#[async_trait]
impl RotationHandler for GatedHandler {
    fn id(&self) -> &HandlerId {
        &self.id
    }

    fn bind_store(&self, _store: Arc<dyn SecretStore>) -> HandlerResult<()> {
        Ok(())
    }

    fn phase(&self) -> HandlerPhase {
        HandlerPhase::Idle
    }

    async fn apply(&self, _old: &MasterSecret, _new: &MasterSecret) -> HandlerResult<Vec<RecordKey>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn rollback(&self) -> RollbackReport {
        RollbackReport::empty(self.id.clone())
    }

    fn commit(&self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Store that starts rejecting writes to selected keys after a budget
pub struct FlakyStore {
    inner: Arc<MemorySecretStore>,
    budgets: Mutex<HashMap<RecordKey, usize>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemorySecretStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            budgets: Mutex::new(HashMap::new()),
        })
    }

    /// Allows `persists` more writes to `key`, then fails every write
    pub fn fail_after(&self, key: RecordKey, persists: usize) {
        self.budgets.lock().insert(key, persists);
    }
}

#[async_trait]
impl SecretStore for FlakyStore {
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>> {
        self.inner.list_all().await
    }

    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord> {
        self.inner.find_by_key(key).await
    }

    async fn persist(&self, record: SecretRecord) -> StoreResult<()> {
        let allowed = match self.budgets.lock().get_mut(&record.key) {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        };
        if !allowed {
            return Err(StoreError::backend("injected write failure"));
        }
        self.inner.persist(record).await
    }
}

/// Store that samples the handler's compensation log size and phase on every
/// write
pub struct SamplingStore {
    inner: Arc<MemorySecretStore>,
    handler: OnceLock<Weak<CertificateSecretHandler>>,
    pub observed: Mutex<Vec<usize>>,
    pub phases: Mutex<Vec<HandlerPhase>>,
}

impl SamplingStore {
    pub fn new(inner: Arc<MemorySecretStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            handler: OnceLock::new(),
            observed: Mutex::new(Vec::new()),
            phases: Mutex::new(Vec::new()),
        })
    }

    pub fn watch(&self, handler: &Arc<CertificateSecretHandler>) {
        let _ = self.handler.set(Arc::downgrade(handler));
    }
}

#[async_trait]
impl SecretStore for SamplingStore {
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>> {
        self.inner.list_all().await
    }

    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord> {
        self.inner.find_by_key(key).await
    }

    async fn persist(&self, record: SecretRecord) -> StoreResult<()> {
        if let Some(handler) = self.handler.get().and_then(Weak::upgrade) {
            self.observed.lock().push(handler.pending_compensations());
            self.phases.lock().push(handler.phase());
        }
        self.inner.persist(record).await
    }
}

/// Store whose `nth` write (1-based) never completes; later writes succeed
pub struct StallingStore {
    inner: Arc<MemorySecretStore>,
    nth: usize,
    writes: AtomicUsize,
}

impl StallingStore {
    pub fn new(inner: Arc<MemorySecretStore>, nth: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            nth,
            writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SecretStore for StallingStore {
    async fn list_all(&self) -> StoreResult<Vec<SecretRecord>> {
        self.inner.list_all().await
    }

    async fn find_by_key(&self, key: &RecordKey) -> StoreResult<SecretRecord> {
        self.inner.find_by_key(key).await
    }

    async fn persist(&self, record: SecretRecord) -> StoreResult<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            std::future::pending::<()>().await;
        }
        self.inner.persist(record).await
    }
}

/// Master store that switches the secret but never acknowledges the switch
pub struct StallingMaster {
    pub inner: Arc<MemoryMasterSecretStore>,
}

#[async_trait]
impl MasterSecretStore for StallingMaster {
    async fn current(&self) -> StoreResult<MasterSecret> {
        self.inner.current().await
    }

    async fn set_current(&self, secret: MasterSecret) -> StoreResult<()> {
        self.inner.set_current(secret).await?;
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Observer that keeps every event
#[derive(Default)]
pub struct CollectingObserver {
    pub events: Mutex<Vec<RotationEvent>>,
}

impl CollectingObserver {
    /// Serde tag of every event in order
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| {
                serde_json::to_value(event).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }
}

#[async_trait]
impl RotationObserver for CollectingObserver {
    async fn on_event(&self, event: &RotationEvent) -> Result<(), ObserverError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Observer that always fails delivery
pub struct FailingObserver;

#[async_trait]
impl RotationObserver for FailingObserver {
    async fn on_event(&self, _event: &RotationEvent) -> Result<(), ObserverError> {
        Err(ObserverError::Delivery {
            reason: "pager unreachable".to_string(),
        })
    }
}
