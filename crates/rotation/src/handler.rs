//! Rotation handler contract
//!
//! A handler owns one class of secrets (one [`SecretStore`]) and knows how to
//! move every record it owns from the old master secret to the new one, and
//! how to undo that move from its own compensation log.
//!
//! # Phases
//!
//! ```text
//! Idle ──apply──> Applying ──ok──> Applied ──commit──> Idle
//!                    │                │
//!                    └──err──> Failed │
//!                                │    │
//!                        rollback▼    ▼rollback
//!                             RolledBack ──done──> Idle
//! ```
//!
//! A dropped `apply` future lands in `Failed` and a dropped `rollback` stays
//! in `RolledBack`; either way the captured entries survive until a later
//! `rollback` replays them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerResult;
use crate::key::{HandlerId, RecordKey};
use crate::secret::{EncryptedSecret, MasterSecret};
use crate::store::SecretStore;

/// Participant in a master secret rotation
///
/// The coordinator drives every method; handlers never call each other.
#[async_trait]
pub trait RotationHandler: Send + Sync {
    /// Identity used for registration, reports, and logs
    fn id(&self) -> &HandlerId;

    /// Attaches the store this handler rotates
    ///
    /// Must be called exactly once before the first rotation. A second call
    /// fails with [`HandlerError::AlreadyBound`](crate::error::HandlerError::AlreadyBound).
    fn bind_store(&self, store: Arc<dyn SecretStore>) -> HandlerResult<()>;

    /// Current phase of the per-attempt state machine
    fn phase(&self) -> HandlerPhase;

    /// Re-encrypts every owned record from `old` to `new`
    ///
    /// Each record's prior value is captured in the compensation log before
    /// the new value is persisted. On the first failing record the call stops;
    /// records persisted earlier stay persisted and remain covered by the log.
    /// Returns the keys of every updated record.
    async fn apply(&self, old: &MasterSecret, new: &MasterSecret) -> HandlerResult<Vec<RecordKey>>;

    /// Restores every captured record and clears the compensation log
    ///
    /// Best-effort: a record that cannot be restored is reported as divergent
    /// and the remaining records are still restored.
    async fn rollback(&self) -> RollbackReport;

    /// Finalizes a successful attempt: clears the log, `Applied → Idle`
    fn commit(&self) -> HandlerResult<()>;
}

/// Per-attempt handler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerPhase {
    /// No attempt in flight
    #[default]
    Idle,

    /// `apply` is running
    Applying,

    /// `apply` succeeded; waiting for commit or rollback
    Applied,

    /// `apply` failed; waiting for rollback
    Failed,

    /// `rollback` is restoring captured entries; `Idle` once every entry was
    /// attempted
    RolledBack,
}

impl HandlerPhase {
    /// Whether the state machine allows `self → next`
    pub fn can_transition_to(self, next: HandlerPhase) -> bool {
        use HandlerPhase::*;
        matches!(
            (self, next),
            (Idle, Applying)
                | (Applying, Applied | Failed)
                | (Applied | Failed, RolledBack)
                | (Applied | RolledBack, Idle)
        )
    }

    /// Whether rollback has anything to do from this phase
    ///
    /// `RolledBack` counts: a handler still there was interrupted mid-rollback.
    pub fn needs_compensation(self) -> bool {
        matches!(
            self,
            HandlerPhase::Applied | HandlerPhase::Failed | HandlerPhase::RolledBack
        )
    }

    /// Whether no attempt left state behind
    pub fn is_settled(self) -> bool {
        self == HandlerPhase::Idle
    }
}

impl fmt::Display for HandlerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerPhase::Idle => "idle",
            HandlerPhase::Applying => "applying",
            HandlerPhase::Applied => "applied",
            HandlerPhase::Failed => "failed",
            HandlerPhase::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Record that rollback could not restore
///
/// Carries the captured prior ciphertext so an operator can restore it by
/// hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergentRecord {
    /// Record left in an unknown state
    pub key: RecordKey,

    /// Ciphertext the record held before the attempt
    pub prior: EncryptedSecret,

    /// Why restoration failed
    pub reason: String,
}

/// Outcome of one handler's rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Handler that rolled back
    pub handler: HandlerId,

    /// Records restored to their prior value
    pub restored: Vec<RecordKey>,

    /// Records that could not be restored
    pub divergent: Vec<DivergentRecord>,
}

impl RollbackReport {
    /// Empty report for a handler with nothing to compensate
    pub fn empty(handler: HandlerId) -> Self {
        Self {
            handler,
            restored: Vec::new(),
            divergent: Vec::new(),
        }
    }

    /// Whether every captured record was restored
    pub fn is_complete(&self) -> bool {
        self.divergent.is_empty()
    }
}
