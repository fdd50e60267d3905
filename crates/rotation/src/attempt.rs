//! Rotation attempt bookkeeping
//!
//! A [`RotationAttempt`] lives for the duration of one `rotate` call. It
//! records which handlers have applied so far and which phase the attempt is
//! in, and becomes a [`RotationReport`] when the attempt commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::key::{HandlerId, RecordKey};

/// Unique identifier for a rotation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Generate a new attempt ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AttemptId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Phase of a rotation attempt
///
/// ```text
/// Applying ──> Committing ──> Committed
///    │             │
///    └──> Compensating <──┘
///              │
///           Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Handlers are applying in registration order
    Applying,

    /// Every handler applied; switching the master secret
    Committing,

    /// Master secret switched and handlers committed
    Committed,

    /// Rolling back after a failure
    Compensating,

    /// Rollback finished
    Aborted,
}

impl AttemptPhase {
    /// Whether `self → next` is a legal step
    pub fn can_transition_to(self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Applying, Committing | Compensating)
                | (Committing, Committed | Compensating)
                | (Compensating, Aborted)
        )
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptPhase::Applying => "applying",
            AttemptPhase::Committing => "committing",
            AttemptPhase::Committed => "committed",
            AttemptPhase::Compensating => "compensating",
            AttemptPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// In-flight rotation attempt
#[derive(Debug, Clone)]
pub struct RotationAttempt {
    id: AttemptId,
    started_at: DateTime<Utc>,
    phase: AttemptPhase,
    applied: Vec<HandlerReport>,
}

impl RotationAttempt {
    /// Starts a new attempt in [`AttemptPhase::Applying`]
    pub fn start() -> Self {
        Self {
            id: AttemptId::new(),
            started_at: Utc::now(),
            phase: AttemptPhase::Applying,
            applied: Vec::new(),
        }
    }

    /// Attempt identifier
    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// When the attempt started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current phase
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Handlers whose `apply` succeeded, in application order
    pub fn applied(&self) -> impl DoubleEndedIterator<Item = &HandlerId> {
        self.applied.iter().map(|report| &report.handler)
    }

    /// Records a successful `apply`
    pub fn record_applied(&mut self, handler: HandlerId, updated: Vec<RecordKey>) {
        debug_assert_eq!(self.phase, AttemptPhase::Applying);
        self.applied.push(HandlerReport { handler, updated });
    }

    /// Moves to `next`
    ///
    /// The coordinator only takes legal steps; an illegal one is a bug.
    pub fn enter(&mut self, next: AttemptPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "attempt cannot move from {} to {next}",
            self.phase
        );
        self.phase = next;
    }

    /// Turns a committed attempt into its report
    pub fn into_report(self) -> RotationReport {
        RotationReport {
            attempt_id: self.id,
            started_at: self.started_at,
            completed_at: Utc::now(),
            handlers: self.applied,
        }
    }
}

/// Records one handler moved to the new master secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerReport {
    /// Handler that applied
    pub handler: HandlerId,

    /// Keys of the re-encrypted records
    pub updated: Vec<RecordKey>,
}

/// Outcome of a committed rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationReport {
    /// Attempt that committed
    pub attempt_id: AttemptId,

    /// When the attempt started
    pub started_at: DateTime<Utc>,

    /// When the attempt committed
    pub completed_at: DateTime<Utc>,

    /// Per-handler outcome in registration order
    pub handlers: Vec<HandlerReport>,
}

impl RotationReport {
    /// Total number of re-encrypted records
    pub fn records_updated(&self) -> usize {
        self.handlers.iter().map(|h| h.updated.len()).sum()
    }

    /// Wall-clock duration of the attempt
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    /// Report for one handler
    pub fn handler(&self, id: &HandlerId) -> Option<&HandlerReport> {
        self.handlers.iter().find(|h| &h.handler == id)
    }
}
