//! Rotation lifecycle events
//!
//! The coordinator emits a [`RotationEvent`] at every step of an attempt.
//! Observers turn them into logs, alerts, or the persistent
//! [`DivergenceJournal`](crate::journal::DivergenceJournal).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::attempt::AttemptId;
use crate::error::ObserverError;
use crate::handler::DivergentRecord;
use crate::key::HandlerId;

/// Divergence data (boxed to reduce enum size)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceData {
    /// Attempt whose rollback diverged
    pub attempt_id: AttemptId,

    /// Handler that could not restore its records
    pub handler: HandlerId,

    /// Records left in a known-divergent state
    pub records: Vec<DivergentRecord>,

    /// When rollback of the handler finished
    pub detected_at: DateTime<Utc>,
}

/// Notification event for the rotation lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotationEvent {
    /// An attempt passed validation and acquired the guard
    AttemptStarted {
        attempt_id: AttemptId,
        handlers: Vec<HandlerId>,
        started_at: DateTime<Utc>,
    },

    /// A handler re-encrypted all of its records
    HandlerApplied {
        attempt_id: AttemptId,
        handler: HandlerId,
        records: usize,
        applied_at: DateTime<Utc>,
    },

    /// A handler's `apply` failed; rollback follows
    HandlerFailed {
        attempt_id: AttemptId,
        handler: HandlerId,
        error: String,
        failed_at: DateTime<Utc>,
    },

    /// Every handler applied but switching the master secret failed
    MasterSecretCommitFailed {
        attempt_id: AttemptId,
        error: String,
        failed_at: DateTime<Utc>,
    },

    /// A handler restored every captured record
    HandlerRolledBack {
        attempt_id: AttemptId,
        handler: HandlerId,
        restored: usize,
        rolled_back_at: DateTime<Utc>,
    },

    /// A handler's rollback left records divergent
    RollbackDiverged(Box<DivergenceData>),

    /// The new master secret is current and every handler committed
    AttemptCommitted {
        attempt_id: AttemptId,
        records: usize,
        committed_at: DateTime<Utc>,
    },

    /// Rollback finished for a failed attempt
    AttemptAborted {
        attempt_id: AttemptId,
        fully_rolled_back: bool,
        aborted_at: DateTime<Utc>,
    },
}

impl RotationEvent {
    /// Get the attempt ID associated with this event
    pub fn attempt_id(&self) -> AttemptId {
        match self {
            RotationEvent::AttemptStarted { attempt_id, .. }
            | RotationEvent::HandlerApplied { attempt_id, .. }
            | RotationEvent::HandlerFailed { attempt_id, .. }
            | RotationEvent::MasterSecretCommitFailed { attempt_id, .. }
            | RotationEvent::HandlerRolledBack { attempt_id, .. }
            | RotationEvent::AttemptCommitted { attempt_id, .. }
            | RotationEvent::AttemptAborted { attempt_id, .. } => *attempt_id,
            RotationEvent::RollbackDiverged(data) => data.attempt_id,
        }
    }

    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RotationEvent::AttemptStarted { started_at, .. } => *started_at,
            RotationEvent::HandlerApplied { applied_at, .. } => *applied_at,
            RotationEvent::HandlerFailed { failed_at, .. } => *failed_at,
            RotationEvent::MasterSecretCommitFailed { failed_at, .. } => *failed_at,
            RotationEvent::HandlerRolledBack { rolled_back_at, .. } => *rolled_back_at,
            RotationEvent::RollbackDiverged(data) => data.detected_at,
            RotationEvent::AttemptCommitted { committed_at, .. } => *committed_at,
            RotationEvent::AttemptAborted { aborted_at, .. } => *aborted_at,
        }
    }

    /// Whether the event needs an operator's attention
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            RotationEvent::RollbackDiverged(_)
                | RotationEvent::AttemptAborted {
                    fully_rolled_back: false,
                    ..
                }
        )
    }

    /// Get a human-readable event description
    pub fn description(&self) -> String {
        match self {
            RotationEvent::AttemptStarted {
                attempt_id,
                handlers,
                ..
            } => format!(
                "Rotation attempt {attempt_id} started with {} handler(s)",
                handlers.len()
            ),
            RotationEvent::HandlerApplied {
                handler, records, ..
            } => format!("Handler {handler} re-encrypted {records} record(s)"),
            RotationEvent::HandlerFailed { handler, error, .. } => {
                format!("Handler {handler} failed: {error}")
            }
            RotationEvent::MasterSecretCommitFailed { error, .. } => {
                format!("Switching the master secret failed: {error}")
            }
            RotationEvent::HandlerRolledBack {
                handler, restored, ..
            } => format!("Handler {handler} restored {restored} record(s)"),
            RotationEvent::RollbackDiverged(data) => {
                let keys = data
                    .records
                    .iter()
                    .map(|r| r.key.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "DIVERGED: handler {} could not restore {} record(s): {keys}",
                    data.handler,
                    data.records.len()
                )
            }
            RotationEvent::AttemptCommitted {
                attempt_id,
                records,
                ..
            } => format!("Rotation attempt {attempt_id} committed, {records} record(s) rotated"),
            RotationEvent::AttemptAborted {
                attempt_id,
                fully_rolled_back,
                ..
            } => {
                if *fully_rolled_back {
                    format!("Rotation attempt {attempt_id} aborted, all records restored")
                } else {
                    format!(
                        "Rotation attempt {attempt_id} aborted with divergent records, manual remediation required"
                    )
                }
            }
        }
    }
}

/// Receiver of rotation lifecycle events
///
/// Implement this trait to forward events to a log, a pager, or a journal.
/// Events are delivered in order on the rotating task.
///
/// # Example
///
/// ```rust,ignore
/// struct Pager { client: PagerClient }
///
/// #[async_trait]
/// impl RotationObserver for Pager {
///     async fn on_event(&self, event: &RotationEvent) -> Result<(), ObserverError> {
///         if event.is_alert() {
///             self.client.page(event.description()).await.map_err(|e| {
///                 ObserverError::Delivery { reason: e.to_string() }
///             })?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RotationObserver: Send + Sync {
    /// Handle one event
    async fn on_event(&self, event: &RotationEvent) -> Result<(), ObserverError>;
}

/// Observer that writes every event as a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl RotationObserver for TracingObserver {
    async fn on_event(&self, event: &RotationEvent) -> Result<(), ObserverError> {
        let attempt_id = event.attempt_id();
        match event {
            RotationEvent::RollbackDiverged(data) => {
                for record in &data.records {
                    error!(
                        attempt_id = %attempt_id,
                        handler = %data.handler,
                        record = %record.key,
                        reason = %record.reason,
                        "Record left divergent after rollback"
                    );
                }
            }
            RotationEvent::HandlerFailed { .. }
            | RotationEvent::MasterSecretCommitFailed { .. }
            | RotationEvent::HandlerRolledBack { .. } => {
                warn!(attempt_id = %attempt_id, "{}", event.description());
            }
            RotationEvent::AttemptAborted {
                fully_rolled_back: false,
                ..
            } => {
                error!(attempt_id = %attempt_id, "{}", event.description());
            }
            _ => {
                info!(attempt_id = %attempt_id, "{}", event.description());
            }
        }
        Ok(())
    }
}
