//! Rotation error types
//!
//! Record-level failures ([`LookupError`], [`CipherError`], [`StoreError`]) are
//! folded into a [`HandlerError`] by the handler that hit them. The
//! coordinator turns a failed handler into a [`RotationError`] once rollback
//! has finished.

use std::fmt;
use thiserror::Error;

use crate::attempt::{AttemptId, AttemptPhase};
use crate::handler::{DivergentRecord, HandlerPhase, RollbackReport};
use crate::key::{HandlerId, RecordKey};

/// Identifier validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A record key part was empty
    #[error("record key {part} must not be empty")]
    EmptyKeyPart { part: &'static str },

    /// A record key part failed validation
    #[error("invalid record key {part} '{value}': {reason}")]
    InvalidKeyPart {
        part: &'static str,
        value: String,
        reason: String,
    },

    /// A rendered key had no delimiter
    #[error("malformed record key '{value}': expected 'domain__entity'")]
    MalformedKey { value: String },

    /// Handler id was empty
    #[error("handler id must not be empty")]
    EmptyHandlerId,

    /// Handler id failed validation
    #[error("invalid handler id '{id}': {reason}")]
    InvalidHandlerId { id: String, reason: String },
}

/// Errors raised by [`SecretStore`](crate::store::SecretStore) and
/// [`MasterSecretStore`](crate::store::MasterSecretStore) implementations
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under the key
    #[error("record not found: {key}")]
    NotFound { key: RecordKey },

    /// Backend-specific failure
    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    /// Filesystem failure
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Backend failure with a reason
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Errors raised by [`AccountCredentialLookup`](crate::store::AccountCredentialLookup)
#[derive(Debug, Error)]
pub enum LookupError {
    /// The owning account does not exist
    #[error("no account found for entity '{entity}'")]
    EntityNotFound { entity: String },

    /// The directory could not be queried
    #[error("account lookup failed: {reason}")]
    Backend { reason: String },
}

/// Errors raised by [`SecretCipher`](crate::cipher::SecretCipher) implementations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Key derivation rejected its inputs or parameters
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Authentication failed; wrong master secret, wrong factor, or tampering
    #[error("decryption failed")]
    Decryption,

    /// Sealing failed
    #[error("encryption failed")]
    Encryption,

    /// Ciphertext does not have the expected layout
    #[error("malformed ciphertext: {reason}")]
    Malformed { reason: String },
}

/// Failure of a single handler operation
#[derive(Debug, Error)]
pub enum HandlerError {
    /// `bind_store` was called a second time
    #[error("handler {handler} already has a bound store")]
    AlreadyBound { handler: HandlerId },

    /// `apply` was called before `bind_store`
    #[error("handler {handler} has no bound store")]
    NotBound { handler: HandlerId },

    /// The handler state machine refused the transition
    #[error("handler {handler} cannot move from {from} to {to}")]
    InvalidPhase {
        handler: HandlerId,
        from: HandlerPhase,
        to: HandlerPhase,
    },

    /// The entity-specific factor for a record could not be obtained
    #[error("could not resolve the owning account of record {key}")]
    EntityNotFound {
        key: RecordKey,
        #[source]
        source: LookupError,
    },

    /// The record did not decrypt under the old master secret
    #[error("could not decrypt record {key} under the old master secret")]
    Decryption {
        key: RecordKey,
        #[source]
        source: CipherError,
    },

    /// The record could not be sealed under the new master secret
    #[error("could not re-encrypt record {key} under the new master secret")]
    Encryption {
        key: RecordKey,
        #[source]
        source: CipherError,
    },

    /// The blocking re-encryption task panicked or was cancelled
    #[error("re-encryption of record {key} did not complete: {reason}")]
    Worker { key: RecordKey, reason: String },

    /// Enumerating the handler's records failed
    #[error("could not list records")]
    Listing {
        #[source]
        source: StoreError,
    },

    /// Persisting a record failed
    #[error("could not persist record {key}")]
    Store {
        key: RecordKey,
        #[source]
        source: StoreError,
    },
}

impl HandlerError {
    /// Whether the handler refused to start, so it captured nothing
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::NotBound { .. }
                | Self::InvalidPhase {
                    to: HandlerPhase::Applying,
                    ..
                }
        )
    }
}

/// Why a rotation request was rejected before any mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSecretReason {
    /// The old secret was empty
    EmptyOld,
    /// The new secret was empty
    EmptyNew,
    /// Old and new secrets are identical
    Unchanged,
    /// The old secret is not the current master secret
    Mismatch,
}

impl fmt::Display for InvalidSecretReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::EmptyOld => "old master secret is empty",
            Self::EmptyNew => "new master secret is empty",
            Self::Unchanged => "new master secret equals the old one",
            Self::Mismatch => "old master secret does not match the current master secret",
        };
        f.write_str(reason)
    }
}

/// What made a rotation attempt fail
#[derive(Debug)]
pub enum FailureCause {
    /// A handler's `apply` failed
    Handler {
        handler: HandlerId,
        error: HandlerError,
    },

    /// All handlers applied but switching the master secret failed
    MasterSecretCommit { error: StoreError },
}

impl FailureCause {
    /// Handler that failed, if the failure came from a handler
    pub fn handler(&self) -> Option<&HandlerId> {
        match self {
            Self::Handler { handler, .. } => Some(handler),
            Self::MasterSecretCommit { .. } => None,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler { handler, error } => write!(f, "handler {handler} failed: {error}"),
            Self::MasterSecretCommit { error } => {
                write!(f, "switching the current master secret failed: {error}")
            }
        }
    }
}

/// Aggregate failure of a rotation attempt, produced after rollback finished
#[derive(Debug)]
pub struct RotationFailure {
    /// Attempt that failed
    pub attempt_id: AttemptId,

    /// Phase the attempt was in when it failed
    pub failed_during: AttemptPhase,

    /// Failing participant and underlying error
    pub cause: FailureCause,

    /// Rollback reports in the order rollback was invoked
    pub rollback: Vec<RollbackReport>,

    /// Observer errors for divergence alerts that did not reach their sink
    pub undelivered_alerts: Vec<String>,
}

impl RotationFailure {
    /// Whether every compensation entry was restored
    pub fn is_fully_rolled_back(&self) -> bool {
        self.rollback.iter().all(RollbackReport::is_complete)
    }

    /// Records left in a known-divergent state, with their handler
    pub fn divergent(&self) -> impl Iterator<Item = (&HandlerId, &DivergentRecord)> {
        self.rollback
            .iter()
            .flat_map(|report| report.divergent.iter().map(move |d| (&report.handler, d)))
    }

    /// Handlers in the order they were rolled back
    pub fn rollback_order(&self) -> Vec<&HandlerId> {
        self.rollback.iter().map(|report| &report.handler).collect()
    }
}

impl fmt::Display for RotationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rotation attempt {} aborted while {}: {}",
            self.attempt_id, self.failed_during, self.cause
        )?;
        let divergent = self.divergent().count();
        if divergent == 0 {
            write!(f, "; rollback restored all records")?;
        } else {
            write!(
                f,
                "; rollback left {divergent} record(s) divergent, manual remediation required"
            )?;
        }
        if !self.undelivered_alerts.is_empty() {
            write!(
                f,
                "; {} divergence alert(s) were not delivered",
                self.undelivered_alerts.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RotationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            FailureCause::Handler { error, .. } => Some(error),
            FailureCause::MasterSecretCommit { error } => Some(error),
        }
    }
}

/// Errors surfaced by [`RotationCoordinator`](crate::coordinator::RotationCoordinator)
#[derive(Debug, Error)]
pub enum RotationError {
    /// Malformed request, rejected before any mutation
    #[error("invalid rotation request: {reason}")]
    InvalidSecret { reason: InvalidSecretReason },

    /// Another attempt holds the rotation guard
    #[error("a master secret rotation is already in progress")]
    RotationInProgress,

    /// A handler still holds state from an interrupted attempt
    ///
    /// Run [`RotationCoordinator::recover`](crate::coordinator::RotationCoordinator::recover)
    /// before rotating again.
    #[error("handler {handler} is {phase} from an interrupted attempt; recover before rotating")]
    HandlerNotSettled {
        handler: HandlerId,
        phase: HandlerPhase,
    },

    /// Handler identity registered twice
    #[error("handler {handler} is already registered")]
    DuplicateHandler { handler: HandlerId },

    /// Binding a store to a handler failed during setup
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The current master secret could not be read; nothing was mutated
    #[error("could not read the current master secret: {0}")]
    MasterSecretUnavailable(#[source] StoreError),

    /// The attempt failed and rollback restored every record
    #[error(transparent)]
    Failed(Box<RotationFailure>),

    /// The attempt failed and rollback left known-divergent records
    #[error(transparent)]
    RollbackPartialFailure(Box<RotationFailure>),
}

impl RotationError {
    /// Whether an automatic retry is safe
    ///
    /// Everything else needs an operator to inspect the stores first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidSecret { .. } | Self::RotationInProgress)
    }

    /// Failure details for aborted attempts
    pub fn failure(&self) -> Option<&RotationFailure> {
        match self {
            Self::Failed(failure) | Self::RollbackPartialFailure(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Errors raised by [`RotationObserver`](crate::events::RotationObserver)
/// implementations
///
/// Observer failures are logged by the coordinator and never change the
/// outcome of an attempt.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Writing the event sink failed
    #[error("observer I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding the event failed
    #[error("observer serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other delivery failure
    #[error("observer delivery failed: {reason}")]
    Delivery { reason: String },
}

/// Result type for rotation operations
pub type RotationResult<T> = Result<T, RotationError>;

/// Result type for handler operations
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
