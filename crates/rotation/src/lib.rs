//! Rekey Rotation - Master encryption secret rotation
//!
//! Rotates the system-wide master secret across every participant that
//! stores secrets encrypted under it. Participants cannot share a
//! transaction, so the rotation is a saga: every handler re-encrypts its
//! records in turn, and on the first failure the failing handler and every
//! handler that already applied undo their changes from a compensation log,
//! in reverse order.
//!
//! # Features
//!
//! - **All-or-nothing rotation** - the master secret switches only after every
//!   handler applied
//! - **Reverse-order compensation** - best-effort rollback with a report of
//!   any record that could not be restored
//! - **Pluggable collaborators** - stores, account lookup, cipher and observers
//!   are traits; in-memory implementations are included
//! - **Secret hygiene** - master secrets and factors zeroize on drop and never
//!   print
//!
//! # Example
//!
//! ```rust,ignore
//! use rekey_rotation::prelude::*;
//!
//! let handler = Arc::new(CertificateSecretHandler::new(accounts, cipher));
//! let coordinator = RotationCoordinator::builder(master_store)
//!     .handler_with_store(handler, cert_store)
//!     .observer(Arc::new(TracingObserver))
//!     .build()?;
//!
//! let report = coordinator.rotate(&old, &new).await?;
//! println!("rotated {} records", report.records_updated());
//! ```
#![forbid(unsafe_code)]

/// Attempt identity, phases, and reports
pub mod attempt;
/// Certificate keystore password handler
pub mod certificate;
/// Record cipher abstraction and the default AES-GCM cipher
pub mod cipher;
/// Per-attempt compensation log
pub mod compensation;
/// Coordinator configuration
pub mod config;
/// Rotation coordinator and builder
pub mod coordinator;
/// Error types
pub mod error;
/// Lifecycle events and observers
pub mod events;
/// Rotation handler contract
pub mod handler;
/// Persistent divergence journal
pub mod journal;
/// Record keys and handler ids
pub mod key;
/// In-memory collaborators
pub mod memory;
/// Secret material types
pub mod secret;
/// Collaborator traits
pub mod store;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use crate::attempt::{AttemptId, AttemptPhase, HandlerReport, RotationReport};
pub use crate::certificate::{CERTIFICATE_HANDLER_ID, CertificateSecretHandler};
pub use crate::cipher::{AesGcmCipher, CipherConfig, SecretCipher};
pub use crate::config::CoordinatorConfig;
pub use crate::coordinator::{Recovery, RotationCoordinator, RotationCoordinatorBuilder};
pub use crate::error::{
    CipherError, FailureCause, HandlerError, InvalidSecretReason, LookupError, ObserverError,
    RotationError, RotationFailure, RotationResult, StoreError, ValidationError,
};
pub use crate::events::{RotationEvent, RotationObserver, TracingObserver};
pub use crate::handler::{DivergentRecord, HandlerPhase, RollbackReport, RotationHandler};
pub use crate::journal::{DivergenceJournal, JournalEntry};
pub use crate::key::{HandlerId, RecordKey};
pub use crate::secret::{EncryptedSecret, EntityFactor, MasterSecret};
pub use crate::store::{AccountCredentialLookup, MasterSecretStore, SecretRecord, SecretStore};

/// Commonly used types and traits
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::attempt::RotationReport;
    pub use crate::certificate::CertificateSecretHandler;
    pub use crate::cipher::{AesGcmCipher, CipherConfig, SecretCipher};
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::{Recovery, RotationCoordinator};
    pub use crate::error::{RotationError, RotationResult};
    pub use crate::events::{RotationObserver, TracingObserver};
    pub use crate::handler::RotationHandler;
    pub use crate::journal::DivergenceJournal;
    pub use crate::key::{HandlerId, RecordKey};
    pub use crate::memory::{MemoryAccountDirectory, MemoryMasterSecretStore, MemorySecretStore};
    pub use crate::secret::{EncryptedSecret, MasterSecret};
    pub use crate::store::{AccountCredentialLookup, MasterSecretStore, SecretRecord, SecretStore};
}
