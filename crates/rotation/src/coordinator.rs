//! Rotation coordinator
//!
//! Drives a master secret rotation across every registered handler:
//!
//! 1. validate the request and take the rotation guard
//! 2. `apply` each handler in registration order
//! 3. on the first failure, `rollback` the failing handler and then every
//!    handler that already applied, in reverse registration order
//! 4. when all handlers applied, switch the current master secret exactly once
//!    and `commit` every handler
//!
//! The coordinator never touches records itself; it only sequences handlers
//! and owns the master secret lifecycle.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::attempt::{AttemptId, AttemptPhase, RotationAttempt, RotationReport};
use crate::config::CoordinatorConfig;
use crate::error::{FailureCause, InvalidSecretReason, RotationError, RotationFailure, RotationResult};
use crate::error::ObserverError;
use crate::events::{DivergenceData, RotationEvent, RotationObserver};
use crate::handler::{HandlerPhase, RollbackReport, RotationHandler};
use crate::key::HandlerId;
use crate::secret::MasterSecret;
use crate::store::{MasterSecretStore, SecretStore};

/// Registry of rotation handlers and driver of rotation attempts
///
/// Build one at process start and share it by `Arc`. Only one attempt runs
/// at a time; a concurrent [`rotate`](Self::rotate) fails immediately with
/// [`RotationError::RotationInProgress`].
pub struct RotationCoordinator {
    handlers: Vec<Arc<dyn RotationHandler>>,
    master: Arc<dyn MasterSecretStore>,
    observers: Vec<Arc<dyn RotationObserver>>,
    config: CoordinatorConfig,
    guard: Mutex<()>,
}

impl RotationCoordinator {
    /// Coordinator with no handlers and the default configuration
    pub fn new(master: Arc<dyn MasterSecretStore>) -> Self {
        Self {
            handlers: Vec::new(),
            master,
            observers: Vec::new(),
            config: CoordinatorConfig::default(),
            guard: Mutex::new(()),
        }
    }

    /// Builder for assembling a coordinator at startup
    pub fn builder(master: Arc<dyn MasterSecretStore>) -> RotationCoordinatorBuilder {
        RotationCoordinatorBuilder::new(master)
    }

    /// Appends `handler` to the registry
    ///
    /// # Errors
    ///
    /// [`RotationError::DuplicateHandler`] when a handler with the same id is
    /// already registered.
    pub fn register(&mut self, handler: Arc<dyn RotationHandler>) -> RotationResult<()> {
        if self.handlers.iter().any(|h| h.id() == handler.id()) {
            return Err(RotationError::DuplicateHandler {
                handler: handler.id().clone(),
            });
        }
        debug!(handler = %handler.id(), position = self.handlers.len(), "Registered rotation handler");
        self.handlers.push(handler);
        Ok(())
    }

    /// Adds an event observer
    pub fn add_observer(&mut self, observer: Arc<dyn RotationObserver>) {
        self.observers.push(observer);
    }

    /// Registered handler ids in registration order
    pub fn handler_ids(&self) -> impl Iterator<Item = &HandlerId> {
        self.handlers.iter().map(|h| h.id())
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Whether an attempt currently holds the rotation guard
    pub fn is_rotating(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// Rotates the master secret from `old` to `new`
    ///
    /// # Errors
    ///
    /// - [`RotationError::InvalidSecret`] for an empty or unchanged secret, or
    ///   (with `verify_current`) an `old` that is not the current secret
    /// - [`RotationError::RotationInProgress`] when another attempt is running
    /// - [`RotationError::HandlerNotSettled`] when an interrupted attempt left
    ///   a handler unsettled; see [`recover`](Self::recover)
    /// - [`RotationError::MasterSecretUnavailable`] when the current secret
    ///   cannot be read
    /// - [`RotationError::Failed`] when the attempt failed and every record was
    ///   restored
    /// - [`RotationError::RollbackPartialFailure`] when rollback left records
    ///   divergent
    ///
    /// Nothing is mutated before the first handler's `apply`.
    pub async fn rotate(&self, old: &MasterSecret, new: &MasterSecret) -> RotationResult<RotationReport> {
        validate_request(old, new)?;

        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| RotationError::RotationInProgress)?;

        if let Some(handler) = self.handlers.iter().find(|h| !h.phase().is_settled()) {
            return Err(RotationError::HandlerNotSettled {
                handler: handler.id().clone(),
                phase: handler.phase(),
            });
        }

        if self.config.verify_current {
            let current = self
                .master
                .current()
                .await
                .map_err(RotationError::MasterSecretUnavailable)?;
            if current != *old {
                return Err(RotationError::InvalidSecret {
                    reason: InvalidSecretReason::Mismatch,
                });
            }
        }

        let mut attempt = RotationAttempt::start();
        let attempt_id = attempt.id();
        info!(
            attempt_id = %attempt_id,
            handlers = self.handlers.len(),
            "Starting master secret rotation"
        );
        self.emit(RotationEvent::AttemptStarted {
            attempt_id,
            handlers: self.handler_ids().cloned().collect(),
            started_at: attempt.started_at(),
        })
        .await;

        for handler in &self.handlers {
            match handler.apply(old, new).await {
                Ok(updated) => {
                    self.emit(RotationEvent::HandlerApplied {
                        attempt_id,
                        handler: handler.id().clone(),
                        records: updated.len(),
                        applied_at: Utc::now(),
                    })
                    .await;
                    attempt.record_applied(handler.id().clone(), updated);
                }
                Err(error) => {
                    error!(
                        attempt_id = %attempt_id,
                        handler = %handler.id(),
                        error = %error,
                        "Handler failed to apply, compensating"
                    );
                    self.emit(RotationEvent::HandlerFailed {
                        attempt_id,
                        handler: handler.id().clone(),
                        error: error.to_string(),
                        failed_at: Utc::now(),
                    })
                    .await;

                    let failed_during = attempt.phase();
                    attempt.enter(AttemptPhase::Compensating);
                    // A handler that refused to start captured nothing
                    let failing = (!error.is_refusal()).then_some(handler);
                    let order: Vec<_> = failing
                        .into_iter()
                        .chain(self.applied_handlers(&attempt).rev())
                        .collect();
                    let compensation = self.roll_back(attempt_id, order).await;
                    let cause = FailureCause::Handler {
                        handler: handler.id().clone(),
                        error,
                    };
                    return Err(self.abort(attempt, failed_during, cause, compensation).await);
                }
            }
        }

        attempt.enter(AttemptPhase::Committing);
        if let Err(error) = self.master.set_current(new.clone()).await {
            error!(
                attempt_id = %attempt_id,
                error = %error,
                "Switching the master secret failed, compensating every handler"
            );
            self.emit(RotationEvent::MasterSecretCommitFailed {
                attempt_id,
                error: error.to_string(),
                failed_at: Utc::now(),
            })
            .await;

            let failed_during = attempt.phase();
            attempt.enter(AttemptPhase::Compensating);
            let order: Vec<_> = self.applied_handlers(&attempt).rev().collect();
            let compensation = self.roll_back(attempt_id, order).await;
            let cause = FailureCause::MasterSecretCommit { error };
            return Err(self.abort(attempt, failed_during, cause, compensation).await);
        }

        // The new secret is current; a handler that cannot clear its log no
        // longer affects the outcome.
        for handler in &self.handlers {
            if let Err(error) = handler.commit() {
                warn!(
                    attempt_id = %attempt_id,
                    handler = %handler.id(),
                    error = %error,
                    "Handler commit failed after the master secret switched"
                );
            }
        }

        attempt.enter(AttemptPhase::Committed);
        let report = attempt.into_report();
        info!(
            attempt_id = %attempt_id,
            records = report.records_updated(),
            duration_ms = report.duration().num_milliseconds(),
            "Master secret rotation committed"
        );
        self.emit(RotationEvent::AttemptCommitted {
            attempt_id,
            records: report.records_updated(),
            committed_at: report.completed_at,
        })
        .await;

        Ok(report)
    }

    /// Settles handlers left unsettled by an interrupted attempt
    ///
    /// Dropping a [`rotate`](Self::rotate) future (timeout, task abort) can
    /// leave handlers holding compensation entries, and `rotate` refuses to
    /// run until they are settled. `old` is the secret the attempt rotated
    /// away from:
    ///
    /// - if it is still current, every unsettled handler is rolled back in
    ///   reverse registration order
    /// - if the switch already went through, every handler is `Applied` and
    ///   is committed instead
    ///
    /// # Errors
    ///
    /// [`RotationError::RotationInProgress`] while an attempt runs,
    /// [`RotationError::MasterSecretUnavailable`] when the current secret
    /// cannot be read, and [`RotationError::InvalidSecret`] when the secret
    /// moved but some handler never applied.
    pub async fn recover(&self, old: &MasterSecret) -> RotationResult<Recovery> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| RotationError::RotationInProgress)?;

        let unsettled: Vec<_> = self
            .handlers
            .iter()
            .filter(|h| !h.phase().is_settled())
            .collect();
        if unsettled.is_empty() {
            return Ok(Recovery::Settled);
        }

        let current = self
            .master
            .current()
            .await
            .map_err(RotationError::MasterSecretUnavailable)?;

        if current == *old {
            let attempt_id = AttemptId::new();
            warn!(
                attempt_id = %attempt_id,
                handlers = unsettled.len(),
                "Rolling back handlers left by an interrupted rotation"
            );
            let compensation = self.roll_back(attempt_id, unsettled.into_iter().rev()).await;
            return Ok(Recovery::RolledBack {
                attempt_id,
                reports: compensation.reports,
            });
        }

        if unsettled.iter().any(|h| h.phase() != HandlerPhase::Applied) {
            return Err(RotationError::InvalidSecret {
                reason: InvalidSecretReason::Mismatch,
            });
        }
        let mut committed = Vec::with_capacity(unsettled.len());
        for handler in unsettled {
            handler.commit()?;
            committed.push(handler.id().clone());
        }
        info!(
            handlers = committed.len(),
            "Committed handlers left by an interrupted rotation whose master secret switch went through"
        );
        Ok(Recovery::Committed { handlers: committed })
    }

    /// Registered handlers that applied in `attempt`, in application order
    fn applied_handlers<'a>(
        &'a self,
        attempt: &'a RotationAttempt,
    ) -> impl DoubleEndedIterator<Item = &'a Arc<dyn RotationHandler>> + 'a {
        attempt
            .applied()
            .filter_map(|id| self.handlers.iter().find(|h| h.id() == id))
    }

    async fn roll_back<'a>(
        &self,
        attempt_id: AttemptId,
        handlers: impl IntoIterator<Item = &'a Arc<dyn RotationHandler>>,
    ) -> Compensation {
        let mut compensation = Compensation::default();
        for handler in handlers {
            let report = handler.rollback().await;
            if report.is_complete() {
                self.emit(RotationEvent::HandlerRolledBack {
                    attempt_id,
                    handler: report.handler.clone(),
                    restored: report.restored.len(),
                    rolled_back_at: Utc::now(),
                })
                .await;
            } else {
                let event = RotationEvent::RollbackDiverged(Box::new(DivergenceData {
                    attempt_id,
                    handler: report.handler.clone(),
                    records: report.divergent.clone(),
                    detected_at: Utc::now(),
                }));
                compensation.undelivered_alerts.extend(self.alert(&event).await);
            }
            compensation.reports.push(report);
        }
        compensation
    }

    async fn abort(
        &self,
        mut attempt: RotationAttempt,
        failed_during: AttemptPhase,
        cause: FailureCause,
        mut compensation: Compensation,
    ) -> RotationError {
        attempt.enter(AttemptPhase::Aborted);
        let attempt_id = attempt.id();
        let fully_rolled_back = compensation.reports.iter().all(RollbackReport::is_complete);

        let aborted = RotationEvent::AttemptAborted {
            attempt_id,
            fully_rolled_back,
            aborted_at: Utc::now(),
        };
        if fully_rolled_back {
            self.emit(aborted).await;
        } else {
            compensation.undelivered_alerts.extend(self.alert(&aborted).await);
        }

        let failure = RotationFailure {
            attempt_id,
            failed_during,
            cause,
            rollback: compensation.reports,
            undelivered_alerts: compensation.undelivered_alerts,
        };

        if fully_rolled_back {
            warn!(attempt_id = %attempt_id, "{failure}");
            RotationError::Failed(Box::new(failure))
        } else {
            error!(
                attempt_id = %attempt_id,
                divergent = failure.divergent().count(),
                "{failure}"
            );
            RotationError::RollbackPartialFailure(Box::new(failure))
        }
    }

    async fn deliver(&self, event: &RotationEvent) -> Vec<ObserverError> {
        let mut failures = Vec::new();
        for observer in &self.observers {
            if let Err(error) = observer.on_event(event).await {
                failures.push(error);
            }
        }
        failures
    }

    async fn emit(&self, event: RotationEvent) {
        for error in self.deliver(&event).await {
            warn!(
                attempt_id = %event.attempt_id(),
                error = %error,
                "Rotation observer failed"
            );
        }
    }

    /// Delivers an operator alert; returns the failures, each logged at error
    async fn alert(&self, event: &RotationEvent) -> Vec<String> {
        self.deliver(event)
            .await
            .into_iter()
            .map(|error| {
                error!(
                    attempt_id = %event.attempt_id(),
                    error = %error,
                    alert = %event.description(),
                    "Divergence alert was not delivered"
                );
                error.to_string()
            })
            .collect()
    }
}

/// Rollback outcome of one attempt
#[derive(Debug, Default)]
struct Compensation {
    reports: Vec<RollbackReport>,
    undelivered_alerts: Vec<String>,
}

/// Outcome of [`RotationCoordinator::recover`]
#[derive(Debug)]
pub enum Recovery {
    /// Every handler was already settled
    Settled,

    /// The old secret was still current; unsettled handlers were rolled back
    RolledBack {
        /// Id the recovery events were emitted under
        attempt_id: AttemptId,
        /// Per-handler rollback outcome in the order rollback ran
        reports: Vec<RollbackReport>,
    },

    /// The master secret had already switched; handlers were committed
    Committed { handlers: Vec<HandlerId> },
}

impl Recovery {
    /// Whether no record was left divergent
    pub fn is_clean(&self) -> bool {
        match self {
            Self::RolledBack { reports, .. } => reports.iter().all(RollbackReport::is_complete),
            Self::Settled | Self::Committed { .. } => true,
        }
    }
}

impl std::fmt::Debug for RotationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationCoordinator")
            .field("handlers", &self.handler_ids().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .field("config", &self.config)
            .finish()
    }
}

fn validate_request(old: &MasterSecret, new: &MasterSecret) -> RotationResult<()> {
    let reason = if old.is_empty() {
        InvalidSecretReason::EmptyOld
    } else if new.is_empty() {
        InvalidSecretReason::EmptyNew
    } else if old == new {
        InvalidSecretReason::Unchanged
    } else {
        return Ok(());
    };
    Err(RotationError::InvalidSecret { reason })
}

/// Assembles a [`RotationCoordinator`] at process start
pub struct RotationCoordinatorBuilder {
    master: Arc<dyn MasterSecretStore>,
    handlers: Vec<(Arc<dyn RotationHandler>, Option<Arc<dyn SecretStore>>)>,
    observers: Vec<Arc<dyn RotationObserver>>,
    config: CoordinatorConfig,
}

impl RotationCoordinatorBuilder {
    /// Builder around the master secret store
    pub fn new(master: Arc<dyn MasterSecretStore>) -> Self {
        Self {
            master,
            handlers: Vec::new(),
            observers: Vec::new(),
            config: CoordinatorConfig::default(),
        }
    }

    /// Registers a handler whose store is already bound
    pub fn handler(mut self, handler: Arc<dyn RotationHandler>) -> Self {
        self.handlers.push((handler, None));
        self
    }

    /// Registers a handler and binds `store` to it at build time
    pub fn handler_with_store(
        mut self,
        handler: Arc<dyn RotationHandler>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        self.handlers.push((handler, Some(store)));
        self
    }

    /// Adds an event observer
    pub fn observer(mut self, observer: Arc<dyn RotationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Overrides the configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds stores and registers handlers in the order they were added
    ///
    /// # Errors
    ///
    /// [`RotationError::DuplicateHandler`] for a repeated handler id and
    /// [`RotationError::Handler`] when a store is already bound.
    pub fn build(self) -> RotationResult<RotationCoordinator> {
        let mut coordinator = RotationCoordinator::new(self.master);
        coordinator.config = self.config;
        coordinator.observers = self.observers;

        for (handler, store) in self.handlers {
            coordinator.register(Arc::clone(&handler))?;
            if let Some(store) = store {
                handler.bind_store(store)?;
            }
        }

        Ok(coordinator)
    }
}
