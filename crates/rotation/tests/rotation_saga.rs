//! Integration tests for the rotation saga
//!
//! Covers the apply-all / compensate-on-failure flow across several handlers,
//! the single switch of the master secret, and the all-or-nothing outcome.

mod common;

use common::{CallLog, Fixture, SamplingStore, RecordingHandler, mock_master};
use pretty_assertions::assert_eq;
use rekey_rotation::prelude::*;
use rekey_rotation::{
    AttemptPhase, FailureCause, HandlerError, HandlerPhase, InvalidSecretReason, StoreError,
};
use rstest::rstest;

#[tokio::test]
async fn test_second_handler_decryption_failure_restores_everything() {
    // GIVEN: H1 with 3 records and H2 with 2 records, H2's second record
    // sealed under a secret other than the current one
    let fixture = Fixture::new();
    let store1 = fixture.store("alpha", &["alice", "bob", "carol"], "old1");
    let store2 = MemorySecretStore::with_records([
        fixture.record("beta", "dave", "old1"),
        fixture.record("beta", "erin", "not-the-master"),
    ]);
    let before1 = store1.snapshot();
    let before2 = store2.snapshot();

    let h1 = fixture.handler("h1");
    let h2 = fixture.handler("h2");

    let mut master = mock_master("old1");
    master.expect_set_current().times(0);

    let coordinator = RotationCoordinator::builder(Arc::new(master))
        .handler_with_store(h1.clone(), store1.clone())
        .handler_with_store(h2.clone(), store2.clone())
        .build()
        .unwrap();

    // WHEN: We rotate old1 -> new1
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    // THEN: The failure names H2 and its decryption error
    let RotationError::Failed(failure) = err else {
        panic!("expected a fully rolled back failure");
    };
    match &failure.cause {
        FailureCause::Handler { handler, error } => {
            assert_eq!(handler.as_str(), "h2");
            assert!(
                matches!(error, HandlerError::Decryption { key, .. } if key.to_string() == "beta__erin")
            );
        }
        other => panic!("unexpected cause: {other}"),
    }
    assert!(failure.is_fully_rolled_back());
    assert_eq!(failure.failed_during, AttemptPhase::Applying);
    let order: Vec<_> = failure.rollback_order().into_iter().map(HandlerId::as_str).collect();
    assert_eq!(order, ["h2", "h1"]);

    // THEN: All 5 records are bit-identical to their pre-attempt values
    assert_eq!(store1.snapshot(), before1);
    assert_eq!(store2.snapshot(), before2);
    assert_eq!(failure.rollback[1].restored.len(), 3);
    assert_eq!(failure.rollback[0].restored.len(), 2);

    // THEN: Both handlers are back to Idle with empty compensation logs
    for handler in [&h1, &h2] {
        assert_eq!(handler.phase(), HandlerPhase::Idle);
        assert_eq!(handler.pending_compensations(), 0);
    }
}

#[tokio::test]
async fn test_single_record_rotation_commits_once() {
    // GIVEN: One handler owning one record
    let fixture = Fixture::new();
    let store = fixture.store("alpha", &["alice"], "old1");
    let before = store.snapshot();
    let handler = fixture.handler("certs");

    let mut master = mock_master("old1");
    master
        .expect_set_current()
        .withf(|secret| *secret == MasterSecret::from("new1"))
        .times(1)
        .returning(|_| Ok(()));

    let coordinator = RotationCoordinator::builder(Arc::new(master))
        .handler_with_store(handler.clone(), store.clone())
        .build()
        .unwrap();

    // WHEN: We rotate old1 -> new1
    let report = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap();

    // THEN: The record changed and now opens under new1 with the same plaintext
    let after = store.snapshot();
    assert_ne!(after, before);
    assert_eq!(fixture.open(&after[0], "new1"), Some(Fixture::plaintext("alice")));
    assert_eq!(fixture.open(&after[0], "old1"), None);

    // THEN: The report lists the record and the compensation log is empty
    assert_eq!(report.records_updated(), 1);
    assert_eq!(report.handlers[0].updated, vec![RecordKey::new("alpha", "alice").unwrap()]);
    assert_eq!(handler.pending_compensations(), 0);
    assert_eq!(handler.phase(), HandlerPhase::Idle);
}

#[tokio::test]
async fn test_repeated_rotation_is_rejected() {
    // GIVEN: A completed old1 -> new1 rotation
    let fixture = Fixture::new();
    let store = fixture.store("alpha", &["alice", "bob"], "old1");
    let master = MemoryMasterSecretStore::new("old1");
    let coordinator = RotationCoordinator::builder(master.clone())
        .handler_with_store(fixture.handler("certs"), store.clone())
        .build()
        .unwrap();

    coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap();
    let after_first = store.snapshot();

    // WHEN: The same rotation is requested again
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    // THEN: It is rejected before any mutation
    assert!(matches!(
        err,
        RotationError::InvalidSecret {
            reason: InvalidSecretReason::Mismatch
        }
    ));
    assert_eq!(store.snapshot(), after_first);
    assert_eq!(master.update_count(), 1);
    assert_eq!(master.current().await.unwrap(), MasterSecret::from("new1"));
}

#[tokio::test]
async fn test_repeated_rotation_without_verification_fails_on_decrypt() {
    // GIVEN: A completed rotation and a coordinator that skips the current check
    let fixture = Fixture::new();
    let store = fixture.store("alpha", &["alice"], "old1");
    let master = MemoryMasterSecretStore::new("old1");
    let coordinator = RotationCoordinator::builder(master.clone())
        .handler_with_store(fixture.handler("certs"), store.clone())
        .config(CoordinatorConfig {
            verify_current: false,
        })
        .build()
        .unwrap();
    coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap();

    // WHEN: The same rotation is requested again
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    // THEN: The stale old secret does not open the records and nothing changes
    assert!(matches!(err, RotationError::Failed(_)));
    assert_eq!(fixture.open(&store.snapshot()[0], "new1"), Some(Fixture::plaintext("alice")));
    assert_eq!(master.update_count(), 1);
}

#[rstest]
#[case::first_fails(0)]
#[case::middle_fails(1)]
#[case::last_fails(2)]
#[tokio::test]
async fn test_compensation_runs_in_reverse_registration_order(#[case] failing: usize) {
    // GIVEN: Handlers H1, H2, H3 where one of them fails
    let calls = CallLog::default();
    let ids = ["h1", "h2", "h3"];
    let mut builder = RotationCoordinator::builder(MemoryMasterSecretStore::new("old1"));
    for (position, id) in ids.iter().enumerate() {
        builder = builder.handler(RecordingHandler::new(id, &calls, position == failing));
    }
    let coordinator = builder.build().unwrap();

    // WHEN: We rotate
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    // THEN: Handlers after the failing one never ran and rollback went backwards
    let mut expected: Vec<String> = ids[..=failing].iter().map(|id| format!("apply:{id}")).collect();
    expected.extend(ids[..=failing].iter().rev().map(|id| format!("rollback:{id}")));
    assert_eq!(*calls.lock(), expected);

    let failure = err.failure().unwrap();
    assert_eq!(failure.cause.handler().map(HandlerId::as_str), Some(ids[failing]));
    assert_eq!(failure.rollback_order().len(), failing + 1);
}

#[tokio::test]
async fn test_all_handlers_commit_after_master_switch() {
    let calls = CallLog::default();
    let master = MemoryMasterSecretStore::new("old1");
    let coordinator = RotationCoordinator::builder(master.clone())
        .handler(RecordingHandler::new("h1", &calls, false))
        .handler(RecordingHandler::new("h2", &calls, false))
        .build()
        .unwrap();

    coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap();

    assert_eq!(*calls.lock(), ["apply:h1", "apply:h2", "commit:h1", "commit:h2"]);
    assert_eq!(master.update_count(), 1);
}

#[tokio::test]
async fn test_master_switch_failure_rolls_back_every_handler() {
    // GIVEN: Two healthy handlers and a master store that cannot be written
    let fixture = Fixture::new();
    let store1 = fixture.store("alpha", &["alice", "bob"], "old1");
    let store2 = fixture.store("beta", &["carol"], "old1");
    let before1 = store1.snapshot();
    let before2 = store2.snapshot();

    let mut master = mock_master("old1");
    master
        .expect_set_current()
        .times(1)
        .returning(|_| Err(StoreError::backend("disk full")));

    let coordinator = RotationCoordinator::builder(Arc::new(master))
        .handler_with_store(fixture.handler("h1"), store1.clone())
        .handler_with_store(fixture.handler("h2"), store2.clone())
        .build()
        .unwrap();

    // WHEN: We rotate
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    // THEN: Every handler was compensated in reverse order
    let failure = err.failure().unwrap();
    assert!(matches!(failure.cause, FailureCause::MasterSecretCommit { .. }));
    assert!(failure.cause.handler().is_none());
    assert_eq!(failure.failed_during, AttemptPhase::Committing);
    let order: Vec<_> = failure.rollback_order().into_iter().map(HandlerId::as_str).collect();
    assert_eq!(order, ["h2", "h1"]);

    // THEN: Records still open under the old secret
    assert_eq!(store1.snapshot(), before1);
    assert_eq!(store2.snapshot(), before2);
}

#[tokio::test]
async fn test_compensation_captured_before_persist() {
    // GIVEN: A store that samples the compensation log on every write
    let fixture = Fixture::new();
    let sampler = SamplingStore::new(fixture.store("alpha", &["alice", "bob", "carol"], "old1"));
    let handler = fixture.handler("certs");
    sampler.watch(&handler);

    let coordinator = RotationCoordinator::builder(MemoryMasterSecretStore::new("old1"))
        .handler_with_store(handler.clone(), sampler.clone())
        .build()
        .unwrap();

    // WHEN: We rotate
    coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap();

    // THEN: Each write saw its own record already captured
    assert_eq!(*sampler.observed.lock(), [1, 2, 3]);
    assert_eq!(handler.pending_compensations(), 0);
}

#[tokio::test]
async fn test_rollback_restores_while_rolled_back() {
    // GIVEN: certs on a sampling store, followed by a handler that fails
    let fixture = Fixture::new();
    let inner = fixture.store("alpha", &["alice", "bob"], "old1");
    let before = inner.snapshot();
    let sampler = SamplingStore::new(inner.clone());
    let handler = fixture.handler("certs");
    sampler.watch(&handler);
    let calls = CallLog::default();

    let coordinator = RotationCoordinator::builder(MemoryMasterSecretStore::new("old1"))
        .handler_with_store(handler.clone(), sampler.clone())
        .handler(RecordingHandler::new("failing", &calls, true))
        .build()
        .unwrap();

    // WHEN: The second handler fails and certs compensates
    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RotationError::Failed(_)));

    // THEN: Writes during apply saw Applying, restores saw RolledBack
    assert_eq!(
        *sampler.phases.lock(),
        [
            HandlerPhase::Applying,
            HandlerPhase::Applying,
            HandlerPhase::RolledBack,
            HandlerPhase::RolledBack,
        ]
    );
    assert_eq!(handler.phase(), HandlerPhase::Idle);
    assert_eq!(inner.snapshot(), before);
}

#[tokio::test]
async fn test_missing_account_aborts_and_restores() {
    let fixture = Fixture::new();
    let store = fixture.store("alpha", &["alice", "bob"], "old1");
    let before = store.snapshot();
    fixture.accounts.remove("bob");

    let master = MemoryMasterSecretStore::new("old1");
    let coordinator = RotationCoordinator::builder(master.clone())
        .handler_with_store(fixture.handler("certs"), store.clone())
        .build()
        .unwrap();

    let err = coordinator
        .rotate(&MasterSecret::from("old1"), &MasterSecret::from("new1"))
        .await
        .unwrap_err();

    let failure = err.failure().unwrap();
    assert!(matches!(
        failure.cause,
        FailureCause::Handler {
            error: HandlerError::EntityNotFound { .. },
            ..
        }
    ));
    assert_eq!(store.snapshot(), before);
    assert_eq!(master.update_count(), 0);
    assert!(!err.is_retryable());
}
