//! Transition coordinator integration tests
//!
//! Covers the transition table: directive idempotence, guard rules, PIN
//! unlock, replay validation on admin envelopes, terminal deactivation, and
//! enforcement-failure recovery through the reconcile pass.

mod common;

use std::sync::atomic::Ordering;

use chrono::Utc;
use custos_agent::lock::EnforcementAdapter;
use tempfile::TempDir;

use common::{build_rig, directive, settle, wait_for_state};
use custos_agent::error::AgentError;
use custos_agent::events::OfflineEventType;
use custos_agent::lock::credential;
use custos_agent::lock::{DeviceLockState, LockReason};

#[tokio::test]
async fn duplicate_directive_applies_once() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    let d = directive(
        DeviceLockState::HardLocked,
        LockReason::PaymentOverdue,
        "Payment overdue",
    );
    rig.coordinator.submit(d.clone()).unwrap();
    rig.coordinator.submit(d.clone()).unwrap();
    rig.coordinator.submit(d).unwrap();

    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;
    settle().await;

    // One transition, no duplicate enforcement calls
    assert_eq!(rig.enforcement.hard_calls.load(Ordering::SeqCst), 1);
    let audit = rig.store.recent_audit(10).unwrap();
    let hard_locks: Vec<_> = audit.iter().filter(|r| r.action == "hard_lock").collect();
    assert_eq!(hard_locks.len(), 1);
}

#[tokio::test]
async fn soft_directive_never_weakens_hard_lock() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    rig.coordinator
        .submit(directive(
            DeviceLockState::HardLocked,
            LockReason::PaymentOverdue,
            "Payment overdue",
        ))
        .unwrap();
    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;

    rig.coordinator
        .submit(directive(
            DeviceLockState::SoftLocked,
            LockReason::PaymentReminder,
            "Payment reminder",
        ))
        .unwrap();
    settle().await;

    assert_eq!(rig.store.read().state, DeviceLockState::HardLocked);
    assert_eq!(rig.enforcement.soft_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn soft_lock_applies_from_unlocked() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    rig.coordinator
        .submit(directive(
            DeviceLockState::SoftLocked,
            LockReason::PaymentReminder,
            "Payment due soon",
        ))
        .unwrap();
    wait_for_state(&rig.store, DeviceLockState::SoftLocked).await;
    assert_eq!(rig.enforcement.soft_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.store.read().reason, LockReason::PaymentReminder);
}

#[tokio::test]
async fn pin_unlock_is_single_use() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    let mut d = directive(
        DeviceLockState::HardLocked,
        LockReason::PaymentOverdue,
        "Payment overdue",
    );
    d.unlock_credential_hash = Some(credential::digest("ABC123"));
    rig.coordinator.submit(d).unwrap();
    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;

    assert!(!rig.coordinator.submit_unlock_attempt("WRONG"));
    assert_eq!(rig.store.read().state, DeviceLockState::HardLocked);

    assert!(rig.coordinator.submit_unlock_attempt("ABC123"));
    assert_eq!(rig.store.read().state, DeviceLockState::Unlocked);
    assert!(rig.store.credential_hash().unwrap().is_none());

    // Credential cleared on match: re-locking without a new credential
    // leaves nothing to unlock with
    rig.coordinator
        .submit(directive(
            DeviceLockState::HardLocked,
            LockReason::PaymentOverdue,
            "Payment overdue",
        ))
        .unwrap();
    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;
    assert!(!rig.coordinator.submit_unlock_attempt("ABC123"));
}

#[tokio::test]
async fn pin_rejected_when_not_hard_locked() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    rig.store
        .set_credential_hash(Some(&credential::digest("ABC123")))
        .unwrap();
    assert!(!rig.coordinator.submit_unlock_attempt("ABC123"));
}

#[tokio::test]
async fn replay_envelope_validated_on_submit() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    let mut d = directive(
        DeviceLockState::HardLocked,
        LockReason::Unknown,
        "locked by administrator",
    );
    d.nonce = Some("n-1".to_string());
    d.sequence_number = Some(5);
    d.issued_at = Utc::now();
    rig.coordinator.submit(d.clone()).unwrap();
    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;

    // Same nonce again: rejected before it ever reaches the queue
    let err = rig.coordinator.submit(d.clone()).unwrap_err();
    assert!(matches!(err, AgentError::ReplayRejected(_)));

    // Fresh nonce but stale sequence: rejected too
    d.nonce = Some("n-2".to_string());
    d.sequence_number = Some(4);
    assert!(matches!(
        rig.coordinator.submit(d).unwrap_err(),
        AgentError::ReplayRejected(_)
    ));
}

#[tokio::test]
async fn incomplete_replay_envelope_is_malformed() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    let mut d = directive(DeviceLockState::HardLocked, LockReason::Unknown, "");
    d.nonce = Some("n-1".to_string());
    assert!(matches!(
        rig.coordinator.submit(d).unwrap_err(),
        AgentError::MalformedDirective(_)
    ));
}

#[tokio::test]
async fn deactivation_is_terminal_and_confirmed() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());

    rig.coordinator
        .submit(directive(
            DeviceLockState::Deactivating,
            LockReason::DeactivationRequested,
            "Time to remove the device agent.",
        ))
        .unwrap();
    wait_for_state(&rig.store, DeviceLockState::Deactivated).await;

    // Confirmation queued for the backend
    assert_eq!(
        rig.queue
            .pending_of_type(OfflineEventType::DeactivationConfirmed)
            .unwrap(),
        1
    );

    // No further transitions accepted
    rig.coordinator
        .submit(directive(DeviceLockState::Unlocked, LockReason::None, ""))
        .unwrap();
    settle().await;
    assert_eq!(rig.store.read().state, DeviceLockState::Deactivated);

    // Duplicate deactivation is idempotent
    rig.coordinator
        .submit(directive(
            DeviceLockState::Deactivating,
            LockReason::DeactivationRequested,
            "",
        ))
        .unwrap();
    settle().await;
    assert_eq!(
        rig.queue
            .pending_of_type(OfflineEventType::DeactivationConfirmed)
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn enforcement_failure_persists_state_and_reconciles() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    rig.enforcement.fail.store(true, Ordering::SeqCst);

    rig.coordinator
        .submit(directive(
            DeviceLockState::HardLocked,
            LockReason::PaymentOverdue,
            "Payment overdue",
        ))
        .unwrap();
    wait_for_state(&rig.store, DeviceLockState::HardLocked).await;

    // State is durable even though enforcement failed
    let audit = rig.store.recent_audit(5).unwrap();
    let lock_record = audit.iter().find(|r| r.action == "hard_lock").unwrap();
    assert!(!lock_record.success);
    assert!(!rig.enforcement.is_active());

    // Next reconcile tick converges the device to the stored state
    rig.enforcement.fail.store(false, Ordering::SeqCst);
    rig.coordinator.reconcile_enforcement();
    assert!(rig.enforcement.is_active());
    assert_eq!(rig.enforcement.hard_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn state_restored_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let rig = build_rig(dir.path());
        rig.coordinator
            .submit(directive(
                DeviceLockState::HardLocked,
                LockReason::PaymentOverdue,
                "Payment overdue",
            ))
            .unwrap();
        wait_for_state(&rig.store, DeviceLockState::HardLocked).await;
    }
    let rig = build_rig(dir.path());
    let snap = rig.store.read();
    assert_eq!(snap.state, DeviceLockState::HardLocked);
    assert_eq!(snap.reason, LockReason::PaymentOverdue);
}
