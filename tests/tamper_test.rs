//! Tamper response integration tests
//!
//! The central safety property: local enforcement and the durable state
//! update happen before the backend notification is attempted, and an
//! offline device still ends up locked with the notification queued.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tempfile::TempDir;

use common::{build_rig, directive, settle, ScriptedBackend};
use custos_agent::events::OfflineEventType;
use custos_agent::lock::{DeviceLockState, LockReason};
use custos_agent::tamper::{Severity, TamperKind, TamperResponseCoordinator, TamperSignal};

fn signal(kind: TamperKind, severity: Severity) -> TamperSignal {
    TamperSignal {
        kind,
        severity,
        description: format!("{} detected", kind.as_str()),
    }
}

#[tokio::test]
async fn offline_tamper_locks_immediately_and_queues_one_notification() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    backend.offline.store(true, Ordering::SeqCst);
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    let response = tamper.respond_to_tamper(signal(TamperKind::RootDetected, Severity::Critical));

    // Locked before respond_to_tamper even returned
    assert!(response.locked);
    assert_eq!(rig.store.read().state, DeviceLockState::HardLocked);
    assert_eq!(rig.store.read().reason, LockReason::TamperDetected);
    assert_eq!(rig.enforcement.hard_calls.load(Ordering::SeqCst), 1);

    response.notification.unwrap().await.unwrap();
    assert_eq!(
        rig.queue
            .pending_of_type(OfflineEventType::TamperNotification)
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn local_lock_is_observable_before_network_call() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    *backend.observe_store.lock().unwrap() = Some(rig.store.clone());
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    let response = tamper.respond_to_tamper(signal(TamperKind::BootloaderUnlocked, Severity::High));
    response.notification.unwrap().await.unwrap();

    // The backend saw the device already hard-locked when the call arrived
    let observed = backend.observed_states.lock().unwrap();
    assert_eq!(observed.as_slice(), &[DeviceLockState::HardLocked]);

    // Delivered immediately, so nothing left in the queue
    assert_eq!(
        rig.queue
            .pending_of_type(OfflineEventType::TamperNotification)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn tamper_wins_over_queued_directives() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    backend.offline.store(true, Ordering::SeqCst);
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    // A burst of server directives sits in the queue while the tamper
    // fast path cuts straight through
    for _ in 0..5 {
        rig.coordinator
            .submit(directive(DeviceLockState::Unlocked, LockReason::None, ""))
            .unwrap();
    }
    let response = tamper.respond_to_tamper(signal(TamperKind::CustomRom, Severity::Critical));
    assert!(response.locked);
    assert_eq!(rig.store.read().state, DeviceLockState::HardLocked);

    settle().await;
    // Queued unlocks ran afterwards but cannot clear a tamper-forced lock
    assert_eq!(rig.store.read().state, DeviceLockState::HardLocked);
    assert_eq!(rig.store.read().reason, LockReason::TamperDetected);
}

#[tokio::test]
async fn low_severity_notifies_without_locking() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    let response = tamper.respond_to_tamper(signal(TamperKind::UsbDebugging, Severity::Medium));
    assert!(!response.locked);
    assert_eq!(rig.store.read().state, DeviceLockState::Unlocked);

    response.notification.unwrap().await.unwrap();
    assert_eq!(backend.delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sim_change_locks_with_sim_reason() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    backend.offline.store(true, Ordering::SeqCst);
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    let response = tamper.respond_to_tamper(signal(TamperKind::SimChanged, Severity::High));
    assert!(response.locked);
    assert_eq!(rig.store.read().reason, LockReason::SimChange);
    response.notification.unwrap().await.unwrap();
}

#[tokio::test]
async fn repeated_tamper_is_idempotent_locally() {
    let dir = TempDir::new().unwrap();
    let rig = build_rig(dir.path());
    let backend = Arc::new(ScriptedBackend::default());
    let tamper = TamperResponseCoordinator::new(
        rig.coordinator.clone(),
        rig.queue.clone(),
        backend.clone(),
    );

    let first = tamper.respond_to_tamper(signal(TamperKind::RootDetected, Severity::Critical));
    let second = tamper.respond_to_tamper(signal(TamperKind::RootDetected, Severity::Critical));
    assert!(first.locked);
    assert!(second.locked);
    // Second signal found the lock already in place: one enforcement call
    assert_eq!(rig.enforcement.hard_calls.load(Ordering::SeqCst), 1);

    first.notification.unwrap().await.unwrap();
    second.notification.unwrap().await.unwrap();
}
