//! Shared test fixtures: counting enforcement adapter, scripted backend,
//! and coordinator wiring helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use custos_agent::backend::{Backend, BackendError, DeliveryAck, HeartbeatReport, HeartbeatResponse};
use custos_agent::directive::replay::ReplayGuard;
use custos_agent::directive::LockDirective;
use custos_agent::events::{OfflineEvent, OfflineEventQueue};
use custos_agent::lock::{
    DeviceLockState, EnforcementAdapter, LockReason, LockStateStore, TransitionCoordinator,
};

/// Enforcement adapter that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingEnforcement {
    pub hard_calls: AtomicUsize,
    pub soft_calls: AtomicUsize,
    pub clear_calls: AtomicUsize,
    pub fail: AtomicBool,
    active: AtomicBool,
}

impl EnforcementAdapter for CountingEnforcement {
    fn apply_hard_lock(&self, _reason: LockReason) -> bool {
        self.hard_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            false
        } else {
            self.active.store(true, Ordering::SeqCst);
            true
        }
    }

    fn apply_soft_lock(&self, _reason: LockReason) -> bool {
        self.soft_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            false
        } else {
            self.active.store(true, Ordering::SeqCst);
            true
        }
    }

    fn clear_lock(&self) -> bool {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            false
        } else {
            self.active.store(false, Ordering::SeqCst);
            true
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Backend double: scripted heartbeat response, switchable connectivity,
/// and a record of delivered events. When wired to a store it also records
/// the lock state observed at the moment each delivery call arrives, which
/// lets tests assert enforcement-before-network ordering.
#[derive(Default)]
pub struct ScriptedBackend {
    pub response: Mutex<Option<HeartbeatResponse>>,
    pub offline: AtomicBool,
    pub duplicate_ack: AtomicBool,
    pub delivered: Mutex<Vec<OfflineEvent>>,
    pub observe_store: Mutex<Option<Arc<LockStateStore>>>,
    pub observed_states: Mutex<Vec<DeviceLockState>>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn send_heartbeat(
        &self,
        _report: &HeartbeatReport,
    ) -> Result<HeartbeatResponse, BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("offline".to_string()));
        }
        self.response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Unavailable("no scripted response".to_string()))
    }

    async fn deliver_event(&self, event: &OfflineEvent) -> Result<DeliveryAck, BackendError> {
        if let Some(store) = self.observe_store.lock().unwrap().as_ref() {
            self.observed_states.lock().unwrap().push(store.read().state);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("offline".to_string()));
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(DeliveryAck {
            accepted: !self.duplicate_ack.load(Ordering::SeqCst),
            duplicate: self.duplicate_ack.load(Ordering::SeqCst),
        })
    }
}

pub struct TestRig {
    pub store: Arc<LockStateStore>,
    pub queue: Arc<OfflineEventQueue>,
    pub replay: Arc<ReplayGuard>,
    pub coordinator: Arc<TransitionCoordinator>,
    pub enforcement: Arc<CountingEnforcement>,
}

/// Wire a coordinator over temp storage with a short debounce window.
pub fn build_rig(dir: &std::path::Path) -> TestRig {
    let store = Arc::new(LockStateStore::open(dir).unwrap());
    let queue = Arc::new(OfflineEventQueue::open(dir).unwrap());
    let replay = Arc::new(ReplayGuard::open(dir, 300, 64).unwrap());
    let enforcement = Arc::new(CountingEnforcement::default());
    let coordinator = TransitionCoordinator::start(
        store.clone(),
        enforcement.clone(),
        queue.clone(),
        replay.clone(),
        Duration::from_millis(200),
    );
    TestRig {
        store,
        queue,
        replay,
        coordinator,
        enforcement,
    }
}

pub fn directive(target: DeviceLockState, reason: LockReason, message: &str) -> LockDirective {
    LockDirective {
        target_state: target,
        reason,
        message: message.to_string(),
        unlock_credential_hash: None,
        expires_at: None,
        sequence_number: None,
        nonce: None,
        issued_at: Utc::now(),
    }
}

/// Wait until the store reaches the expected state or time out.
pub async fn wait_for_state(store: &LockStateStore, expected: DeviceLockState) {
    let mut rx = store.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == expected))
        .await
        .expect("timed out waiting for state")
        .expect("store subscription closed");
}

/// Give the coordinator worker a moment to chew through its queue.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
