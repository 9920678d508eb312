//! Agent: the single coordination service instance
//!
//! Owns the storage handles, coordinator, tamper fast path, offline queue
//! and backend client; constructed once at process start and passed by
//! reference to all consumers. Two schedulers drive it: a short-interval
//! heartbeat tick and a longer-interval reconcile tick (enforcement
//! reconciliation, offline-queue draining, GC, opportunistic identity
//! repair). Neither runs on the enforcement path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::backend::{Backend, HeartbeatReport};
use crate::config::Config;
use crate::directive::interpreter;
use crate::directive::replay::ReplayGuard;
use crate::error::AgentError;
use crate::events::{DeliveryWorker, OfflineEvent, OfflineEventQueue, OfflineEventType};
use crate::identity::{ConsistencyRepair, DeviceStore, IdentityDomain, ProtectedStore, RepairOutcome};
use crate::lock::{EnforcementAdapter, LockStateStore, TransitionCoordinator};
use crate::tamper::{TamperResponseCoordinator, TamperSignal};
use crate::CURRENT_VERSION;

pub struct Agent {
    config: Config,
    store: Arc<LockStateStore>,
    queue: Arc<OfflineEventQueue>,
    coordinator: Arc<TransitionCoordinator>,
    tamper: TamperResponseCoordinator,
    delivery: DeliveryWorker,
    backend: Arc<dyn Backend>,
    device_store: DeviceStore,
    protected_store: ProtectedStore,
}

impl Agent {
    /// Wire the service. Runs consistency repair once before anything else.
    pub fn start(
        config: Config,
        backend: Arc<dyn Backend>,
        enforcement: Arc<dyn EnforcementAdapter>,
    ) -> Result<Self> {
        let data_dir = &config.device.data_dir;
        let store = Arc::new(LockStateStore::open(data_dir)?);
        let queue = Arc::new(OfflineEventQueue::open(data_dir)?);
        let replay = Arc::new(ReplayGuard::open(
            data_dir,
            config.replay.freshness_window_secs,
            config.replay.nonce_capacity,
        )?);
        let coordinator = TransitionCoordinator::start(
            store.clone(),
            enforcement,
            queue.clone(),
            replay,
            Duration::from_millis(config.coordinator.debounce_ms),
        );
        let tamper = TamperResponseCoordinator::new(coordinator.clone(), queue.clone(), backend.clone());
        let delivery = DeliveryWorker::new(
            queue.clone(),
            backend.clone(),
            config.reconcile.drain_batch_size,
            config.reconcile.backoff_base_secs,
            config.reconcile.backoff_max_secs,
            config.reconcile.retention_secs,
        );

        let device_store = DeviceStore::open(data_dir)?;
        let protected_store = ProtectedStore::new(config.device.protected_dir.clone());

        let agent = Self {
            config,
            store,
            queue,
            coordinator,
            tamper,
            delivery,
            backend,
            device_store,
            protected_store,
        };
        agent.repair_identity();
        info!(state = %agent.store.read().state.as_str(), "Agent started");
        Ok(agent)
    }

    pub fn coordinator(&self) -> &Arc<TransitionCoordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<OfflineEventQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<LockStateStore> {
        &self.store
    }

    /// Local tamper detectors call straight through; the heartbeat path is
    /// never involved.
    pub fn respond_to_tamper(&self, signal: TamperSignal) -> crate::tamper::TamperResponse {
        self.tamper.respond_to_tamper(signal)
    }

    /// PIN entry boundary consumed by the UI.
    pub fn submit_unlock_attempt(&self, candidate: &str) -> bool {
        self.coordinator.submit_unlock_attempt(candidate)
    }

    /// One heartbeat tick: post the status report, interpret the response,
    /// hand any directive to the coordinator. Network failure just waits for
    /// the next tick; the heartbeat retries itself.
    pub async fn heartbeat_tick(&self) {
        let snapshot = self.store.read();
        let report = HeartbeatReport {
            device_id: self.config.device.id.clone(),
            agent_version: CURRENT_VERSION.to_string(),
            lock_state: snapshot.state,
            pending_events: self.queue.pending_count().unwrap_or(0),
        };

        let response = match self.backend.send_heartbeat(&report).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Heartbeat failed, retrying next tick");
                return;
            }
        };

        let Some(directive) = interpreter::interpret(&response, &snapshot) else {
            return;
        };
        match self.coordinator.submit(directive) {
            Ok(()) => {}
            Err(AgentError::ReplayRejected(rejection)) => {
                // Dropped and logged, never surfaced to the user
                warn!(rejection = %rejection, "Admin command failed replay validation");
            }
            Err(e) => {
                warn!(error = %e, "Directive submission failed");
            }
        }
    }

    /// One reconcile tick: enforcement convergence, offline-queue draining
    /// (with GC), and opportunistic identity repair.
    pub async fn reconcile_tick(&self) {
        self.coordinator.reconcile_enforcement();
        let synced = self.delivery.run_once().await;
        if synced > 0 {
            debug!(synced, "Reconcile tick delivered queued events");
        }
        self.repair_identity();
    }

    /// Run identity repair; a conflict becomes a queued high-severity
    /// diagnostic, never an auto-resolution.
    pub fn repair_identity(&self) -> Option<RepairOutcome> {
        let repair = ConsistencyRepair::new(&self.device_store, &self.protected_store);
        match repair.repair() {
            Ok(outcome) => {
                if let RepairOutcome::NotRegistered = outcome {
                    debug!("Device not registered in either identity domain");
                }
                Some(outcome)
            }
            Err(AgentError::IdentityConflict { device, protected }) => {
                warn!(%device, %protected, "Identity conflict detected");
                let event = OfflineEvent::new(
                    OfflineEventType::IdentityConflict,
                    serde_json::json!({
                        "device_domain": device,
                        "protected_domain": protected,
                        "severity": "HIGH",
                    }),
                );
                if let Err(e) = self.queue.enqueue(&event) {
                    warn!(error = %e, "Failed to queue identity conflict diagnostic");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Identity repair failed");
                None
            }
        }
    }

    /// Record the server-assigned identity at registration time and mirror
    /// it immediately.
    pub fn record_identity(&self, device_id: &str) -> Result<()> {
        self.device_store.write_identity(device_id)?;
        self.repair_identity();
        Ok(())
    }

    /// Run both schedulers until the process is stopped. Heartbeats on the
    /// short interval, reconciliation on the long one.
    pub async fn run(self: Arc<Self>) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat.interval_secs.max(1),
        ));
        let mut reconcile = tokio::time::interval(Duration::from_secs(
            self.config.reconcile.interval_secs.max(1),
        ));
        info!(
            heartbeat_secs = self.config.heartbeat.interval_secs,
            reconcile_secs = self.config.reconcile.interval_secs,
            "Agent schedulers running"
        );
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.heartbeat_tick().await;
                }
                _ = reconcile.tick() => {
                    self.reconcile_tick().await;
                }
            }
        }
    }
}
