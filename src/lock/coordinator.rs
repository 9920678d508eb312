//! TransitionCoordinator: serialized, debounced lock state transitions
//!
//! All state mutations flow through here. Server directives are queued and
//! processed by exactly one worker; a short debounce window collapses bursts
//! of duplicate directives from rapid successive heartbeats. Tamper-forced
//! transitions and PIN attempts take a synchronous fast path that shares the
//! same core mutex, so they are serialized with the worker but never wait in
//! its queue.
//!
//! Failure semantics: if the enforcement adapter reports failure the state
//! store is still updated (source of truth is "should be locked", not "is
//! verifiably locked") and the reconcile pass re-attempts enforcement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directive::replay::ReplayGuard;
use crate::directive::LockDirective;
use crate::error::AgentError;
use crate::events::{OfflineEvent, OfflineEventQueue, OfflineEventType};

use super::{
    credential, AuditRecord, DeviceLockState, EnforcementAdapter, LockReason, LockSnapshot,
    LockStateStore,
};

/// Result of asking the core to apply a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State changed (enforcement may still have failed; see audit log).
    Applied {
        from: DeviceLockState,
        to: DeviceLockState,
    },
    /// Target equals current state; nothing done, no enforcement call.
    NoOp,
    /// Duplicate collapsed inside the debounce window.
    Debounced,
    /// Guard refused the transition.
    Refused(&'static str),
    /// Device is deactivated; no further transitions are accepted.
    Terminal,
}

struct Core {
    store: Arc<LockStateStore>,
    enforcement: Arc<dyn EnforcementAdapter>,
    queue: Arc<OfflineEventQueue>,
    debounce: Duration,
    last_applied: Option<((DeviceLockState, LockReason), Instant)>,
}

pub struct TransitionCoordinator {
    core: Mutex<Core>,
    replay: Arc<ReplayGuard>,
    tx: mpsc::UnboundedSender<LockDirective>,
    terminal: AtomicBool,
}

impl TransitionCoordinator {
    /// Build the coordinator and spawn its single worker task.
    pub fn start(
        store: Arc<LockStateStore>,
        enforcement: Arc<dyn EnforcementAdapter>,
        queue: Arc<OfflineEventQueue>,
        replay: Arc<ReplayGuard>,
        debounce: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminal = store.read().state.is_terminal();
        let coordinator = Arc::new(Self {
            core: Mutex::new(Core {
                store,
                enforcement,
                queue,
                debounce,
                last_applied: None,
            }),
            replay,
            tx,
            terminal: AtomicBool::new(terminal),
        });
        Self::spawn_worker(coordinator.clone(), rx);
        coordinator
    }

    fn spawn_worker(coordinator: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LockDirective>) {
        tokio::spawn(async move {
            while let Some(directive) = rx.recv().await {
                if coordinator.terminal.load(Ordering::SeqCst) {
                    // Terminal state: clear the queue, transitions are meaningless
                    debug!("Dropping queued directive, device deactivated");
                    continue;
                }
                let outcome = coordinator.apply(&directive);
                debug!(outcome = ?outcome, target = %directive.target_state.as_str(), "Directive processed");
            }
        });
    }

    /// Validate and enqueue a server directive. Directives carrying a
    /// replay envelope must pass the replay guard before they are queued.
    pub fn submit(&self, directive: LockDirective) -> Result<(), AgentError> {
        if directive.has_replay_envelope() {
            let (Some(nonce), Some(sequence)) = (&directive.nonce, directive.sequence_number)
            else {
                return Err(AgentError::MalformedDirective(
                    "replay envelope must carry both nonce and sequence number".to_string(),
                ));
            };
            self.replay.accept(nonce, sequence, directive.issued_at)?;
        }
        if self.terminal.load(Ordering::SeqCst) {
            debug!("Ignoring directive, device deactivated");
            return Ok(());
        }
        self.tx
            .send(directive)
            .map_err(|_| AgentError::EnforcementFailure("coordinator worker gone".to_string()))?;
        Ok(())
    }

    /// Tamper fast path: hard lock applied immediately and synchronously,
    /// exempt from queueing and debouncing. Returns after the local lock is
    /// durable and observable.
    pub fn force_hard_lock(&self, reason: LockReason, detail: &str) -> TransitionOutcome {
        if self.terminal.load(Ordering::SeqCst) {
            return TransitionOutcome::Terminal;
        }
        let mut core = self.core.lock().expect("coordinator mutex poisoned");
        let snapshot = core.store.read();
        if snapshot.state == DeviceLockState::HardLocked && snapshot.reason == reason {
            return TransitionOutcome::NoOp;
        }
        let outcome = core.transition(
            DeviceLockState::HardLocked,
            reason,
            detail,
            true,
            "tamper_hard_lock",
        );
        // Tamper transitions never participate in the debounce window
        core.last_applied = None;
        outcome
    }

    /// PIN entry boundary. Accepts the candidate only when the device is
    /// hard-locked and the candidate matches the stored one-time credential;
    /// the credential is cleared once the unlock commits.
    pub fn submit_unlock_attempt(&self, candidate: &str) -> bool {
        if self.terminal.load(Ordering::SeqCst) {
            return false;
        }
        let mut core = self.core.lock().expect("coordinator mutex poisoned");
        let snapshot = core.store.read();
        if snapshot.state != DeviceLockState::HardLocked {
            return false;
        }
        let stored = match core.store.credential_hash() {
            Ok(Some(hash)) => hash,
            _ => {
                debug!("Unlock attempt with no stored credential");
                return false;
            }
        };
        if !credential::verify(candidate, &stored) {
            let _ = core.store.append_audit(&AuditRecord {
                at: Utc::now(),
                prev_state: snapshot.state,
                next_state: snapshot.state,
                action: "pin_rejected".to_string(),
                success: false,
                detail: String::new(),
            });
            return false;
        }
        // Single-use: the transition clears the credential once the
        // unlocked state is durable. A failed write keeps both the lock
        // and the still-valid credential.
        let outcome = core.transition(
            DeviceLockState::Unlocked,
            LockReason::None,
            "",
            false,
            "pin_unlock",
        );
        // A fast-path transition invalidates the debounce window: a re-lock
        // directive right after a PIN unlock must not be collapsed
        core.last_applied = None;
        matches!(outcome, TransitionOutcome::Applied { .. })
    }

    /// Re-attempt enforcement when the durable state and the device-visible
    /// state disagree. Called from the periodic reconcile tick; enforcement
    /// failure here is still not fatal.
    pub fn reconcile_enforcement(&self) {
        let core = self.core.lock().expect("coordinator mutex poisoned");
        let snapshot = core.store.read();
        let active = core.enforcement.is_active();
        let (attempted, success) = match snapshot.state {
            DeviceLockState::HardLocked if !active => {
                (true, core.enforcement.apply_hard_lock(snapshot.reason))
            }
            DeviceLockState::SoftLocked if !active => {
                (true, core.enforcement.apply_soft_lock(snapshot.reason))
            }
            DeviceLockState::Unlocked | DeviceLockState::Deactivated if active => {
                (true, core.enforcement.clear_lock())
            }
            _ => (false, true),
        };
        if attempted {
            info!(state = %snapshot.state.as_str(), success, "Enforcement reconciled");
            let _ = core.store.append_audit(&AuditRecord {
                at: Utc::now(),
                prev_state: snapshot.state,
                next_state: snapshot.state,
                action: "reconcile_enforcement".to_string(),
                success,
                detail: String::new(),
            });
        }
    }

    /// Current durable snapshot.
    pub fn snapshot(&self) -> LockSnapshot {
        self.core
            .lock()
            .expect("coordinator mutex poisoned")
            .store
            .read()
    }

    fn apply(&self, directive: &LockDirective) -> TransitionOutcome {
        let mut core = self.core.lock().expect("coordinator mutex poisoned");

        // Keep the one-time unlock credential current regardless of whether
        // the transition itself is a no-op.
        if let Some(hash) = &directive.unlock_credential_hash {
            if let Err(e) = core.store.set_credential_hash(Some(hash)) {
                warn!(error = %e, "Failed to store unlock credential");
            }
        }

        if let Some((fingerprint, at)) = core.last_applied {
            if fingerprint == directive.fingerprint() && at.elapsed() < core.debounce {
                return TransitionOutcome::Debounced;
            }
        }

        let snapshot = core.store.read();
        if snapshot.state.is_terminal() {
            return TransitionOutcome::Terminal;
        }
        if snapshot.state == directive.target_state {
            // Idempotent under duplicate directives: no enforcement call
            core.last_applied = Some((directive.fingerprint(), Instant::now()));
            return TransitionOutcome::NoOp;
        }

        let outcome = match directive.target_state {
            DeviceLockState::HardLocked => core.transition(
                DeviceLockState::HardLocked,
                directive.reason,
                &directive.message,
                true,
                "hard_lock",
            ),
            DeviceLockState::SoftLocked => {
                if snapshot.state != DeviceLockState::Unlocked {
                    // A soft directive never weakens a hard lock
                    TransitionOutcome::Refused("soft lock only from unlocked")
                } else {
                    core.transition(
                        DeviceLockState::SoftLocked,
                        directive.reason,
                        &directive.message,
                        false,
                        "soft_lock",
                    )
                }
            }
            DeviceLockState::Unlocked => {
                if snapshot.is_server_independent() {
                    TransitionOutcome::Refused("tamper lock not cleared by server unlock")
                } else {
                    core.transition(DeviceLockState::Unlocked, LockReason::None, "", false, "unlock")
                }
            }
            DeviceLockState::Deactivating | DeviceLockState::Deactivated => {
                let outcome = core.deactivate(&directive.message);
                if matches!(outcome, TransitionOutcome::Applied { .. }) {
                    self.terminal.store(true, Ordering::SeqCst);
                }
                outcome
            }
        };

        if matches!(outcome, TransitionOutcome::Applied { .. } | TransitionOutcome::NoOp) {
            core.last_applied = Some((directive.fingerprint(), Instant::now()));
        }
        outcome
    }
}

impl Core {
    /// Apply one enforcement + store write + audit append. Enforcement
    /// failure does not abort the transition.
    fn transition(
        &mut self,
        target: DeviceLockState,
        reason: LockReason,
        message: &str,
        kiosk: bool,
        action: &str,
    ) -> TransitionOutcome {
        let prev = self.store.read();
        let enforced = match target {
            DeviceLockState::HardLocked => self.enforcement.apply_hard_lock(reason),
            DeviceLockState::SoftLocked => self.enforcement.apply_soft_lock(reason),
            _ => self.enforcement.clear_lock(),
        };
        if !enforced {
            warn!(target = %target.as_str(), "Enforcement adapter reported failure, state persisted anyway");
        }

        match self.store.write(target, reason, message, false, kiosk) {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Lock state write failed");
                return TransitionOutcome::Refused("state write failed");
            }
        }
        if target == DeviceLockState::Unlocked {
            let _ = self.store.set_credential_hash(None);
        }

        let _ = self.store.append_audit(&AuditRecord {
            at: Utc::now(),
            prev_state: prev.state,
            next_state: target,
            action: action.to_string(),
            success: enforced,
            detail: message.to_string(),
        });
        info!(
            from = %prev.state.as_str(),
            to = %target.as_str(),
            reason = %reason.as_str(),
            enforced,
            "Lock transition applied"
        );
        TransitionOutcome::Applied {
            from: prev.state,
            to: target,
        }
    }

    /// Terminal path: Deactivating, clear enforcement, Deactivated, and a
    /// queued confirmation so the backend eventually learns of it.
    fn deactivate(&mut self, message: &str) -> TransitionOutcome {
        let prev = self.store.read();
        if let Err(e) = self.store.write(
            DeviceLockState::Deactivating,
            LockReason::DeactivationRequested,
            message,
            false,
            false,
        ) {
            warn!(error = %e, "Deactivating write failed");
            return TransitionOutcome::Refused("state write failed");
        }

        let cleared = self.enforcement.clear_lock();
        if let Err(e) = self.store.write(
            DeviceLockState::Deactivated,
            LockReason::DeactivationRequested,
            message,
            true,
            false,
        ) {
            warn!(error = %e, "Deactivated write failed");
            return TransitionOutcome::Refused("state write failed");
        }
        let _ = self.store.set_credential_hash(None);

        let _ = self.store.append_audit(&AuditRecord {
            at: Utc::now(),
            prev_state: prev.state,
            next_state: DeviceLockState::Deactivated,
            action: "deactivate".to_string(),
            success: cleared,
            detail: message.to_string(),
        });

        let confirmation = OfflineEvent::new(
            OfflineEventType::DeactivationConfirmed,
            serde_json::json!({
                "previous_state": prev.state.as_str(),
                "detail": message,
                "at": Utc::now().to_rfc3339(),
            }),
        );
        if let Err(e) = self.queue.enqueue(&confirmation) {
            warn!(error = %e, "Failed to queue deactivation confirmation");
        }

        info!("Device deactivated, no further transitions accepted");
        TransitionOutcome::Applied {
            from: prev.state,
            to: DeviceLockState::Deactivated,
        }
    }
}
