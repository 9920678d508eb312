//! TamperResponseCoordinator: local lock before any network interaction
//!
//! The central safety property of the agent: when a high-severity tamper
//! signal arrives, local enforcement is applied and durable before the
//! backend notification is even attempted. The notification is
//! fire-and-forget; on failure it lands in the offline queue. An offline,
//! tampered device still becomes locked.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::events::{OfflineEvent, OfflineEventQueue, OfflineEventType};
use crate::lock::{LockReason, TransitionCoordinator, TransitionOutcome};

/// What a detector observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperKind {
    RootDetected,
    BootloaderUnlocked,
    CustomRom,
    UsbDebugging,
    DeveloperMode,
    SimChanged,
}

impl TamperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TamperKind::RootDetected => "ROOT_DETECTED",
            TamperKind::BootloaderUnlocked => "BOOTLOADER_UNLOCKED",
            TamperKind::CustomRom => "CUSTOM_ROM",
            TamperKind::UsbDebugging => "USB_DEBUGGING",
            TamperKind::DeveloperMode => "DEVELOPER_MODE",
            TamperKind::SimChanged => "SIM_CHANGED",
        }
    }

    fn lock_reason(&self) -> LockReason {
        match self {
            TamperKind::SimChanged => LockReason::SimChange,
            _ => LockReason::TamperDetected,
        }
    }
}

/// Ordered severity. `High` and above forces the hard lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TamperSignal {
    pub kind: TamperKind,
    pub severity: Severity,
    pub description: String,
}

/// Outcome handed back to the detector. `notification` is the in-flight
/// backend call; callers on the monitoring path just drop it.
pub struct TamperResponse {
    pub locked: bool,
    pub notification: Option<JoinHandle<()>>,
}

pub struct TamperResponseCoordinator {
    coordinator: Arc<TransitionCoordinator>,
    queue: Arc<OfflineEventQueue>,
    backend: Arc<dyn Backend>,
}

impl TamperResponseCoordinator {
    pub fn new(
        coordinator: Arc<TransitionCoordinator>,
        queue: Arc<OfflineEventQueue>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            coordinator,
            queue,
            backend,
        }
    }

    /// Respond to a tamper signal. The local lock happens synchronously,
    /// before this function returns and before any network call starts.
    pub fn respond_to_tamper(&self, signal: TamperSignal) -> TamperResponse {
        info!(
            kind = %signal.kind.as_str(),
            severity = ?signal.severity,
            "Tamper signal received"
        );

        let locked = if signal.severity >= Severity::High {
            let outcome = self
                .coordinator
                .force_hard_lock(signal.kind.lock_reason(), &signal.description);
            match outcome {
                TransitionOutcome::Applied { .. } => true,
                TransitionOutcome::NoOp => true, // already locked for this reason
                other => {
                    warn!(outcome = ?other, "Tamper lock not applied");
                    false
                }
            }
        } else {
            debug!("Severity below hard-lock threshold, notification only");
            false
        };

        let event = OfflineEvent::new(
            OfflineEventType::TamperNotification,
            serde_json::json!({
                "kind": signal.kind.as_str(),
                "severity": signal.severity,
                "description": signal.description,
                "locked": locked,
                "detected_at": Utc::now().to_rfc3339(),
            }),
        );

        // Fire-and-forget: delivery failure degrades to the offline queue,
        // never delays or unwinds the local lock.
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        let notification = tokio::spawn(async move {
            match backend.deliver_event(&event).await {
                Ok(ack) if ack.is_success() => {
                    debug!(id = %event.id, "Tamper notification delivered");
                }
                Ok(_) | Err(_) => {
                    if let Err(e) = queue.enqueue(&event) {
                        warn!(error = %e, "Failed to queue tamper notification");
                    } else {
                        debug!(id = %event.id, "Tamper notification queued for later delivery");
                    }
                }
            }
        });

        TamperResponse {
            locked,
            notification: Some(notification),
        }
    }
}
