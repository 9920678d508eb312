//! Lock domain: state model, durable store, transition coordination
//!
//! `DeviceLockState` is mutated only by the `TransitionCoordinator` and
//! persisted through the `LockStateStore`. A write is effective the instant
//! it is durable; there is no separate pending state.

pub mod coordinator;
pub mod credential;
pub mod enforcement;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use coordinator::{TransitionCoordinator, TransitionOutcome};
pub use enforcement::{EnforcementAdapter, LoggingEnforcement};
pub use store::LockStateStore;

/// Authoritative device lock state. `Deactivated` is terminal;
/// reactivation is backend-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLockState {
    Unlocked,
    SoftLocked,
    HardLocked,
    Deactivating,
    Deactivated,
}

impl DeviceLockState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceLockState::Deactivated)
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, DeviceLockState::SoftLocked | DeviceLockState::HardLocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceLockState::Unlocked => "unlocked",
            DeviceLockState::SoftLocked => "soft_locked",
            DeviceLockState::HardLocked => "hard_locked",
            DeviceLockState::Deactivating => "deactivating",
            DeviceLockState::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unlocked" => Some(DeviceLockState::Unlocked),
            "soft_locked" => Some(DeviceLockState::SoftLocked),
            "hard_locked" => Some(DeviceLockState::HardLocked),
            "deactivating" => Some(DeviceLockState::Deactivating),
            "deactivated" => Some(DeviceLockState::Deactivated),
            _ => None,
        }
    }
}

/// Why a state was entered. Always paired with a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    PaymentOverdue,
    TamperDetected,
    DeactivationRequested,
    PaymentReminder,
    SimChange,
    Unknown,
    None,
}

impl LockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::PaymentOverdue => "payment_overdue",
            LockReason::TamperDetected => "tamper_detected",
            LockReason::DeactivationRequested => "deactivation_requested",
            LockReason::PaymentReminder => "payment_reminder",
            LockReason::SimChange => "sim_change",
            LockReason::Unknown => "unknown",
            LockReason::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "payment_overdue" => LockReason::PaymentOverdue,
            "tamper_detected" => LockReason::TamperDetected,
            "deactivation_requested" => LockReason::DeactivationRequested,
            "payment_reminder" => LockReason::PaymentReminder,
            "sim_change" => LockReason::SimChange,
            "none" => LockReason::None,
            _ => LockReason::Unknown,
        }
    }
}

/// Point-in-time view of the durable lock record. Cheap to clone;
/// distributed to subscribers in commit order via a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub state: DeviceLockState,
    pub reason: LockReason,
    pub message: String,
    pub permanent: bool,
    pub kiosk_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl LockSnapshot {
    /// A lock the server did not order and must not silently override
    /// (tamper-forced locks survive heartbeats that fail to mention them).
    pub fn is_server_independent(&self) -> bool {
        self.state.is_locked() && self.reason == LockReason::TamperDetected
    }
}

/// One audit row per applied (or refused) transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub prev_state: DeviceLockState,
    pub next_state: DeviceLockState,
    pub action: String,
    pub success: bool,
    pub detail: String,
}
