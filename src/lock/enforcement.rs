//! Enforcement adapter boundary
//!
//! The adapter is the opaque capability that actually changes device-visible
//! lock behavior (OS restrictions, kiosk overlay, etc). Implementations must
//! be idempotent and non-throwing: failure is a `false` return, never a
//! panic, and is retried by the reconciliation tick.

use tracing::info;

use super::LockReason;

pub trait EnforcementAdapter: Send + Sync {
    /// Apply the hard lock. Returns false on failure.
    fn apply_hard_lock(&self, reason: LockReason) -> bool;

    /// Apply the soft lock (reminder overlay, no kiosk). Returns false on failure.
    fn apply_soft_lock(&self, reason: LockReason) -> bool;

    /// Remove any lock. Returns false on failure.
    fn clear_lock(&self) -> bool;

    /// Whether a lock is currently enforced on the device.
    fn is_active(&self) -> bool;
}

/// Default adapter for platforms without an enforcement backend wired in.
/// Logs what would happen and reports success.
pub struct LoggingEnforcement;

impl EnforcementAdapter for LoggingEnforcement {
    fn apply_hard_lock(&self, reason: LockReason) -> bool {
        info!(reason = %reason.as_str(), "Enforcement: hard lock applied");
        true
    }

    fn apply_soft_lock(&self, reason: LockReason) -> bool {
        info!(reason = %reason.as_str(), "Enforcement: soft lock applied");
        true
    }

    fn clear_lock(&self) -> bool {
        info!("Enforcement: lock cleared");
        true
    }

    fn is_active(&self) -> bool {
        false
    }
}
