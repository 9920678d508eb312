//! HeartbeatDirectiveInterpreter: raw server response to canonical directive
//!
//! Pure mapping with explicit precedence when multiple fields imply a lock
//! state:
//! 1. deactivation command
//! 2. administrative management status
//! 3. explicit hard/soft lock action booleans
//! 4. generic `is_locked` fallback
//!
//! Absence of any lock-implying field yields `Unlocked` only when the
//! current state is not server-independent: a tamper-forced lock is never
//! overridden by a heartbeat that merely fails to mention it. Malformed
//! responses yield `None` (dropped and logged), never a guessed state.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backend::HeartbeatResponse;
use crate::lock::{credential, DeviceLockState, LockReason, LockSnapshot};

use super::LockDirective;

const DEACTIVATE_COMMAND: &str = "DEACTIVATE_NOW";
const ADMIN_LOCK_MESSAGE: &str = "locked by administrator";

/// Map a raw heartbeat response to a canonical directive, or `None` when
/// the response is malformed or carries nothing actionable.
pub fn interpret(response: &HeartbeatResponse, current: &LockSnapshot) -> Option<LockDirective> {
    if !response.success {
        warn!("Dropping heartbeat response with success=false");
        return None;
    }

    let has_lock_field = response.management.is_some()
        || response.content.is_some()
        || response.actions.is_some()
        || response.deactivation.is_some();
    if !has_lock_field {
        warn!("Dropping heartbeat response with no lock-implying fields");
        return None;
    }

    let issued_at = command_issued_at(response).unwrap_or_else(Utc::now);
    let (nonce, sequence_number) = match &response.command {
        Some(cmd) => (Some(cmd.nonce.clone()), Some(cmd.sequence_number)),
        None => (None, None),
    };
    let unlock_credential_hash = response
        .next_payment
        .as_ref()
        .and_then(|p| p.unlock_password.as_deref())
        .map(credential::digest);
    let expires_at = response
        .next_payment
        .as_ref()
        .and_then(|p| p.date_time.as_deref())
        .and_then(parse_server_time);

    let base = |target: DeviceLockState, reason: LockReason, message: String| LockDirective {
        target_state: target,
        reason,
        message,
        unlock_credential_hash: unlock_credential_hash.clone(),
        expires_at,
        sequence_number,
        nonce: nonce.clone(),
        issued_at,
    };

    // 1. Deactivation wins over everything else.
    if let Some(deactivation) = &response.deactivation {
        if deactivation.command.as_deref() == Some(DEACTIVATE_COMMAND)
            || deactivation.status.as_deref() == Some("requested")
        {
            let message = deactivation
                .agent_notice
                .clone()
                .or_else(|| deactivation.reason.clone())
                .unwrap_or_else(|| "deactivation requested".to_string());
            return Some(base(
                DeviceLockState::Deactivating,
                LockReason::DeactivationRequested,
                message,
            ));
        }
    }

    // 2. Administrative status takes precedence over generic flags.
    if let Some(management) = &response.management {
        match management.status.as_deref() {
            Some("locked") => {
                let raw = management.reason.as_deref().unwrap_or("").trim();
                let (reason, message) = if raw.is_empty() {
                    (LockReason::Unknown, ADMIN_LOCK_MESSAGE.to_string())
                } else {
                    (map_reason(raw), raw.to_string())
                };
                return Some(base(DeviceLockState::HardLocked, reason, message));
            }
            Some("active") => {
                return unlock_directive(current, &base);
            }
            _ => {}
        }
    }

    // 3. Explicit action booleans.
    if let Some(actions) = &response.actions {
        let raw_reason = lock_reason_text(response);
        if actions.hard_lock {
            return Some(base(
                DeviceLockState::HardLocked,
                map_reason(&raw_reason),
                raw_reason,
            ));
        }
        if actions.soft_lock {
            let reason = if raw_reason.is_empty() {
                LockReason::PaymentReminder
            } else {
                map_reason(&raw_reason)
            };
            return Some(base(DeviceLockState::SoftLocked, reason, raw_reason));
        }
    }

    // 4. Generic is_locked fallback.
    if let Some(content) = &response.content {
        match content.is_locked {
            Some(true) => {
                let raw = content.reason.as_deref().unwrap_or("").trim().to_string();
                let (reason, message) = if raw.is_empty() {
                    (LockReason::Unknown, ADMIN_LOCK_MESSAGE.to_string())
                } else {
                    (map_reason(&raw), raw)
                };
                return Some(base(DeviceLockState::HardLocked, reason, message));
            }
            Some(false) => return unlock_directive(current, &base),
            None => {}
        }
    }

    // Blocks were present but none implied a state either way.
    debug!("Heartbeat response carried no actionable lock state");
    None
}

fn unlock_directive(
    current: &LockSnapshot,
    base: &dyn Fn(DeviceLockState, LockReason, String) -> LockDirective,
) -> Option<LockDirective> {
    if current.is_server_independent() {
        debug!("Ignoring server unlock: current lock is tamper-forced");
        return None;
    }
    Some(base(DeviceLockState::Unlocked, LockReason::None, String::new()))
}

fn lock_reason_text(response: &HeartbeatResponse) -> String {
    response
        .content
        .as_ref()
        .and_then(|c| c.reason.clone())
        .or_else(|| response.management.as_ref().and_then(|m| m.reason.clone()))
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Map the server's free-text reason to the canonical tag.
fn map_reason(raw: &str) -> LockReason {
    let lower = raw.to_lowercase();
    if lower.contains("payment") && lower.contains("overdue") {
        LockReason::PaymentOverdue
    } else if lower.contains("payment") && lower.contains("remind") {
        LockReason::PaymentReminder
    } else if lower.contains("security") || lower.contains("tamper") {
        LockReason::TamperDetected
    } else if lower.contains("sim") {
        LockReason::SimChange
    } else if lower.is_empty() {
        LockReason::None
    } else {
        LockReason::Unknown
    }
}

fn command_issued_at(response: &HeartbeatResponse) -> Option<DateTime<Utc>> {
    response
        .command
        .as_ref()
        .and_then(|c| parse_server_time(&c.issued_at))
        .or_else(|| response.server_time.as_deref().and_then(parse_server_time))
}

fn parse_server_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
