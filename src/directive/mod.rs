//! Canonical lock directives
//!
//! A `LockDirective` is the only representation of a server instruction the
//! coordinator consumes. It is produced exclusively by the interpreter,
//! no other component re-interprets raw heartbeat payloads.

pub mod interpreter;
pub mod replay;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::{DeviceLockState, LockReason};

pub use interpreter::interpret;

/// Typed, validated server instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDirective {
    pub target_state: DeviceLockState,
    pub reason: LockReason,
    pub message: String,
    /// One-time unlock credential, already digested (plaintext is dropped
    /// at ingestion).
    pub unlock_credential_hash: Option<String>,
    /// When the current payment window ends, if the server sent one.
    pub expires_at: Option<DateTime<Utc>>,
    /// Admin command replay envelope, when present.
    pub sequence_number: Option<u64>,
    pub nonce: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl LockDirective {
    /// Whether this directive carries a replay envelope and must pass the
    /// replay guard before it is acted on.
    pub fn has_replay_envelope(&self) -> bool {
        self.nonce.is_some() || self.sequence_number.is_some()
    }

    /// Fingerprint used by the coordinator's debounce window to collapse
    /// bursts of duplicate directives.
    pub fn fingerprint(&self) -> (DeviceLockState, LockReason) {
        (self.target_state, self.reason)
    }
}
