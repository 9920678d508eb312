//! Agent error taxonomy
//!
//! No error here terminates the process: every failure path leaves the
//! system in its last-known-durable state and relies on the periodic
//! reconciliation tick to converge.

use crate::directive::replay::ReplayRejection;

/// Errors raised by the lock coordination core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The enforcement adapter reported failure. Recoverable: the state
    /// store is still updated and the next reconciliation tick retries.
    #[error("Enforcement failed: {0}")]
    EnforcementFailure(String),

    /// Network delivery failed or timed out. Degrades to offline-queue
    /// persistence with backoff.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// An admin command failed replay validation. Dropped and logged.
    #[error("Replay rejected: {0}")]
    ReplayRejected(#[from] ReplayRejection),

    /// A server response could not be mapped to a directive. Discarded,
    /// prior state retained.
    #[error("Malformed directive: {0}")]
    MalformedDirective(String),

    /// The two identity storage domains disagree. Surfaced as a
    /// high-severity diagnostic, never auto-resolved by guessing.
    #[error("Identity conflict: device domain has {device}, protected domain has {protected}")]
    IdentityConflict { device: String, protected: String },

    /// A storage domain could not be read or written.
    #[error("Identity domain error: {0}")]
    IdentityDomain(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
