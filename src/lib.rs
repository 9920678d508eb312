//! custos-agent: persistent device-management agent runtime
//!
//! The agent turns untrusted, possibly-delayed, possibly-duplicated server
//! directives and local tamper signals into a single authoritative device
//! lock state, applies that state durably and idempotently, and queues
//! unsent events for later delivery.
//!
//! Core pieces:
//! - Lock state store + transition coordinator (single source of truth)
//! - Tamper response fast path (local lock before any network call)
//! - Offline event queue with backoff delivery
//! - Replay guard for admin command freshness/uniqueness
//! - Identity consistency repair across two storage domains

pub mod agent;
pub mod backend;
pub mod config;
pub mod directive;
pub mod error;
pub mod events;
pub mod identity;
pub mod lock;
pub mod tamper;

/// Current version of this agent binary
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");
