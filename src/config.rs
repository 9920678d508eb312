//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Server-assigned device identifier
    pub id: String,

    /// Data directory (boot-time storage domain)
    pub data_dir: PathBuf,

    /// Credential-gated directory (available after first unlock)
    #[serde(default = "default_protected_dir")]
    pub protected_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Management server base URL
    pub url: String,

    /// Shared device agent API key
    pub api_key: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Reconciliation/drain interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Maximum offline events delivered per cycle
    #[serde(default = "default_drain_batch")]
    pub drain_batch_size: usize,

    /// Per-event backoff base in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Per-event backoff cap in seconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// How long synced events are retained before GC, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            drain_batch_size: default_drain_batch(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            retention_secs: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Freshness window for admin commands in seconds
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,

    /// Bounded nonce set capacity
    #[serde(default = "default_nonce_capacity")]
    pub nonce_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: default_freshness_window(),
            nonce_capacity: default_nonce_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Debounce window for duplicate directives in milliseconds
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

// Defaults
fn default_protected_dir() -> PathBuf {
    PathBuf::from("/var/lib/custos/protected")
}
fn default_request_timeout() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconcile_interval() -> u64 {
    300
}
fn default_drain_batch() -> usize {
    25
}
fn default_backoff_base() -> u64 {
    30
}
fn default_backoff_max() -> u64 {
    3600
}
fn default_retention() -> u64 {
    7 * 24 * 3600
}
fn default_freshness_window() -> u64 {
    300
}
fn default_nonce_capacity() -> usize {
    1024
}
fn default_debounce() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                id: "unregistered".to_string(),
                data_dir: PathBuf::from("/var/lib/custos"),
                protected_dir: default_protected_dir(),
            },
            backend: BackendConfig {
                url: "https://localhost:8000".to_string(),
                api_key: String::new(),
                request_timeout_secs: default_request_timeout(),
            },
            heartbeat: HeartbeatConfig::default(),
            reconcile: ReconcileConfig::default(),
            replay: ReplayConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}
