//! Backend boundary: heartbeat delivery and offline event upload
//!
//! The `Backend` trait abstracts the management server so the coordination
//! core never touches HTTP directly. All calls carry timeouts; a timeout is
//! a delivery failure, not an indeterminate state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::OfflineEvent;
use crate::lock::DeviceLockState;

/// Errors from backend communication.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected response: {0}")]
    ParseError(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_connect() {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::RequestFailed(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Status report posted on every heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub device_id: String,
    pub agent_version: String,
    pub lock_state: DeviceLockState,
    pub pending_events: usize,
}

/// Raw heartbeat response envelope. Many fields overlap; only the
/// interpreter assigns meaning (and precedence) to them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub management: Option<ManagementBlock>,
    #[serde(default)]
    pub content: Option<LockContent>,
    #[serde(default)]
    pub actions: Option<LockActions>,
    #[serde(default)]
    pub server_time: Option<String>,
    #[serde(default)]
    pub next_payment: Option<NextPayment>,
    #[serde(default)]
    pub deactivation: Option<Deactivation>,
    #[serde(default)]
    pub command: Option<AdminCommand>,
}

/// Administrative management status ("locked" / "active").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagementBlock {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_locked: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Generic lock content block (`is_locked` fallback).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockContent {
    #[serde(default)]
    pub is_locked: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Explicit lock action booleans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockActions {
    #[serde(default)]
    pub hard_lock: bool,
    #[serde(default)]
    pub soft_lock: bool,
}

/// Next payment window plus the one-time unlock credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextPayment {
    #[serde(default)]
    pub date_time: Option<String>,
    #[serde(default)]
    pub unlock_password: Option<String>,
}

/// Deactivation block. `command == "DEACTIVATE_NOW"` requests the terminal
/// transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deactivation {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub agent_notice: Option<String>,
}

/// Admin command envelope carrying the replay validation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCommand {
    pub nonce: String,
    pub sequence_number: u64,
    pub issued_at: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Acknowledgement for an uploaded offline event. A duplicate ack means the
/// server already has this idempotency id; treated as success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub accepted: bool,
    #[serde(default)]
    pub duplicate: bool,
}

impl DeliveryAck {
    pub fn is_success(&self) -> bool {
        self.accepted || self.duplicate
    }
}

// ---------------------------------------------------------------------------
// Backend trait + HTTP implementation
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Backend: Send + Sync {
    /// Post a heartbeat report and return the server's response envelope.
    async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<HeartbeatResponse, BackendError>;

    /// Deliver one offline event. Idempotent on the event id.
    async fn deliver_event(&self, event: &OfflineEvent) -> Result<DeliveryAck, BackendError>;
}

/// HTTP backend talking to the management server. Authenticates with the
/// shared device API key header.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    device_id: String,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        device_id: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<HeartbeatResponse, BackendError> {
        let url = format!("{}/api/devices/{}/data/", self.base_url, self.device_id);
        let response = self
            .client
            .post(&url)
            .header("X-Device-Api-Key", &self.api_key)
            .json(report)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::RequestFailed(format!("HTTP {}", response.status())));
        }

        let envelope: HeartbeatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))?;
        debug!(success = envelope.success, "Heartbeat response received");
        Ok(envelope)
    }

    async fn deliver_event(&self, event: &OfflineEvent) -> Result<DeliveryAck, BackendError> {
        let url = format!("{}/api/devices/{}/events/", self.base_url, self.device_id);
        let response = self
            .client
            .post(&url)
            .header("X-Device-Api-Key", &self.api_key)
            .json(&event.wire_body())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::RequestFailed(format!("HTTP {}", response.status())));
        }

        let ack: DeliveryAck = response
            .json()
            .await
            .map_err(|e| BackendError::ParseError(e.to_string()))?;
        Ok(ack)
    }
}
