//! OfflineEventQueue: durable FIFO for events that could not be delivered
//!
//! Append-only SQLite store. Enqueue never blocks on network. Events are
//! drained oldest-first in bounded batches, retried with per-event
//! exponential backoff, and deleted only after confirmed delivery plus a
//! retention window (the single deletion path).

pub mod delivery;

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub use delivery::DeliveryWorker;

/// Delivery status of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "synced" => SyncStatus::Synced,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }
}

/// Kinds of facts that must eventually reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineEventType {
    TamperNotification,
    DeactivationConfirmed,
    IdentityConflict,
}

impl OfflineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineEventType::TamperNotification => "tamper_notification",
            OfflineEventType::DeactivationConfirmed => "deactivation_confirmed",
            OfflineEventType::IdentityConflict => "identity_conflict",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "tamper_notification" => Some(OfflineEventType::TamperNotification),
            "deactivation_confirmed" => Some(OfflineEventType::DeactivationConfirmed),
            "identity_conflict" => Some(OfflineEventType::IdentityConflict),
            _ => None,
        }
    }
}

/// A durable record of an unsent fact. The id doubles as the idempotency
/// identity: the server acknowledging a repeated id is success, not error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEvent {
    pub id: String,
    pub event_type: OfflineEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: SyncStatus,
}

impl OfflineEvent {
    pub fn new(event_type: OfflineEventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            payload,
            created_at: Utc::now(),
            attempt_count: 0,
            status: SyncStatus::Pending,
        }
    }

    /// Body posted to the backend events endpoint.
    pub fn wire_body(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "event_type": self.event_type.as_str(),
            "payload": self.payload,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

pub struct OfflineEventQueue {
    db: Mutex<Connection>,
}

impl OfflineEventQueue {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("offline_events.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS offline_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                synced_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_offline_events_status
                ON offline_events (status, next_attempt_at, created_at);",
        )?;

        info!(path = %db_path.display(), "Offline event queue opened");
        Ok(Self { db: Mutex::new(db) })
    }

    /// Append an event. Never touches the network.
    pub fn enqueue(&self, event: &OfflineEvent) -> Result<()> {
        let db = self.db.lock().expect("event queue mutex poisoned");
        db.execute(
            "INSERT OR IGNORE INTO offline_events
                (id, event_type, payload, created_at, attempt_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                event.id,
                event.event_type.as_str(),
                event.payload.to_string(),
                event.created_at.timestamp(),
                event.attempt_count,
                event.status.as_str()
            ],
        )?;
        debug!(id = %event.id, event_type = %event.event_type.as_str(), "Event enqueued");
        Ok(())
    }

    /// Oldest-first pending events whose backoff window has elapsed, up to
    /// the batch size.
    pub fn drain_batch(&self, n: usize) -> Result<Vec<OfflineEvent>> {
        let now = Utc::now().timestamp();
        let db = self.db.lock().expect("event queue mutex poisoned");
        let mut stmt = db.prepare_cached(
            "SELECT id, event_type, payload, created_at, attempt_count, status
             FROM offline_events
             WHERE status != 'synced' AND next_attempt_at <= ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![now, n as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, event_type, payload, created_at, attempt_count, status) = row?;
            let Some(event_type) = OfflineEventType::parse(&event_type) else {
                continue;
            };
            events.push(OfflineEvent {
                id,
                event_type,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                created_at: Utc
                    .timestamp_opt(created_at, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                attempt_count,
                status: SyncStatus::parse(&status),
            });
        }
        Ok(events)
    }

    /// Confirmed delivery. The event stays until retention GC removes it;
    /// the retention window starts now, not at creation.
    pub fn mark_synced(&self, id: &str) -> Result<()> {
        let db = self.db.lock().expect("event queue mutex poisoned");
        db.execute(
            "UPDATE offline_events SET status = 'synced', synced_at = ?2 WHERE id = ?1",
            rusqlite::params![id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Failed attempt: bump the attempt count and push the next attempt out
    /// with exponential backoff (capped).
    pub fn mark_failed(&self, id: &str, backoff_base_secs: u64, backoff_max_secs: u64) -> Result<()> {
        let db = self.db.lock().expect("event queue mutex poisoned");
        let attempts: u32 = db.query_row(
            "SELECT attempt_count FROM offline_events WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let backoff = backoff_base_secs
            .saturating_mul(1u64 << attempts.min(16))
            .min(backoff_max_secs);
        let next = Utc::now().timestamp() + backoff as i64;
        db.execute(
            "UPDATE offline_events
             SET attempt_count = attempt_count + 1, next_attempt_at = ?2, status = 'failed'
             WHERE id = ?1",
            rusqlite::params![id, next],
        )?;
        debug!(id, attempts = attempts + 1, backoff_secs = backoff, "Event delivery failed");
        Ok(())
    }

    /// Purge events synced longer ago than the retention window. This is
    /// the only deletion path.
    pub fn purge_synced(&self, retention_secs: u64) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - retention_secs as i64;
        let db = self.db.lock().expect("event queue mutex poisoned");
        let purged = db.execute(
            "DELETE FROM offline_events
             WHERE status = 'synced' AND synced_at IS NOT NULL AND synced_at < ?1",
            [cutoff],
        )?;
        if purged > 0 {
            debug!(purged, "Purged synced events past retention");
        }
        Ok(purged)
    }

    /// Number of events not yet confirmed delivered.
    pub fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().expect("event queue mutex poisoned");
        let count: i64 = db.query_row(
            "SELECT count(*) FROM offline_events WHERE status != 'synced'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Pending events of one type (diagnostics and tests).
    pub fn pending_of_type(&self, event_type: OfflineEventType) -> Result<usize> {
        let db = self.db.lock().expect("event queue mutex poisoned");
        let count: i64 = db.query_row(
            "SELECT count(*) FROM offline_events WHERE status != 'synced' AND event_type = ?1",
            [event_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    #[cfg(test)]
    fn backdate_synced(&self, id: &str, synced_at: i64) {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE offline_events SET synced_at = ?2 WHERE id = ?1",
            rusqlite::params![id, synced_at],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn enqueue_and_drain_oldest_first() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineEventQueue::open(dir.path()).unwrap();

        let mut first = OfflineEvent::new(
            OfflineEventType::TamperNotification,
            serde_json::json!({"kind": "root_detected"}),
        );
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = OfflineEvent::new(
            OfflineEventType::DeactivationConfirmed,
            serde_json::json!({}),
        );
        queue.enqueue(&second).unwrap();
        queue.enqueue(&first).unwrap();

        let batch = queue.drain_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first.id);
        assert_eq!(batch[1].id, second.id);
    }

    #[test]
    fn mark_failed_applies_backoff() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineEventQueue::open(dir.path()).unwrap();
        let event = OfflineEvent::new(OfflineEventType::TamperNotification, serde_json::json!({}));
        queue.enqueue(&event).unwrap();

        queue.mark_failed(&event.id, 30, 3600).unwrap();
        // Backoff pushes the event out of the drainable window
        assert!(queue.drain_batch(10).unwrap().is_empty());
        assert_eq!(queue.pending_count().unwrap(), 1);
    }

    #[test]
    fn synced_events_leave_the_drain_set_and_get_purged() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineEventQueue::open(dir.path()).unwrap();
        let mut event = OfflineEvent::new(OfflineEventType::TamperNotification, serde_json::json!({}));
        event.created_at = Utc::now() - chrono::Duration::days(30);
        queue.enqueue(&event).unwrap();

        queue.mark_synced(&event.id).unwrap();
        assert!(queue.drain_batch(10).unwrap().is_empty());
        assert_eq!(queue.pending_count().unwrap(), 0);

        // Retention runs from delivery, not creation: an event that sat
        // queued for weeks is not purged the moment it finally syncs
        assert_eq!(queue.purge_synced(7 * 24 * 3600).unwrap(), 0);

        queue.backdate_synced(&event.id, (Utc::now() - chrono::Duration::days(8)).timestamp());
        assert_eq!(queue.purge_synced(7 * 24 * 3600).unwrap(), 1);
    }

    #[test]
    fn enqueue_is_idempotent_on_id() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineEventQueue::open(dir.path()).unwrap();
        let event = OfflineEvent::new(OfflineEventType::IdentityConflict, serde_json::json!({}));
        queue.enqueue(&event).unwrap();
        queue.enqueue(&event).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 1);
    }
}
