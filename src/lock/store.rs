//! LockStateStore: durable single source of truth for the lock state
//!
//! SQLite-backed single-row record. Writers serialize through one mutex;
//! readers get a lock-free snapshot from a watch channel, and subscribers
//! observe transitions in commit order without polling.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{AuditRecord, DeviceLockState, LockReason, LockSnapshot};

pub struct LockStateStore {
    db: Mutex<Connection>,
    snapshot_tx: watch::Sender<LockSnapshot>,
}

impl LockStateStore {
    /// Open or create the store. A fresh device starts `Unlocked` with no
    /// reason, the permanent operational record created at registration.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("lock_state.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        // WAL for concurrent read access
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS lock_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL,
                reason TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                permanent INTEGER NOT NULL DEFAULT 0,
                kiosk_active INTEGER NOT NULL DEFAULT 0,
                credential_hash TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at INTEGER NOT NULL,
                prev_state TEXT NOT NULL,
                next_state TEXT NOT NULL,
                action TEXT NOT NULL,
                success INTEGER NOT NULL,
                detail TEXT NOT NULL DEFAULT ''
            );",
        )?;

        db.execute(
            "INSERT OR IGNORE INTO lock_state (id, state, reason, updated_at)
             VALUES (1, 'unlocked', 'none', strftime('%s', 'now'))",
            [],
        )?;

        let snapshot = Self::read_row(&db)?;
        info!(path = %db_path.display(), state = %snapshot.state.as_str(), "Lock state store opened");

        let (snapshot_tx, _) = watch::channel(snapshot);
        Ok(Self {
            db: Mutex::new(db),
            snapshot_tx,
        })
    }

    fn read_row(db: &Connection) -> Result<LockSnapshot> {
        let row = db.query_row(
            "SELECT state, reason, message, permanent, kiosk_active, updated_at
             FROM lock_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;
        let state = DeviceLockState::parse(&row.0)
            .with_context(|| format!("unknown lock state in store: {}", row.0))?;
        Ok(LockSnapshot {
            state,
            reason: LockReason::parse(&row.1),
            message: row.2,
            permanent: row.3,
            kiosk_active: row.4,
            updated_at: Utc.timestamp_opt(row.5, 0).single().unwrap_or_else(Utc::now),
        })
    }

    /// Current snapshot without touching the database.
    pub fn read(&self) -> LockSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to transitions. Subscribers see writes in commit order.
    pub fn subscribe(&self) -> watch::Receiver<LockSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Atomic single-writer update. Durable before the new snapshot is
    /// published to subscribers.
    pub fn write(
        &self,
        state: DeviceLockState,
        reason: LockReason,
        message: &str,
        permanent: bool,
        kiosk_active: bool,
    ) -> Result<LockSnapshot> {
        let now = Utc::now();
        let db = self.db.lock().expect("lock store mutex poisoned");
        db.execute(
            "UPDATE lock_state
             SET state = ?1, reason = ?2, message = ?3, permanent = ?4,
                 kiosk_active = ?5, updated_at = ?6
             WHERE id = 1",
            rusqlite::params![
                state.as_str(),
                reason.as_str(),
                message,
                permanent,
                kiosk_active,
                now.timestamp()
            ],
        )?;
        let snapshot = LockSnapshot {
            state,
            reason,
            message: message.to_string(),
            permanent,
            kiosk_active,
            updated_at: now,
        };
        debug!(state = %state.as_str(), reason = %reason.as_str(), "Lock state written");
        self.snapshot_tx.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Store the digest of the current one-time unlock credential,
    /// replacing any previous one. `None` clears it.
    pub fn set_credential_hash(&self, hash: Option<&str>) -> Result<()> {
        let db = self.db.lock().expect("lock store mutex poisoned");
        db.execute(
            "UPDATE lock_state SET credential_hash = ?1 WHERE id = 1",
            rusqlite::params![hash],
        )?;
        Ok(())
    }

    pub fn credential_hash(&self) -> Result<Option<String>> {
        let db = self.db.lock().expect("lock store mutex poisoned");
        let hash = db.query_row(
            "SELECT credential_hash FROM lock_state WHERE id = 1",
            [],
            |row| row.get::<_, Option<String>>(0),
        )?;
        Ok(hash)
    }

    /// Makes any write that would leave the lock fail, simulating a storage
    /// fault on the unlock path.
    #[cfg(test)]
    pub(crate) fn fail_unlock_writes(&self) {
        let db = self.db.lock().unwrap();
        db.execute_batch(
            "CREATE TRIGGER fail_unlock BEFORE UPDATE ON lock_state
             WHEN NEW.state = 'unlocked' BEGIN
                 SELECT RAISE(ABORT, 'simulated storage fault');
             END;",
        )
        .unwrap();
    }

    /// Append one audit row. Consulted for diagnosis, never for control flow.
    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let db = self.db.lock().expect("lock store mutex poisoned");
        db.execute(
            "INSERT INTO audit_log (at, prev_state, next_state, action, success, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.at.timestamp(),
                record.prev_state.as_str(),
                record.next_state.as_str(),
                record.action,
                record.success,
                record.detail
            ],
        )?;
        Ok(())
    }

    /// Most recent audit rows, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().expect("lock store mutex poisoned");
        let mut stmt = db.prepare_cached(
            "SELECT at, prev_state, next_state, action, success, detail
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (at, prev, next, action, success, detail) = row?;
            records.push(AuditRecord {
                at: Utc.timestamp_opt(at, 0).single().unwrap_or_else(Utc::now),
                prev_state: DeviceLockState::parse(&prev).unwrap_or(DeviceLockState::Unlocked),
                next_state: DeviceLockState::parse(&next).unwrap_or(DeviceLockState::Unlocked),
                action,
                success,
                detail,
            });
        }
        Ok(records)
    }
}
