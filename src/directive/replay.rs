//! ReplayGuard: freshness and uniqueness validation for admin commands
//!
//! Accepts a command only when all three hold:
//! - issued_at is within the freshness window of local now
//! - the nonce has never been seen
//! - the sequence number is strictly greater than the last accepted one
//!
//! The nonce set is bounded with oldest-first eviction; it is never cleared
//! wholesale, so the protected window never fully reopens. Nonce record,
//! sequence advance and eviction commit in one transaction, persisted so
//! replay protection survives restarts. A storage failure refuses the
//! command: a nonce that could not be recorded is never acted on.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

/// Why a command was refused. Dropped and logged, never surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayRejection {
    #[error("command issued_at outside freshness window ({age_secs}s old)")]
    Stale { age_secs: i64 },

    #[error("nonce already seen: {0}")]
    DuplicateNonce(String),

    #[error("sequence {got} not greater than last accepted {last}")]
    SequenceRegression { got: u64, last: u64 },

    #[error("replay state not persisted: {0}")]
    Persistence(String),
}

pub struct ReplayGuard {
    db: Mutex<Connection>,
    freshness_window_secs: i64,
    nonce_capacity: usize,
}

impl ReplayGuard {
    pub fn open(data_dir: &Path, freshness_window_secs: u64, nonce_capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("replay_guard.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS replay_nonces (
                nonce TEXT PRIMARY KEY,
                seen_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_replay_nonces_seen_at ON replay_nonces (seen_at);
            CREATE TABLE IF NOT EXISTS replay_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sequence INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        db.execute("INSERT OR IGNORE INTO replay_meta (id, last_sequence) VALUES (1, 0)", [])?;

        Ok(Self {
            db: Mutex::new(db),
            freshness_window_secs: freshness_window_secs as i64,
            nonce_capacity,
        })
    }

    /// Validate a command envelope. On acceptance the nonce is recorded and
    /// the sequence advanced, atomically with respect to concurrent calls.
    pub fn accept(
        &self,
        nonce: &str,
        sequence_number: u64,
        issued_at: DateTime<Utc>,
    ) -> Result<(), ReplayRejection> {
        let age = (Utc::now() - issued_at).num_seconds();
        if age.abs() > self.freshness_window_secs {
            return Err(ReplayRejection::Stale { age_secs: age });
        }

        let mut db = self.db.lock().expect("replay guard mutex poisoned");

        let last: u64 = db
            .query_row("SELECT last_sequence FROM replay_meta WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|v| v as u64)
            .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        if sequence_number <= last {
            return Err(ReplayRejection::SequenceRegression {
                got: sequence_number,
                last,
            });
        }

        let seen: bool = db
            .query_row(
                "SELECT count(*) FROM replay_nonces WHERE nonce = ?1",
                [nonce],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        if seen {
            return Err(ReplayRejection::DuplicateNonce(nonce.to_string()));
        }

        // Accept: record nonce, advance sequence, evict oldest past capacity,
        // all in one transaction. Any failure refuses the command so the
        // nonce can never be executed without being recorded.
        // Sequence numbers are at most i64 on the wire; sqlite stores i64.
        let tx = db
            .transaction()
            .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        tx.execute(
            "INSERT INTO replay_nonces (nonce, seen_at) VALUES (?1, ?2)",
            rusqlite::params![nonce, Utc::now().timestamp()],
        )
        .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        tx.execute(
            "UPDATE replay_meta SET last_sequence = ?1 WHERE id = 1",
            rusqlite::params![sequence_number as i64],
        )
        .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        tx.execute(
            "DELETE FROM replay_nonces WHERE nonce IN (
                SELECT nonce FROM replay_nonces ORDER BY seen_at ASC, nonce ASC
                LIMIT max(0, (SELECT count(*) FROM replay_nonces) - ?1)
            )",
            rusqlite::params![self.nonce_capacity as i64],
        )
        .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;
        tx.commit()
            .map_err(|e| ReplayRejection::Persistence(e.to_string()))?;

        debug!(nonce, sequence_number, "Replay guard accepted command");
        Ok(())
    }

    /// Last accepted sequence number (0 when none accepted yet).
    pub fn last_sequence(&self) -> u64 {
        let db = self.db.lock().expect("replay guard mutex poisoned");
        db.query_row("SELECT last_sequence FROM replay_meta WHERE id = 1", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|v| v as u64)
        .unwrap_or(0)
    }

    #[cfg(test)]
    fn nonce_count(&self) -> usize {
        let db = self.db.lock().unwrap();
        db.query_row("SELECT count(*) FROM replay_nonces", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    /// Makes every subsequent nonce write fail, simulating storage loss.
    #[cfg(test)]
    fn break_nonce_storage(&self) {
        let db = self.db.lock().unwrap();
        db.execute_batch("DROP TABLE replay_nonces;").unwrap();
    }
}
