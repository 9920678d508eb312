//! Identity record and two-domain consistency repair
//!
//! The server-assigned device identifier is written to two storage domains
//! with different availability windows: the device store is readable from
//! first boot; the protected store only becomes available once its
//! credential-gated directory is mounted. Once non-null in either domain
//! the value is immutable and must eventually be mirrored into both.
//!
//! Repair runs at process start and opportunistically after writes. When
//! the domains disagree this is surfaced as `IdentityConflict` and never
//! silently resolved by preferring one side.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::AgentError;

/// A named storage domain holding at most one identity record.
pub trait IdentityDomain: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the domain can be read/written right now.
    fn is_available(&self) -> bool;

    fn read_identity(&self) -> Result<Option<String>>;

    /// Write-once: callers must not overwrite a differing value.
    fn write_identity(&self, device_id: &str) -> Result<()>;
}

/// SQLite-backed domain available from first boot.
pub struct DeviceStore {
    db: Mutex<Connection>,
}

impl DeviceStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("identity.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }
}

impl IdentityDomain for DeviceStore {
    fn name(&self) -> &'static str {
        "device"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn read_identity(&self) -> Result<Option<String>> {
        let db = self.db.lock().expect("device store mutex poisoned");
        let id = db
            .query_row("SELECT device_id FROM identity WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(id)
    }

    fn write_identity(&self, device_id: &str) -> Result<()> {
        let db = self.db.lock().expect("device store mutex poisoned");
        db.execute(
            "INSERT INTO identity (id, device_id) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET device_id = ?1",
            [device_id],
        )?;
        Ok(())
    }
}

/// Domain backed by a credential-gated directory. Unavailable until the
/// directory is mounted (first user unlock on the target platform); reads
/// and writes before then are deferred, not errors.
pub struct ProtectedStore {
    dir: PathBuf,
}

impl ProtectedStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn open_db(&self) -> Result<Connection> {
        let db_path = self.dir.join("identity.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL
            );",
        )?;
        Ok(db)
    }
}

impl IdentityDomain for ProtectedStore {
    fn name(&self) -> &'static str {
        "protected"
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }

    fn read_identity(&self) -> Result<Option<String>> {
        if !self.is_available() {
            return Ok(None);
        }
        let db = self.open_db()?;
        let id = db
            .query_row("SELECT device_id FROM identity WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(id)
    }

    fn write_identity(&self, device_id: &str) -> Result<()> {
        if !self.is_available() {
            anyhow::bail!("protected store not available");
        }
        let db = self.open_db()?;
        db.execute(
            "INSERT INTO identity (id, device_id) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET device_id = ?1",
            [device_id],
        )?;
        Ok(())
    }
}

/// What a repair pass found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Both domains hold the same identity.
    Consistent(String),
    /// One domain was populated; its value was mirrored into the other.
    Propagated { value: String, into: &'static str },
    /// Both domains empty: the device has never registered.
    NotRegistered,
    /// The gated domain is not mounted yet; nothing to compare.
    Deferred,
}

pub struct ConsistencyRepair<'a> {
    device: &'a dyn IdentityDomain,
    protected: &'a dyn IdentityDomain,
}

impl<'a> ConsistencyRepair<'a> {
    pub fn new(device: &'a dyn IdentityDomain, protected: &'a dyn IdentityDomain) -> Self {
        Self { device, protected }
    }

    /// Reconcile the identity record across both domains.
    pub fn repair(&self) -> std::result::Result<RepairOutcome, AgentError> {
        if !self.protected.is_available() {
            debug!("Protected domain unavailable, repair deferred");
            return Ok(RepairOutcome::Deferred);
        }

        // A domain that fails to read is unreadable, not empty: propagating
        // over it could shadow a real value.
        let device_id = self
            .device
            .read_identity()
            .map_err(|e| AgentError::IdentityDomain(e.to_string()))?;
        let protected_id = self
            .protected
            .read_identity()
            .map_err(|e| AgentError::IdentityDomain(e.to_string()))?;

        match (device_id, protected_id) {
            (Some(a), Some(b)) if a == b => Ok(RepairOutcome::Consistent(a)),
            (Some(a), Some(b)) => {
                warn!(device = %a, protected = %b, "Identity domains disagree");
                Err(AgentError::IdentityConflict {
                    device: a,
                    protected: b,
                })
            }
            (Some(a), None) => {
                self.protected
                    .write_identity(&a)
                    .map_err(|e| AgentError::IdentityDomain(e.to_string()))?;
                info!(value = %a, "Identity propagated into protected domain");
                Ok(RepairOutcome::Propagated {
                    value: a,
                    into: self.protected.name(),
                })
            }
            (None, Some(b)) => {
                self.device
                    .write_identity(&b)
                    .map_err(|e| AgentError::IdentityDomain(e.to_string()))?;
                info!(value = %b, "Identity propagated into device domain");
                Ok(RepairOutcome::Propagated {
                    value: b,
                    into: self.device.name(),
                })
            }
            (None, None) => Ok(RepairOutcome::NotRegistered),
        }
    }
}
