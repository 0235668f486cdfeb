//! Durable SQLite state and lock backend
//!
//! Several processes may share one database file. Record writes run inside
//! `IMMEDIATE` transactions so the version check and the insert are atomic,
//! and lock acquisition is a single conditional upsert.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::lock::{Acquire, LockBackend};
use crate::types::{LockHandle, StateRecord};
use crate::StateStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed state store and lock backend
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

/// Row shape before timestamp and payload decoding
type RawRecord = (String, i64, String, String);

impl SqliteStateStore {
    /// Open or create a state database at the given path
    ///
    /// Creates the database file and necessary tables if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        Self::init(conn, Arc::new(SystemClock))
    }

    /// Open a private in-memory database (tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    /// Replace the time source (tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS state_records (
                resource_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (resource_name, version)
            );

            CREATE TABLE IF NOT EXISTS locks (
                resource_key TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn latest_version(conn: &Connection, resource: &str) -> Result<u64> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM state_records WHERE resource_name = ?1",
        params![resource],
        |row| row.get(0),
    )?;
    Ok(version as u64)
}

fn insert_record(conn: &Connection, record: &StateRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO state_records (resource_name, version, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            record.resource_name,
            record.version as i64,
            serde_json::to_string(&record.payload)?,
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: RawRecord) -> Result<StateRecord> {
    let (resource_name, version, payload, updated_at) = raw;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| Error::Unavailable(format!("corrupt timestamp for '{resource_name}': {e}")))?
        .with_timezone(&Utc);

    Ok(StateRecord {
        resource_name,
        version: version as u64,
        payload: serde_json::from_str(&payload)?,
        updated_at,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Unavailable(format!("corrupt lock expiry: {ms}")))
}

impl StateStore for SqliteStateStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn get(&self, resource: &str) -> Result<Option<StateRecord>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT resource_name, version, payload, updated_at
                 FROM state_records WHERE resource_name = ?1
                 ORDER BY version DESC LIMIT 1",
                params![resource],
                read_raw,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    fn put(
        &self,
        resource: &str,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<StateRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let actual = latest_version(&tx, resource)?;
        if actual != expected_version {
            return Err(Error::VersionConflict {
                resource: resource.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let previous = (actual > 0).then_some(actual);
        let record = StateRecord::next(resource, previous, payload, self.clock.now());
        insert_record(&tx, &record)?;
        tx.commit()?;

        log::debug!("Wrote '{}' version {}", resource, record.version);
        Ok(record)
    }

    fn rollback(&self, resource: &str, to_version: u64) -> Result<StateRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let target = tx
            .query_row(
                "SELECT resource_name, version, payload, updated_at
                 FROM state_records WHERE resource_name = ?1 AND version = ?2",
                params![resource, to_version as i64],
                read_raw,
            )
            .optional()?
            .map(decode)
            .transpose()?
            .ok_or_else(|| Error::NoSuchVersion {
                resource: resource.to_string(),
                version: to_version,
            })?;

        let latest = latest_version(&tx, resource)?;
        if latest == to_version {
            return Ok(target);
        }

        let record = StateRecord::next(resource, Some(latest), target.payload, self.clock.now());
        insert_record(&tx, &record)?;
        tx.commit()?;

        log::info!(
            "Rolled '{}' back to version {} as version {}",
            resource,
            to_version,
            record.version
        );
        Ok(record)
    }

    fn history(&self, resource: &str) -> Result<Vec<StateRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT resource_name, version, payload, updated_at
             FROM state_records WHERE resource_name = ?1
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![resource], read_raw)?;

        let mut history = Vec::new();
        for raw in rows {
            history.push(decode(raw?)?);
        }
        Ok(history)
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.resource_name, r.version, r.payload, r.updated_at
             FROM state_records r
             JOIN (
                 SELECT resource_name, MAX(version) AS version
                 FROM state_records GROUP BY resource_name
             ) latest
             ON r.resource_name = latest.resource_name AND r.version = latest.version
             ORDER BY r.resource_name",
        )?;
        let rows = stmt.query_map([], read_raw)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(decode(raw?)?);
        }
        Ok(records)
    }
}

impl LockBackend for SqliteStateStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Acquire> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO locks (resource_key, holder_id, expires_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (resource_key) DO UPDATE
             SET holder_id = excluded.holder_id, expires_at_ms = excluded.expires_at_ms
             WHERE locks.expires_at_ms <= ?4",
            params![
                key,
                holder,
                expires_at.timestamp_millis(),
                now.timestamp_millis()
            ],
        )?;

        let handle = LockHandle {
            resource_key: key.to_string(),
            holder_id: holder.to_string(),
            expires_at,
        };

        if changed == 1 {
            return Ok(Acquire::Acquired(handle));
        }

        drop(conn);
        match self.current(key)? {
            Some(current) => Ok(Acquire::Held(current)),
            // Released between the upsert and the read
            None => Err(Error::Unavailable(format!(
                "lock '{key}' changed hands during acquisition"
            ))),
        }
    }

    fn current(&self, key: &str) -> Result<Option<LockHandle>> {
        let conn = self.conn();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT resource_key, holder_id, expires_at_ms FROM locks WHERE resource_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(resource_key, holder_id, ms)| {
            Ok(LockHandle {
                resource_key,
                holder_id,
                expires_at: from_millis(ms)?,
            })
        })
        .transpose()
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM locks WHERE resource_key = ?1 AND holder_id = ?2",
            params![key, holder],
        )?;
        Ok(changed == 1)
    }

    fn extend(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE locks SET expires_at_ms = ?3
             WHERE resource_key = ?1 AND holder_id = ?2 AND expires_at_ms > ?4",
            params![
                key,
                holder,
                expires_at.timestamp_millis(),
                now.timestamp_millis()
            ],
        )?;
        Ok(changed == 1)
    }

    fn force_release(&self, key: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM locks WHERE resource_key = ?1", params![key])?;
        Ok(changed == 1)
    }
}
