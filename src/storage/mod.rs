//! Embedded time-series store for process and system memory snapshots.
//!
//! The store is a single SQLite file with five tables:
//! - `process` and `memory_range`: dimension rows keyed by content hash,
//!   inserted idempotently
//! - `measurement`, `data` and `system_memory`: append-only fact rows
//!
//! Exactly one [`Storage`] writes to a file. The recorder hands it to the
//! feeder thread; readers open their own handle.

mod model;
mod query;

pub use model::{measurement_id, Measurement, ProcessInfo, SystemMemoryAt};
pub use query::StoredRange;

use ahash::AHashMap as HashMap;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use tracing::{debug, error, info};

use crate::error::StorageError;
use crate::process::identity::ProcessId;
use crate::process::memory::{RangeKey, SmapsRange};
use crate::process::watcher::ProcessSnapshot;
use crate::system::SystemSnapshot;
use model::to_millis;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS process (
    id          INTEGER PRIMARY KEY,
    pid         INTEGER NOT NULL,
    start_time  INTEGER NOT NULL,
    name        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_range (
    id          INTEGER PRIMARY KEY,
    process_id  INTEGER NOT NULL REFERENCES process(id),
    "from"      INTEGER NOT NULL,
    "to"        INTEGER NOT NULL,
    permission  TEXT NOT NULL,
    name        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS measurement (
    id              INTEGER PRIMARY KEY,
    seq             INTEGER NOT NULL UNIQUE,
    process_id      INTEGER NOT NULL REFERENCES process(id),
    time            INTEGER NOT NULL,
    rss_sum         INTEGER NOT NULL,
    pss_sum         INTEGER NOT NULL,
    statm_size      INTEGER NOT NULL,
    statm_resident  INTEGER NOT NULL,
    statm_shared    INTEGER NOT NULL,
    statm_text      INTEGER NOT NULL,
    statm_lib       INTEGER NOT NULL,
    statm_data      INTEGER NOT NULL,
    statm_dt        INTEGER NOT NULL,
    oom_adj         INTEGER NOT NULL,
    oom_score       INTEGER NOT NULL,
    oom_score_adj   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS data (
    range_id        INTEGER NOT NULL REFERENCES memory_range(id),
    measurement_id  INTEGER NOT NULL REFERENCES measurement(id),
    rss             INTEGER NOT NULL,
    pss             INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_memory (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    time            INTEGER NOT NULL,
    mem_total       INTEGER NOT NULL,
    mem_free        INTEGER NOT NULL,
    mem_available   INTEGER NOT NULL,
    buffers         INTEGER NOT NULL,
    cached          INTEGER NOT NULL,
    swap_cache      INTEGER NOT NULL,
    swap_total      INTEGER NOT NULL,
    swap_free       INTEGER NOT NULL,
    anon_pages      INTEGER NOT NULL,
    mapped          INTEGER NOT NULL,
    shmem           INTEGER NOT NULL,
    s_reclaimable   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_measurement_process_time ON measurement(process_id, time);
CREATE INDEX IF NOT EXISTS idx_measurement_time ON measurement(time);
CREATE INDEX IF NOT EXISTS idx_data_measurement ON data(measurement_id);
CREATE INDEX IF NOT EXISTS idx_system_memory_time ON system_memory(time);
"#;

/// Tables every valid store must contain.
const TABLES: [&str; 5] = ["process", "memory_range", "measurement", "data", "system_memory"];

pub struct Storage {
    conn: Connection,
    /// Ranges of one process by row id, filled on demand by cached lookups.
    range_cache: HashMap<i64, HashMap<i64, RangeKey>>,
}

impl Storage {
    /// Opens or creates the store at `path` and creates missing tables.
    pub fn init(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        let storage = Self::from_connection(conn)?;
        info!("Opened measurement store {}", path.display());
        Ok(storage)
    }

    /// A private store that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        for table in TABLES {
            let found: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )?;
            if found != 1 {
                return Err(StorageError::Schema(format!("table {} is missing", table)));
            }
        }

        Ok(Self {
            conn,
            range_cache: HashMap::new(),
        })
    }

    /// Inserts the process row unless it already exists.
    pub fn upsert_process(&self, process_id: &ProcessId, name: &str) -> Result<(), StorageError> {
        upsert_process(&self.conn, process_id, name)
    }

    /// Inserts the range row unless it already exists.
    pub fn upsert_range(&self, key: &RangeKey) -> Result<i64, StorageError> {
        upsert_range(&self.conn, key)
    }

    /// Appends a measurement row and returns its id.
    pub fn insert_measurement(&self, snapshot: &ProcessSnapshot) -> Result<i64, StorageError> {
        insert_measurement(&self.conn, snapshot)
    }

    /// Appends one data row per range of the measurement `measurement_id`.
    pub fn insert_data(
        &self,
        measurement_id: i64,
        ranges: &[SmapsRange],
    ) -> Result<(), StorageError> {
        insert_data(&self.conn, measurement_id, ranges)
    }

    /// Writes the whole snapshot in one transaction and returns the id of
    /// the new measurement.
    ///
    /// The process row is created with an empty name when the snapshot
    /// arrives before the process was announced. On failure the transaction
    /// is rolled back and nothing of the snapshot is visible.
    pub fn insert_snapshot(&mut self, snapshot: &ProcessSnapshot) -> Result<i64, StorageError> {
        let result = self.write_snapshot(snapshot);
        if let Err(e) = &result {
            error!(
                "Failed to store snapshot of process {}: {}",
                snapshot.process_id, e
            );
        }
        result
    }

    fn write_snapshot(&mut self, snapshot: &ProcessSnapshot) -> Result<i64, StorageError> {
        // Dropping the transaction without commit rolls it back.
        let tx = self.conn.transaction()?;
        upsert_process(&tx, &snapshot.process_id, "")?;
        for range in &snapshot.ranges {
            upsert_range(&tx, &range.key)?;
        }
        let measurement_id = insert_measurement(&tx, snapshot)?;
        insert_data(&tx, measurement_id, &snapshot.ranges)?;
        tx.commit()?;
        Ok(measurement_id)
    }

    /// Appends a system memory row and returns its id.
    pub fn insert_system_snapshot(&self, snapshot: &SystemSnapshot) -> Result<i64, StorageError> {
        let m = &snapshot.mem_info;
        self.conn.execute(
            "INSERT INTO system_memory (time, mem_total, mem_free, mem_available, buffers, \
             cached, swap_cache, swap_total, swap_free, anon_pages, mapped, shmem, s_reclaimable) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                to_millis(snapshot.time),
                m.mem_total as i64,
                m.mem_free as i64,
                m.mem_available as i64,
                m.buffers as i64,
                m.cached as i64,
                m.swap_cache as i64,
                m.swap_total as i64,
                m.swap_free as i64,
                m.anon_pages as i64,
                m.mapped as i64,
                m.shmem as i64,
                m.s_reclaimable as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn upsert_process(
    conn: &Connection,
    process_id: &ProcessId,
    name: &str,
) -> Result<(), StorageError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO process (id, pid, start_time, name) VALUES (?1, ?2, ?3, ?4)",
        params![
            process_id.hash() as i64,
            process_id.pid,
            process_id.start_time as i64,
            name
        ],
    )?;
    if inserted > 0 {
        debug!("Stored process {} ({:?})", process_id, name);
    }
    Ok(())
}

fn upsert_range(conn: &Connection, key: &RangeKey) -> Result<i64, StorageError> {
    let id = key.hash() as i64;
    conn.prepare_cached(
        "INSERT OR IGNORE INTO memory_range (id, process_id, \"from\", \"to\", permission, name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        id,
        key.process_id.hash() as i64,
        key.from as i64,
        key.to as i64,
        key.permission,
        key.name
    ])?;
    Ok(id)
}

fn insert_measurement(conn: &Connection, snapshot: &ProcessSnapshot) -> Result<i64, StorageError> {
    let id = measurement_id(&snapshot.process_id, snapshot.time);
    let (rss_sum, pss_sum) = snapshot.sums();
    let statm = &snapshot.statm;
    let oom = &snapshot.oom_score;

    // Single writer, so MAX(seq) + 1 is the insertion index.
    conn.prepare_cached(
        "INSERT INTO measurement (id, seq, process_id, time, rss_sum, pss_sum, \
         statm_size, statm_resident, statm_shared, statm_text, statm_lib, statm_data, statm_dt, \
         oom_adj, oom_score, oom_score_adj) \
         VALUES (?1, (SELECT COALESCE(MAX(seq) + 1, 0) FROM measurement), ?2, ?3, ?4, ?5, \
         ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?
    .execute(params![
        id,
        snapshot.process_id.hash() as i64,
        to_millis(snapshot.time),
        rss_sum as i64,
        pss_sum as i64,
        statm.size as i64,
        statm.resident as i64,
        statm.shared as i64,
        statm.text as i64,
        statm.lib as i64,
        statm.data as i64,
        statm.dt as i64,
        oom.adj,
        oom.score,
        oom.score_adj,
    ])?;
    Ok(id)
}

fn insert_data(
    conn: &Connection,
    measurement_id: i64,
    ranges: &[SmapsRange],
) -> Result<(), StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO data (range_id, measurement_id, rss, pss) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for range in ranges {
        stmt.execute(params![
            range.key.hash() as i64,
            measurement_id,
            range.rss as i64,
            range.pss as i64
        ])?;
    }
    Ok(())
}
