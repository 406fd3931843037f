//! Read side of the store: counts, peaks, at-time lookups and time lists.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, error};

use super::model::{to_millis, Measurement, ProcessInfo, SystemMemoryAt};
use super::Storage;
use crate::error::StorageError;
use crate::process::classifier::MemoryType;
use crate::process::identity::ProcessId;
use crate::process::memory::{OomScore, RangeKey, SmapsRange, StatM};
use crate::system::{AvailableEstimator, MemInfo, SystemSnapshot};

/// A stored range together with its row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRange {
    pub id: i64,
    pub key: RangeKey,
}

const MEASUREMENT_SELECT: &str = "SELECT m.id, m.seq, p.pid, p.start_time, m.time, \
     m.rss_sum, m.pss_sum, m.statm_size, m.statm_resident, m.statm_shared, m.statm_text, \
     m.statm_lib, m.statm_data, m.statm_dt, m.oom_adj, m.oom_score, m.oom_score_adj \
     FROM measurement m JOIN process p ON p.id = m.process_id";

const SYSTEM_SELECT: &str = "SELECT time, mem_total, mem_free, mem_available, buffers, \
     cached, swap_cache, swap_total, swap_free, anon_pages, mapped, shmem, s_reclaimable \
     FROM system_memory";

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {} out of range", ms).into(),
        )
    })
}

fn u64_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

/// Maps a [`MEASUREMENT_SELECT`] row; ranges are loaded separately.
fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    Ok(Measurement {
        id: row.get(0)?,
        seq: row.get(1)?,
        process_id: ProcessId::new(row.get(2)?, u64_column(row, 3)?),
        time: time_column(row, 4)?,
        rss_sum: u64_column(row, 5)?,
        pss_sum: u64_column(row, 6)?,
        statm: StatM {
            size: u64_column(row, 7)?,
            resident: u64_column(row, 8)?,
            shared: u64_column(row, 9)?,
            text: u64_column(row, 10)?,
            lib: u64_column(row, 11)?,
            data: u64_column(row, 12)?,
            dt: u64_column(row, 13)?,
        },
        oom_score: OomScore {
            adj: row.get(14)?,
            score: row.get(15)?,
            score_adj: row.get(16)?,
        },
        ranges: Vec::new(),
    })
}

fn system_from_row(row: &Row<'_>) -> rusqlite::Result<SystemSnapshot> {
    Ok(SystemSnapshot {
        time: time_column(row, 0)?,
        mem_info: MemInfo {
            mem_total: u64_column(row, 1)?,
            mem_free: u64_column(row, 2)?,
            mem_available: u64_column(row, 3)?,
            buffers: u64_column(row, 4)?,
            cached: u64_column(row, 5)?,
            swap_cache: u64_column(row, 6)?,
            swap_total: u64_column(row, 7)?,
            swap_free: u64_column(row, 8)?,
            anon_pages: u64_column(row, 9)?,
            mapped: u64_column(row, 10)?,
            shmem: u64_column(row, 11)?,
            s_reclaimable: u64_column(row, 12)?,
        },
    })
}

fn metric_column(memory_type: MemoryType) -> &'static str {
    match memory_type {
        MemoryType::Rss => "m.rss_sum",
        MemoryType::Pss => "m.pss_sum",
        MemoryType::StatmRss => "m.statm_resident",
    }
}

fn available_expr(estimator: AvailableEstimator) -> &'static str {
    match estimator {
        AvailableEstimator::Kernel => "mem_available",
        AvailableEstimator::Computed => {
            "(mem_free + buffers + cached - shmem + swap_cache + s_reclaimable)"
        }
    }
}

/// Logs a failed read before handing the error to the caller.
fn logged<T>(operation: &str, result: Result<T, StorageError>) -> Result<T, StorageError> {
    if let Err(e) = &result {
        error!("Storage read {} failed: {}", operation, e);
    }
    result
}

impl Storage {
    pub fn measurement_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM measurement", [], |row| row.get(0));
        logged("measurement_count", count.map_err(StorageError::from))
    }

    pub fn process_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM process", [], |row| row.get(0));
        logged("process_count", count.map_err(StorageError::from))
    }

    pub fn system_snapshot_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM system_memory", [], |row| row.get(0));
        logged("system_snapshot_count", count.map_err(StorageError::from))
    }

    /// Loads one measurement with all of its ranges.
    pub fn get_measurement(&self, id: i64) -> Result<Option<Measurement>, StorageError> {
        logged("get_measurement", self.query_measurement(id))
    }

    fn query_measurement(&self, id: i64) -> Result<Option<Measurement>, StorageError> {
        let sql = format!("{} WHERE m.id = ?1", MEASUREMENT_SELECT);
        let measurement = self
            .conn
            .query_row(&sql, params![id], measurement_from_row)
            .optional()?;
        match measurement {
            Some(mut m) => {
                m.ranges = self.load_ranges(m.id, &m.process_id)?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// The latest measurement of `process_id` taken at or before `time`.
    ///
    /// With `use_range_cache` the ranges of the process are loaded once and
    /// reused across calls, which pays off when stepping through many
    /// measurements of the same process.
    pub fn get_measurement_at(
        &mut self,
        process_id: &ProcessId,
        time: DateTime<Utc>,
        use_range_cache: bool,
    ) -> Result<Option<Measurement>, StorageError> {
        let result = self.query_measurement_at(process_id, time, use_range_cache);
        logged("get_measurement_at", result)
    }

    fn query_measurement_at(
        &mut self,
        process_id: &ProcessId,
        time: DateTime<Utc>,
        use_range_cache: bool,
    ) -> Result<Option<Measurement>, StorageError> {
        let sql = format!(
            "{} WHERE m.process_id = ?1 AND m.time <= ?2 ORDER BY m.time DESC LIMIT 1",
            MEASUREMENT_SELECT
        );
        let measurement = self
            .conn
            .query_row(
                &sql,
                params![process_id.hash() as i64, to_millis(time)],
                measurement_from_row,
            )
            .optional()?;

        let Some(mut m) = measurement else {
            return Ok(None);
        };
        m.ranges = if use_range_cache {
            self.load_ranges_cached(m.id, &m.process_id)?
        } else {
            self.load_ranges(m.id, &m.process_id)?
        };
        Ok(Some(m))
    }

    /// The measurement maximizing `memory_type` among those with an insertion
    /// index in `[seq_from, seq_to)`, optionally restricted to one process.
    ///
    /// Ties go to the earlier measurement. Pass `0..measurement_count()` for
    /// the whole recording. `use_range_cache` works as for
    /// [`Storage::get_measurement_at`].
    pub fn get_memory_peak(
        &mut self,
        process_id: Option<&ProcessId>,
        memory_type: MemoryType,
        seq_from: i64,
        seq_to: i64,
        use_range_cache: bool,
    ) -> Result<Option<Measurement>, StorageError> {
        let result =
            self.query_memory_peak(process_id, memory_type, seq_from, seq_to, use_range_cache);
        logged("get_memory_peak", result)
    }

    fn query_memory_peak(
        &mut self,
        process_id: Option<&ProcessId>,
        memory_type: MemoryType,
        seq_from: i64,
        seq_to: i64,
        use_range_cache: bool,
    ) -> Result<Option<Measurement>, StorageError> {
        let order = format!(
            "ORDER BY {} DESC, m.seq ASC LIMIT 1",
            metric_column(memory_type)
        );
        let measurement = match process_id {
            Some(process_id) => {
                let sql = format!(
                    "{} WHERE m.seq >= ?1 AND m.seq < ?2 AND m.process_id = ?3 {}",
                    MEASUREMENT_SELECT, order
                );
                self.conn
                    .query_row(
                        &sql,
                        params![seq_from, seq_to, process_id.hash() as i64],
                        measurement_from_row,
                    )
                    .optional()?
            }
            None => {
                let sql = format!(
                    "{} WHERE m.seq >= ?1 AND m.seq < ?2 {}",
                    MEASUREMENT_SELECT, order
                );
                self.conn
                    .query_row(&sql, params![seq_from, seq_to], measurement_from_row)
                    .optional()?
            }
        };

        let Some(mut m) = measurement else {
            return Ok(None);
        };
        m.ranges = if use_range_cache {
            self.load_ranges_cached(m.id, &m.process_id)?
        } else {
            self.load_ranges(m.id, &m.process_id)?
        };
        Ok(Some(m))
    }

    /// The system snapshot with the least available memory. Ties go to the
    /// earlier snapshot.
    pub fn get_system_memory_peak(
        &self,
        estimator: AvailableEstimator,
    ) -> Result<Option<SystemSnapshot>, StorageError> {
        let sql = format!(
            "{} ORDER BY {} ASC, id ASC LIMIT 1",
            SYSTEM_SELECT,
            available_expr(estimator)
        );
        let snapshot = self.conn.query_row(&sql, [], system_from_row).optional();
        logged("get_system_memory_peak", snapshot.map_err(StorageError::from))
    }

    /// The system snapshot taken at or before `time`, together with every
    /// process measurement of that same tick.
    pub fn get_system_memory_at(
        &self,
        time: DateTime<Utc>,
    ) -> Result<Option<SystemMemoryAt>, StorageError> {
        logged("get_system_memory_at", self.query_system_memory_at(time))
    }

    fn query_system_memory_at(
        &self,
        time: DateTime<Utc>,
    ) -> Result<Option<SystemMemoryAt>, StorageError> {
        let sql = format!(
            "{} WHERE time <= ?1 ORDER BY time DESC, id DESC LIMIT 1",
            SYSTEM_SELECT
        );
        let Some(system) = self
            .conn
            .query_row(&sql, params![to_millis(time)], system_from_row)
            .optional()?
        else {
            return Ok(None);
        };

        let sql = format!("{} WHERE m.time = ?1 ORDER BY m.seq", MEASUREMENT_SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let headers = stmt
            .query_map(params![to_millis(system.time)], measurement_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut measurements = Vec::with_capacity(headers.len());
        for mut m in headers {
            m.ranges = self.load_ranges(m.id, &m.process_id)?;
            measurements.push(m);
        }

        Ok(Some(SystemMemoryAt {
            system,
            measurements,
        }))
    }

    /// Every range ever stored for `process_id`, by start address.
    pub fn get_all_ranges(&self, process_id: &ProcessId) -> Result<Vec<StoredRange>, StorageError> {
        logged("get_all_ranges", self.query_all_ranges(process_id))
    }

    fn query_all_ranges(&self, process_id: &ProcessId) -> Result<Vec<StoredRange>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, \"from\", \"to\", permission, name FROM memory_range \
             WHERE process_id = ?1 ORDER BY \"from\", id",
        )?;
        let ranges = stmt
            .query_map(params![process_id.hash() as i64], |row| {
                Ok(StoredRange {
                    id: row.get(0)?,
                    key: RangeKey {
                        process_id: *process_id,
                        from: u64_column(row, 1)?,
                        to: u64_column(row, 2)?,
                        permission: row.get(3)?,
                        name: row.get(4)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ranges)
    }

    /// Every stored process that had `pid`; more than one after pid reuse.
    pub fn lookup_pid(&self, pid: i32) -> Result<Vec<ProcessInfo>, StorageError> {
        logged("lookup_pid", self.query_pid(pid))
    }

    fn query_pid(&self, pid: i32) -> Result<Vec<ProcessInfo>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT pid, start_time, name FROM process WHERE pid = ?1 ORDER BY start_time",
        )?;
        let processes = stmt
            .query_map(params![pid], |row| {
                Ok(ProcessInfo {
                    id: ProcessId::new(row.get(0)?, u64_column(row, 1)?),
                    name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(processes)
    }

    /// Distinct measurement times in ascending order.
    pub fn get_measurement_times(
        &self,
        process_id: Option<&ProcessId>,
    ) -> Result<Vec<DateTime<Utc>>, StorageError> {
        logged("get_measurement_times", self.query_measurement_times(process_id))
    }

    fn query_measurement_times(
        &self,
        process_id: Option<&ProcessId>,
    ) -> Result<Vec<DateTime<Utc>>, StorageError> {
        let times = match process_id {
            Some(process_id) => {
                let mut stmt = self.conn.prepare(
                    "SELECT DISTINCT time FROM measurement WHERE process_id = ?1 ORDER BY time",
                )?;
                let times = stmt
                    .query_map(params![process_id.hash() as i64], |row| time_column(row, 0))?
                    .collect::<Result<Vec<_>, _>>()?;
                times
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT DISTINCT time FROM measurement ORDER BY time")?;
                let times = stmt
                    .query_map([], |row| time_column(row, 0))?
                    .collect::<Result<Vec<_>, _>>()?;
                times
            }
        };
        Ok(times)
    }

    /// Drops every cached range list.
    pub fn clear_range_cache(&mut self) {
        self.range_cache.clear();
    }

    /// Ranges of one measurement in the order they were observed.
    fn load_ranges(
        &self,
        measurement_id: i64,
        process_id: &ProcessId,
    ) -> Result<Vec<SmapsRange>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT r.\"from\", r.\"to\", r.permission, r.name, d.rss, d.pss \
             FROM data d JOIN memory_range r ON r.id = d.range_id \
             WHERE d.measurement_id = ?1 ORDER BY d.rowid",
        )?;
        let ranges = stmt
            .query_map(params![measurement_id], |row| {
                Ok(SmapsRange {
                    key: RangeKey {
                        process_id: *process_id,
                        from: u64_column(row, 0)?,
                        to: u64_column(row, 1)?,
                        permission: row.get(2)?,
                        name: row.get(3)?,
                    },
                    rss: u64_column(row, 4)?,
                    pss: u64_column(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ranges)
    }

    fn load_ranges_cached(
        &mut self,
        measurement_id: i64,
        process_id: &ProcessId,
    ) -> Result<Vec<SmapsRange>, StorageError> {
        let rows: Vec<(i64, u64, u64)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT range_id, rss, pss FROM data WHERE measurement_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![measurement_id], |row| {
                    Ok((row.get(0)?, u64_column(row, 1)?, u64_column(row, 2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let cache_key = process_id.hash() as i64;
        let stale = match self.range_cache.get(&cache_key) {
            Some(cached) => rows.iter().any(|(id, _, _)| !cached.contains_key(id)),
            None => true,
        };
        if stale {
            let ranges: HashMap<i64, RangeKey> = self
                .query_all_ranges(process_id)?
                .into_iter()
                .map(|r| (r.id, r.key))
                .collect();
            debug!(
                "Cached {} ranges of process {}",
                ranges.len(),
                process_id
            );
            self.range_cache.insert(cache_key, ranges);
        }

        let cached = self
            .range_cache
            .get(&cache_key)
            .ok_or_else(|| StorageError::NotFound(format!("ranges of process {}", process_id)))?;
        rows.into_iter()
            .map(|(range_id, rss, pss)| {
                cached
                    .get(&range_id)
                    .map(|key| SmapsRange {
                        key: key.clone(),
                        rss,
                        pss,
                    })
                    .ok_or_else(|| StorageError::NotFound(format!("range {}", range_id)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::watcher::ProcessSnapshot;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn range(process_id: ProcessId, from: u64, to: u64, perm: &str, name: &str, rss: u64) -> SmapsRange {
        SmapsRange {
            key: RangeKey {
                process_id,
                from,
                to,
                permission: perm.to_string(),
                name: name.to_string(),
            },
            rss,
            pss: rss / 2,
        }
    }

    fn snapshot(process_id: ProcessId, ms: i64, rss: u64, resident: u64) -> ProcessSnapshot {
        ProcessSnapshot {
            time: at(ms),
            process_id,
            ranges: vec![
                range(process_id, 0x1000, 0x2000, "r-xp", "lib.so", 4),
                range(process_id, 0x2000, 0x3000, "rw-p", "", rss - 4),
            ],
            statm: StatM {
                resident,
                ..Default::default()
            },
            oom_score: OomScore {
                adj: 0,
                score: 7,
                score_adj: -100,
            },
        }
    }

    fn system(ms: i64, available: u64, free: u64) -> SystemSnapshot {
        SystemSnapshot {
            time: at(ms),
            mem_info: MemInfo {
                mem_total: 1000,
                mem_free: free,
                mem_available: available,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_peak_over_full_window() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        let second = storage.insert_snapshot(&snapshot(p, 2_000, 500, 0)).unwrap();
        storage.insert_snapshot(&snapshot(p, 3_000, 300, 0)).unwrap();

        let count = storage.measurement_count().unwrap();
        assert_eq!(count, 3);

        let peak = storage
            .get_memory_peak(None, MemoryType::Rss, 0, count, false)
            .unwrap()
            .unwrap();
        assert_eq!(peak.id, second);
        assert_eq!(peak.seq, 1);
        assert_eq!(peak.rss_sum, 500);
        assert_eq!(peak.ranges.len(), 2);
        assert_eq!(peak.oom_score.score_adj, -100);
    }

    #[test]
    fn test_peak_window_and_ties() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        let q = ProcessId::new(2, 20);
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 50)).unwrap();
        let tie_first = storage.insert_snapshot(&snapshot(p, 2_000, 300, 50)).unwrap();
        storage.insert_snapshot(&snapshot(p, 3_000, 300, 90)).unwrap();
        storage.insert_snapshot(&snapshot(q, 3_000, 900, 10)).unwrap();

        let peak = storage
            .get_memory_peak(Some(&p), MemoryType::Rss, 0, 4, false)
            .unwrap()
            .unwrap();
        assert_eq!(peak.id, tie_first);

        // the upper bound is exclusive
        let peak = storage
            .get_memory_peak(None, MemoryType::Rss, 0, 3, false)
            .unwrap()
            .unwrap();
        assert_eq!(peak.id, tie_first);

        let peak = storage
            .get_memory_peak(None, MemoryType::StatmRss, 0, 4, false)
            .unwrap()
            .unwrap();
        assert_eq!(peak.statm.resident, 90);

        assert!(storage
            .get_memory_peak(None, MemoryType::Pss, 4, 10, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_measurement_at_or_before() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        storage.insert_snapshot(&snapshot(p, 2_000, 200, 0)).unwrap();

        assert!(storage.get_measurement_at(&p, at(999), false).unwrap().is_none());

        for use_cache in [false, true] {
            let m = storage
                .get_measurement_at(&p, at(1_500), use_cache)
                .unwrap()
                .unwrap();
            assert_eq!(m.time, at(1_000));
            assert_eq!(m.ranges[0].key.name, "lib.so");
            assert_eq!(m.ranges[1].rss, 96);

            let m = storage
                .get_measurement_at(&p, at(2_000), use_cache)
                .unwrap()
                .unwrap();
            assert_eq!(m.rss_sum, 200);
        }
    }

    #[test]
    fn test_range_cache_picks_up_new_ranges() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        storage.get_measurement_at(&p, at(1_000), true).unwrap();

        let mut grown = snapshot(p, 2_000, 100, 0);
        grown.ranges.push(range(p, 0x8000, 0x9000, "rw-p", "[heap]", 8));
        storage.insert_snapshot(&grown).unwrap();

        let m = storage.get_measurement_at(&p, at(2_000), true).unwrap().unwrap();
        assert_eq!(m.ranges.len(), 3);
        assert_eq!(m.groups(MemoryType::Rss, true).heap, 8);

        storage.clear_range_cache();
        let m = storage.get_measurement_at(&p, at(1_000), true).unwrap().unwrap();
        assert_eq!(m.ranges.len(), 2);
    }

    #[test]
    fn test_get_measurement_and_groups() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        let id = storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();

        let m = storage.get_measurement(id).unwrap().unwrap();
        assert_eq!(m.process_id, p);
        let groups = m.groups(MemoryType::Rss, true);
        // the anonymous segment right behind the code segment is .bss
        assert_eq!(groups.mappings["lib.so"], 100);
        assert_eq!(groups.anonymous, 0);

        assert!(storage.get_measurement(id ^ 1).unwrap().is_none());
    }

    #[test]
    fn test_system_memory_peak_estimators() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_system_snapshot(&system(1_000, 500, 100)).unwrap();
        storage.insert_system_snapshot(&system(2_000, 200, 400)).unwrap();
        storage.insert_system_snapshot(&system(3_000, 200, 50)).unwrap();
        assert_eq!(storage.system_snapshot_count().unwrap(), 3);

        let peak = storage
            .get_system_memory_peak(AvailableEstimator::Kernel)
            .unwrap()
            .unwrap();
        assert_eq!(peak.time, at(2_000));

        let peak = storage
            .get_system_memory_peak(AvailableEstimator::Computed)
            .unwrap()
            .unwrap();
        assert_eq!(peak.time, at(3_000));
    }

    #[test]
    fn test_system_memory_at() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        let q = ProcessId::new(2, 20);
        storage.insert_system_snapshot(&system(1_000, 500, 100)).unwrap();
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        storage.insert_snapshot(&snapshot(q, 1_000, 200, 0)).unwrap();
        storage.insert_snapshot(&snapshot(p, 1_500, 300, 0)).unwrap();

        let at_time = storage.get_system_memory_at(at(1_800)).unwrap().unwrap();
        assert_eq!(at_time.system.time, at(1_000));
        let pids: Vec<i32> = at_time.measurements.iter().map(|m| m.process_id.pid).collect();
        assert_eq!(pids, vec![1, 2]);

        assert!(storage.get_system_memory_at(at(10)).unwrap().is_none());
    }

    #[test]
    fn test_lookup_pid_and_times() {
        let mut storage = Storage::open_in_memory().unwrap();
        let old = ProcessId::new(7, 100);
        let reused = ProcessId::new(7, 900);
        storage.upsert_process(&old, "cron").unwrap();
        storage.upsert_process(&reused, "sshd").unwrap();
        storage.insert_snapshot(&snapshot(old, 2_000, 100, 0)).unwrap();
        storage.insert_snapshot(&snapshot(reused, 1_000, 100, 0)).unwrap();
        storage.insert_snapshot(&snapshot(reused, 2_000, 100, 0)).unwrap();

        let found = storage.lookup_pid(7).unwrap();
        assert_eq!(
            found,
            vec![
                ProcessInfo { id: old, name: "cron".to_string() },
                ProcessInfo { id: reused, name: "sshd".to_string() },
            ]
        );
        assert!(storage.lookup_pid(8).unwrap().is_empty());
        assert_eq!(storage.process_count().unwrap(), 2);

        assert_eq!(
            storage.get_measurement_times(None).unwrap(),
            vec![at(1_000), at(2_000)]
        );
        assert_eq!(
            storage.get_measurement_times(Some(&old)).unwrap(),
            vec![at(2_000)]
        );

        let ranges = storage.get_all_ranges(&reused).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].key.from, 0x1000);
        assert_eq!(ranges[0].id, ranges[0].key.hash() as i64);
    }

    #[test]
    fn test_peak_with_range_cache_matches_uncached() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        let mut grown = snapshot(p, 2_000, 400, 0);
        grown.ranges.push(range(p, 0x8000, 0x9000, "rw-p", "[heap]", 8));
        storage.insert_snapshot(&grown).unwrap();

        let uncached = storage
            .get_memory_peak(Some(&p), MemoryType::Rss, 0, 2, false)
            .unwrap()
            .unwrap();
        // warm the cache with the first measurement's ranges only
        storage.get_measurement_at(&p, at(1_000), true).unwrap();
        let cached = storage
            .get_memory_peak(Some(&p), MemoryType::Rss, 0, 2, true)
            .unwrap()
            .unwrap();

        assert_eq!(cached.id, uncached.id);
        assert_eq!(cached.ranges, uncached.ranges);
        assert_eq!(cached.ranges.len(), 3);
    }

    #[test]
    fn test_read_errors_are_returned() {
        let mut storage = Storage::open_in_memory().unwrap();
        let p = ProcessId::new(1, 10);
        let id = storage.insert_snapshot(&snapshot(p, 1_000, 100, 0)).unwrap();
        storage.conn.execute_batch("DROP TABLE data").unwrap();

        assert!(storage.get_measurement(id).is_err());
        assert!(storage.get_measurement_at(&p, at(1_000), false).is_err());
        assert!(storage
            .get_memory_peak(None, MemoryType::Rss, 0, 1, false)
            .is_err());

        storage.conn.execute_batch("DROP TABLE measurement").unwrap();
        assert!(storage.measurement_count().is_err());
        assert!(storage.get_measurement_times(None).is_err());
    }
}
