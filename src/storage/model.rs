//! Rows read back from the store.

use chrono::{DateTime, Utc};

use crate::process::classifier::{group, MeasurementGroups, MemoryType};
use crate::process::identity::{ContentHash, ProcessId};
use crate::process::memory::{OomScore, SmapsRange, StatM};
use crate::system::SystemSnapshot;

/// A stored process dimension row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: String,
}

/// One stored measurement of one process, with its per-range data in the
/// order the ranges were observed.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub id: i64,
    /// Zero-based insertion index over all measurements of the store.
    pub seq: i64,
    pub process_id: ProcessId,
    pub time: DateTime<Utc>,
    pub rss_sum: u64,
    pub pss_sum: u64,
    pub statm: StatM,
    pub oom_score: OomScore,
    pub ranges: Vec<SmapsRange>,
}

impl Measurement {
    /// Total of this measurement under `memory_type` (KiB).
    pub fn value(&self, memory_type: MemoryType) -> u64 {
        match memory_type {
            MemoryType::Rss => self.rss_sum,
            MemoryType::Pss => self.pss_sum,
            MemoryType::StatmRss => self.statm.resident,
        }
    }

    /// Re-derives the semantic grouping from the stored ranges.
    pub fn groups(&self, memory_type: MemoryType, group_sockets: bool) -> MeasurementGroups {
        group(&self.ranges, self.statm, memory_type, group_sockets)
    }
}

/// A system snapshot together with the process measurements of the same tick.
#[derive(Debug, Clone)]
pub struct SystemMemoryAt {
    pub system: SystemSnapshot,
    pub measurements: Vec<Measurement>,
}

/// Row id of the measurement of `process_id` at `time`.
pub fn measurement_id(process_id: &ProcessId, time: DateTime<Utc>) -> i64 {
    ContentHash::new()
        .u64(process_id.hash())
        .i64(time.timestamp_millis())
        .finish() as i64
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}
