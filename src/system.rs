//! System-wide memory counters from /proc/meminfo.
//!
//! The [`SystemSampler`] is read once per tick on the control thread; a
//! single small file needs no worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ProcError;

/// Memory statistics read from /proc/meminfo, in KiB. See `man 5 proc`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    /// Kernel estimate of memory available without swapping.
    pub mem_available: u64,
    pub buffers: u64,
    /// Page cache. Includes tmpfs (shmem), which cannot be reclaimed.
    pub cached: u64,
    pub swap_cache: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub anon_pages: u64,
    pub mapped: u64,
    pub shmem: u64,
    /// Reclaimable part of the slab.
    pub s_reclaimable: u64,
}

/// How "available memory" is estimated for system peak queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailableEstimator {
    /// `MemAvailable` as reported by the kernel.
    #[default]
    Kernel,
    /// `MemFree + Buffers + Cached - Shmem + SwapCached + SReclaimable`.
    Computed,
}

impl MemInfo {
    /// Available memory under the given estimator (KiB).
    pub fn available(&self, estimator: AvailableEstimator) -> u64 {
        match estimator {
            AvailableEstimator::Kernel => self.mem_available,
            AvailableEstimator::Computed => (self.mem_free
                + self.buffers
                + self.cached
                + self.swap_cache
                + self.s_reclaimable)
                .saturating_sub(self.shmem),
        }
    }
}

/// Parses a `Key:   1234 kB` line; malformed lines are logged and count as zero.
fn parse_meminfo_value(line: &str) -> u64 {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() == 3 && parts[2] == "kB" {
        if let Ok(v) = parts[1].parse() {
            return v;
        }
    }
    warn!("Can't parse memory line {:?}", line);
    0
}

/// Parses the content of /proc/meminfo. Unknown keys are ignored.
pub fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();

    for line in content.lines() {
        let Some((key, _)) = line.split_once(':') else {
            continue;
        };
        let field = match key {
            "MemTotal" => &mut info.mem_total,
            "MemFree" => &mut info.mem_free,
            "MemAvailable" => &mut info.mem_available,
            "Buffers" => &mut info.buffers,
            "Cached" => &mut info.cached,
            "SwapCached" => &mut info.swap_cache,
            "SwapTotal" => &mut info.swap_total,
            "SwapFree" => &mut info.swap_free,
            "AnonPages" => &mut info.anon_pages,
            "Mapped" => &mut info.mapped,
            "Shmem" => &mut info.shmem,
            "SReclaimable" => &mut info.s_reclaimable,
            _ => continue,
        };
        *field = parse_meminfo_value(line);
    }

    info
}

/// Reads system memory statistics from `<proc_root>/meminfo`.
pub fn read_meminfo(path: &Path) -> Result<MemInfo, ProcError> {
    let content = fs::read_to_string(path).map_err(|e| ProcError::io(path, e))?;
    Ok(parse_meminfo(&content))
}

/// One system memory sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSnapshot {
    pub time: DateTime<Utc>,
    pub mem_info: MemInfo,
}

/// Reads the global memory counters once per tick.
pub struct SystemSampler {
    meminfo_path: PathBuf,
}

impl SystemSampler {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            meminfo_path: proc_root.join("meminfo"),
        }
    }

    /// `None` when meminfo is missing or unreadable (logged).
    pub fn sample(&self, time: DateTime<Utc>) -> Option<SystemSnapshot> {
        if !self.meminfo_path.exists() {
            return None;
        }
        match read_meminfo(&self.meminfo_path) {
            Ok(mem_info) => Some(SystemSnapshot { time, mem_info }),
            Err(e) => {
                warn!("Failed to sample system memory: {}", e);
                None
            }
        }
    }
}
