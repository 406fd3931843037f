//! Memory parsing utilities for reading process memory metrics from /proc.
//!
//! This module provides functions to parse the per-mapping blocks of
//! `/proc/<pid>/smaps`, the page counters of `/proc/<pid>/statm` and the
//! OOM killer values. Sizes are reported in KiB throughout.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::ProcError;
use crate::process::identity::{ContentHash, ProcessId};

/// Page size used to convert statm page counts into KiB.
pub const PAGE_SIZE_KIB: u64 = 4;

/// Read buffer for smaps files; large processes have tens of thousands of lines.
const SMAPS_BUFFER_KB: usize = 512;

/// Identifying fields of one virtual memory mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub process_id: ProcessId,
    pub from: u64,
    pub to: u64,
    pub permission: String,
    pub name: String,
}

impl RangeKey {
    /// Content hash of the mapping; identical observations share one row.
    pub fn hash(&self) -> u64 {
        ContentHash::new()
            .u64(self.process_id.hash())
            .u64(self.from)
            .u64(self.to)
            .str(&self.permission)
            .str(&self.name)
            .finish()
    }

    pub fn size_bytes(&self) -> u64 {
        self.to - self.from
    }
}

/// One mapping together with its resident and proportional sizes (KiB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmapsRange {
    pub key: RangeKey,
    pub rss: u64,
    pub pss: u64,
}

/// Counters from `/proc/<pid>/statm`, converted from pages to KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatM {
    /// Total program size (VmSize).
    pub size: u64,
    /// Resident set size (VmRSS).
    pub resident: u64,
    /// Resident shared pages, file backed (RssFile + RssShmem).
    pub shared: u64,
    pub text: u64,
    /// Unused since Linux 2.6; always 0.
    pub lib: u64,
    /// Data + stack.
    pub data: u64,
    /// Unused since Linux 2.6; always 0.
    pub dt: u64,
}

/// OOM killer values of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OomScore {
    /// Legacy `oom_adj`.
    pub adj: i32,
    pub score: i32,
    pub score_adj: i32,
}

/// Parses the value of a `Key:    1234 kB` line.
///
/// Malformed lines are logged and count as zero.
pub fn parse_kb_line(line: &str) -> u64 {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() == 3 {
        if let Ok(v) = parts[1].parse() {
            return v;
        }
    }
    warn!("Can't parse memory line {:?}", line);
    0
}

/// Parses a mapping header such as
/// `7f2c4a000000-7f2c4a021000 r-xp 00000000 08:01 1234  /usr/lib/libc.so.6`.
///
/// Only the first token of the path is kept as the mapping name.
pub fn parse_range_header(line: &str, process_id: ProcessId) -> Option<RangeKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (from, to) = parts[0].split_once('-')?;
    let from = u64::from_str_radix(from, 16).ok()?;
    let to = u64::from_str_radix(to, 16).ok()?;
    if to <= from {
        return None;
    }

    Some(RangeKey {
        process_id,
        from,
        to,
        permission: parts[1].to_string(),
        name: parts.get(5).map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// Iterates the non-empty prefix of a text source, one line at a time.
///
/// Reading stops at the first empty line or at end of input, mirroring the
/// layout of the proc files where no blank lines occur.
fn for_each_line<R: BufRead>(
    mut reader: R,
    path: &Path,
    mut f: impl FnMut(&str),
) -> Result<(), ProcError> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| ProcError::io(path, e))?;
        if n == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Ok(());
        }
        f(line);
    }
}

/// Learns the key that terminates each mapping block from the last line of
/// the file (`VmFlags` on current kernels).
///
/// Fails when the file cannot be opened (usually missing privileges), when it
/// is empty (kernel threads) or when the last line has no `key: value` shape.
pub fn discover_terminator(smaps_path: &Path) -> Result<String, ProcError> {
    let file = fs::File::open(smaps_path).map_err(|e| ProcError::io(smaps_path, e))?;
    let reader = BufReader::with_capacity(SMAPS_BUFFER_KB * 1024, file);

    let mut last_line = String::new();
    for_each_line(reader, smaps_path, |line| {
        last_line.clear();
        last_line.push_str(line);
    })?;

    if last_line.is_empty() {
        return Err(ProcError::malformed(smaps_path, "file is empty"));
    }

    let parts: Vec<&str> = last_line.split(':').filter(|s| !s.is_empty()).collect();
    if parts.len() != 2 {
        return Err(ProcError::malformed(smaps_path, "last line is malformed"));
    }
    Ok(parts[0].to_string())
}

/// Parses smaps content from any reader; see [`parse_smaps`].
pub fn parse_smaps_reader<R: BufRead>(
    reader: R,
    path: &Path,
    process_id: ProcessId,
    terminator: &str,
) -> Result<Vec<SmapsRange>, ProcError> {
    let mut ranges = Vec::new();
    let mut header_expected = true;
    // None while inside a block whose header could not be parsed.
    let mut current: Option<SmapsRange> = None;

    for_each_line(reader, path, |line| {
        if header_expected {
            current = parse_range_header(line, process_id).map(|key| SmapsRange {
                key,
                rss: 0,
                pss: 0,
            });
            if current.is_none() {
                warn!("Can't parse range {:?} in {}", line, path.display());
            }
            header_expected = false;
        } else if line.starts_with(terminator) {
            header_expected = true;
            if let Some(range) = current.take() {
                ranges.push(range);
            }
        } else if let Some(range) = current.as_mut() {
            if line.starts_with("Rss:") {
                range.rss = parse_kb_line(line);
            } else if line.starts_with("Pss:") {
                range.pss = parse_kb_line(line);
            }
        }
    })?;

    Ok(ranges)
}

/// Parses every mapping block of `/proc/<pid>/smaps`.
///
/// `terminator` is the key learned by [`discover_terminator`]. A block whose
/// header cannot be parsed is skipped; a malformed size line counts as zero.
pub fn parse_smaps(
    smaps_path: &Path,
    process_id: ProcessId,
    terminator: &str,
) -> Result<Vec<SmapsRange>, ProcError> {
    let file = fs::File::open(smaps_path).map_err(|e| ProcError::io(smaps_path, e))?;
    let reader = BufReader::with_capacity(SMAPS_BUFFER_KB * 1024, file);
    parse_smaps_reader(reader, smaps_path, process_id, terminator)
}

/// Parses the single statm line (`size resident shared text lib data dt`).
pub fn parse_statm_line(line: &str) -> Option<StatM> {
    let values: Vec<u64> = line
        .split_whitespace()
        .map(|v| v.parse::<u64>().map(|pages| pages * PAGE_SIZE_KIB))
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 7 {
        return None;
    }

    Some(StatM {
        size: values[0],
        resident: values[1],
        shared: values[2],
        text: values[3],
        lib: values[4],
        data: values[5],
        dt: values[6],
    })
}

/// Reads `/proc/<pid>/statm`. Any failure fails the whole read.
pub fn read_statm(statm_path: &Path) -> Result<StatM, ProcError> {
    let content = fs::read_to_string(statm_path).map_err(|e| ProcError::io(statm_path, e))?;
    let line = content.lines().next().unwrap_or("");
    parse_statm_line(line).ok_or_else(|| ProcError::malformed(statm_path, "expected 7 page counters"))
}

/// Reads one of the small integer files, 0 when absent or malformed.
pub fn read_int_or_zero(path: &Path) -> i32 {
    match fs::read_to_string(path) {
        Ok(content) => match content.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Can't parse {}", path.display());
                0
            }
        },
        Err(e) => {
            warn!("Can't read {}: {}", path.display(), e);
            0
        }
    }
}

/// Reads `oom_adj`, `oom_score` and `oom_score_adj` from a process directory.
pub fn read_oom_score(proc_path: &Path) -> OomScore {
    let score = OomScore {
        adj: read_int_or_zero(&proc_path.join("oom_adj")),
        score: read_int_or_zero(&proc_path.join("oom_score")),
        score_adj: read_int_or_zero(&proc_path.join("oom_score_adj")),
    };
    debug!("OOM score of {}: {:?}", proc_path.display(), score);
    score
}
