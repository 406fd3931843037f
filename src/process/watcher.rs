//! Per-process sampling state.
//!
//! A [`ProcessWatcher`] lives on exactly one worker thread for the lifetime
//! of the monitored process. It owns the paths of the process' proc sources,
//! the smaps block terminator learned at init and the accessibility flag.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ProcError;
use crate::process::identity::{parse_start_time_ticks, ProcessId};
use crate::process::memory::{
    discover_terminator, parse_smaps, read_oom_score, read_statm, OomScore, SmapsRange, StatM,
};
use crate::process::scanner::read_process_name;

/// One sampling result of one process, handed to the feeder by value.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub time: DateTime<Utc>,
    pub process_id: ProcessId,
    /// Empty when the process' smaps is not accessible.
    pub ranges: Vec<SmapsRange>,
    pub statm: StatM,
    pub oom_score: OomScore,
}

impl ProcessSnapshot {
    /// Sums of the per-range RSS and PSS values (KiB).
    pub fn sums(&self) -> (u64, u64) {
        self.ranges
            .iter()
            .fold((0, 0), |(rss, pss), r| (rss + r.rss, pss + r.pss))
    }
}

/// Result of [`ProcessWatcher::sample`].
#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Snapshot(ProcessSnapshot),
    /// The process' proc directory is gone; stop scheduling this watcher.
    Exited(ProcessId),
}

pub struct ProcessWatcher {
    process_id: ProcessId,
    proc_path: PathBuf,
    smaps_path: PathBuf,
    statm_path: PathBuf,
    terminator: Option<String>,
    accessible: bool,
}

impl ProcessWatcher {
    /// Creates the watcher and reads the process start time.
    pub fn new(pid: i32, proc_root: &Path) -> Self {
        let proc_path = proc_root.join(pid.to_string());
        Self {
            process_id: ProcessId::read(pid, proc_root),
            smaps_path: proc_path.join("smaps"),
            statm_path: proc_path.join("statm"),
            proc_path,
            terminator: None,
            accessible: false,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Whether the full range list is read on every sample.
    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    /// Reads smaps once to learn the block terminator and reads the display
    /// name. A process whose smaps cannot be read (missing privileges, kernel
    /// thread) stays tracked through statm only.
    pub fn init(&mut self) -> Option<String> {
        match discover_terminator(&self.smaps_path) {
            Ok(terminator) => {
                debug!(
                    "Process {}: smaps blocks end with {:?}",
                    self.process_id, terminator
                );
                self.terminator = Some(terminator);
                self.accessible = true;
            }
            Err(e) if e.is_permission_denied() => {
                warn!(
                    "Process {}: smaps not accessible, recording statm only: {}",
                    self.process_id, e
                );
                self.accessible = false;
            }
            Err(e) => {
                debug!("Process {}: smaps not usable: {}", self.process_id, e);
                self.accessible = false;
            }
        }

        let name = read_process_name(&self.proc_path);
        if name.is_none() {
            warn!("Process {}: cannot read process name", self.process_id);
        }
        name
    }

    /// False once the process' smaps disappeared.
    pub fn is_alive(&self) -> bool {
        self.smaps_path.exists()
    }

    /// Whether the pid now belongs to a process started after this watcher's.
    /// An unknown start time on either side never counts as reuse.
    fn is_reused(&self) -> bool {
        if self.process_id.start_time == 0 {
            return false;
        }
        match parse_start_time_ticks(&self.proc_path) {
            Ok(start_time) => start_time != self.process_id.start_time,
            Err(_) => false,
        }
    }

    /// Takes one snapshot stamped with `time`.
    ///
    /// statm is mandatory: when it cannot be read the sample fails and no
    /// measurement is produced for this tick. A pid that was recycled by a
    /// new process between two ticks is reported as exited.
    pub fn sample(&self, time: DateTime<Utc>) -> Result<SampleOutcome, ProcError> {
        if !self.is_alive() {
            return Ok(SampleOutcome::Exited(self.process_id));
        }
        if self.is_reused() {
            debug!("Process {}: pid was reused", self.process_id);
            return Ok(SampleOutcome::Exited(self.process_id));
        }

        let ranges = match (&self.terminator, self.accessible) {
            (Some(terminator), true) => parse_smaps(&self.smaps_path, self.process_id, terminator)?,
            _ => Vec::new(),
        };
        let statm = read_statm(&self.statm_path)?;
        let oom_score = read_oom_score(&self.proc_path);

        Ok(SampleOutcome::Snapshot(ProcessSnapshot {
            time,
            process_id: self.process_id,
            ranges,
            statm,
            oom_score,
        }))
    }
}

/// Builds a snapshot of `pid` from a saved copy of its smaps.
///
/// The terminator is learned from the file itself. A saved file carries no
/// start time, statm or OOM values, so those stay zero.
pub fn load_smaps_snapshot(
    pid: i32,
    smaps_path: &Path,
    time: DateTime<Utc>,
) -> Result<ProcessSnapshot, ProcError> {
    let process_id = ProcessId::new(pid, 0);
    let terminator = discover_terminator(smaps_path)?;
    let ranges = parse_smaps(smaps_path, process_id, &terminator)?;
    debug!(
        "Loaded {} ranges of pid {} from {}",
        ranges.len(),
        pid,
        smaps_path.display()
    );

    Ok(ProcessSnapshot {
        time,
        process_id,
        ranges,
        statm: StatM::default(),
        oom_score: OomScore::default(),
    })
}
