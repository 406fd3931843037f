//! Health statistics of the recorder.
//!
//! Workers, the scheduler and the feeder all record into one shared
//! [`HealthStats`]; the binary logs [`HealthStats::render_table`] at shutdown.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Running statistics for a single metric.
#[derive(Clone, Copy, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

/// Thread-safe wrapper for running statistics.
#[derive(Default)]
pub struct Stat {
    inner: Mutex<RunningStat>,
}

impl Stat {
    pub fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    /// `(last, avg, max, min, count)`
    pub fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        if let Ok(s) = self.inner.lock() {
            (s.last, s.avg(), s.max, s.min, s.count)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0)
        }
    }
}

pub struct HealthStats {
    // Process lifecycle
    pub processes_started: AtomicU64,
    pub processes_exited: AtomicU64,
    pub processes_inaccessible: AtomicU64,

    // Sampling
    pub total_ticks: AtomicU64,
    pub tracked_processes: Stat,
    pub tick_duration_ms: Stat,
    pub samples_sent: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub samples_throttled: AtomicU64,
    pub stale_ticks_skipped: AtomicU64,

    // Storage
    pub snapshots_committed: AtomicU64,
    pub snapshots_failed: AtomicU64,
    pub system_snapshots_committed: AtomicU64,
    pub commit_duration_ms: Stat,

    pub start_time: Instant,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            processes_started: AtomicU64::new(0),
            processes_exited: AtomicU64::new(0),
            processes_inaccessible: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
            tracked_processes: Stat::default(),
            tick_duration_ms: Stat::default(),
            samples_sent: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            samples_throttled: AtomicU64::new(0),
            stale_ticks_skipped: AtomicU64::new(0),
            snapshots_committed: AtomicU64::new(0),
            snapshots_failed: AtomicU64::new(0),
            system_snapshots_committed: AtomicU64::new(0),
            commit_duration_ms: Stat::default(),
            start_time: Instant::now(),
        }
    }
}

impl HealthStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_tick(&self, tracked: usize, duration_ms: f64) {
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
        self.tracked_processes.add_sample(tracked as f64);
        self.tick_duration_ms.add_sample(duration_ms);
    }

    pub fn record_process_started(&self) {
        self.processes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_exited(&self) {
        self.processes_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_inaccessible(&self) {
        self.processes_inaccessible.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_sent(&self) {
        self.samples_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A sample failed to read its mandatory sources.
    pub fn record_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A sample was skipped because too many snapshots were queued.
    pub fn record_sample_throttled(&self) {
        self.samples_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker dropped a tick because a newer one was already queued.
    pub fn record_stale_tick_skipped(&self) {
        self.stale_ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_committed(&self, duration_ms: f64) {
        self.snapshots_committed.fetch_add(1, Ordering::Relaxed);
        self.commit_duration_ms.add_sample(duration_ms);
    }

    pub fn record_snapshot_failed(&self) {
        self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_system_snapshot_committed(&self) {
        self.system_snapshots_committed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_commit_success_rate(&self) -> f64 {
        let success = self.snapshots_committed.load(Ordering::Relaxed);
        let failure = self.snapshots_failed.load(Ordering::Relaxed);
        let total = success + failure;
        if total == 0 {
            100.0
        } else {
            (success as f64 / total as f64) * 100.0
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn render_table(&self) -> String {
        let (tp_cur, tp_avg, tp_max, tp_min, _) = self.tracked_processes.snapshot();
        let (td_cur, td_avg, td_max, td_min, _) = self.tick_duration_ms.snapshot();
        let (cd_cur, cd_avg, cd_max, cd_min, _) = self.commit_duration_ms.snapshot();
        let ticks = self.total_ticks.load(Ordering::Relaxed);

        let left_col = 26usize;
        let col_w = 12usize;

        let mut out = String::new();

        writeln!(out, "MEMORY WATCHER INTERNAL STATS").ok();
        writeln!(out, "=============================").ok();
        writeln!(out).ok();

        writeln!(
            out,
            "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
            "",
            "current",
            "average",
            "max",
            "min",
            left = left_col,
            col = col_w
        )
        .ok();

        for (label, cur, avg, max, min) in [
            ("tracked_processes", tp_cur, tp_avg, tp_max, tp_min),
            ("tick_duration (ms)", td_cur, td_avg, td_max, td_min),
            ("commit_duration (ms)", cd_cur, cd_avg, cd_max, cd_min),
        ] {
            writeln!(
                out,
                "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
                label,
                format!("{:.1}", cur),
                format!("{:.1}", avg),
                format!("{:.1}", max),
                format!("{:.1}", min),
                left = left_col,
                col = col_w
            )
            .ok();
        }

        writeln!(out).ok();
        writeln!(out, "COUNTERS").ok();
        writeln!(out, "--------").ok();

        for (label, counter) in [
            ("processes_started", &self.processes_started),
            ("processes_exited", &self.processes_exited),
            ("processes_inaccessible", &self.processes_inaccessible),
            ("samples_sent", &self.samples_sent),
            ("samples_dropped", &self.samples_dropped),
            ("samples_throttled", &self.samples_throttled),
            ("stale_ticks_skipped", &self.stale_ticks_skipped),
            ("snapshots_committed", &self.snapshots_committed),
            ("snapshots_failed", &self.snapshots_failed),
            ("system_snapshots", &self.system_snapshots_committed),
        ] {
            writeln!(
                out,
                "{:left$} | {:^col$}",
                label,
                counter.load(Ordering::Relaxed),
                left = left_col,
                col = col_w
            )
            .ok();
        }

        writeln!(out).ok();
        writeln!(
            out,
            "number of ticks: {} | commit success: {:.1}% | uptime: {}s",
            ticks,
            self.get_commit_success_rate(),
            self.get_uptime_seconds()
        )
        .ok();

        out
    }
}
