//! Periodic sampling of the watched processes.
//!
//! The [`Scheduler`] lives on the control side. Every tick it
//! 1. forgets processes whose exit was reported since the last tick,
//! 2. discovers new processes when it tracks the whole system,
//! 3. asks every worker to sample its watchers at the tick time and
//! 4. reads the system memory counters itself.
//!
//! Processes are assigned to workers round-robin and stay on their worker
//! until they exit.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feeder::FeederMessage;
use crate::health_stats::HealthStats;
use crate::pool::{
    ProcessExit, ShutdownPolicy, WorkerCommand, WorkerContext, WorkerGroup,
    DEFAULT_MAX_QUEUED_SNAPSHOTS,
};
use crate::process::scanner::collect_proc_entries;
use crate::system::SystemSampler;

/// Default interval between two ticks.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub proc_root: PathBuf,
    pub period: Duration,
    /// Processes to watch; empty means every process of the system.
    pub pids: Vec<i32>,
    pub workers: usize,
    pub max_queued_snapshots: usize,
    pub record_system_memory: bool,
    pub shutdown: ShutdownPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            period: DEFAULT_PERIOD,
            pids: Vec::new(),
            workers: default_workers(),
            max_queued_snapshots: DEFAULT_MAX_QUEUED_SNAPSHOTS,
            record_system_memory: true,
            shutdown: ShutdownPolicy::default(),
        }
    }
}

/// Available hardware parallelism, at least 1.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub struct Scheduler {
    options: SchedulerOptions,
    workers: WorkerGroup,
    feeder_tx: UnboundedSender<FeederMessage>,
    exit_rx: UnboundedReceiver<ProcessExit>,
    /// Tracked pid and the worker owning its watcher.
    tracked: HashMap<i32, usize>,
    next_worker: usize,
    system: Option<SystemSampler>,
    stats: Arc<HealthStats>,
    closed: bool,
}

impl Scheduler {
    /// Starts the workers and, for an explicit pid list, a watcher per pid.
    pub fn new(
        options: SchedulerOptions,
        feeder_tx: UnboundedSender<FeederMessage>,
        queued: Arc<AtomicUsize>,
        stats: Arc<HealthStats>,
    ) -> io::Result<Self> {
        let (exit_tx, exit_rx) = unbounded_channel();
        let ctx = WorkerContext {
            proc_root: options.proc_root.clone(),
            feeder_tx: feeder_tx.clone(),
            exit_tx,
            queued,
            max_queued: options.max_queued_snapshots,
            stats: stats.clone(),
        };
        let workers = WorkerGroup::spawn(options.workers, ctx)?;
        let system = options
            .record_system_memory
            .then(|| SystemSampler::new(&options.proc_root));

        let mut scheduler = Self {
            workers,
            feeder_tx,
            exit_rx,
            tracked: HashMap::new(),
            next_worker: 0,
            system,
            stats,
            closed: false,
            options,
        };

        let pids = scheduler.options.pids.clone();
        for pid in pids {
            scheduler.watch(pid);
        }
        Ok(scheduler)
    }

    pub fn is_whole_system(&self) -> bool {
        self.options.pids.is_empty()
    }

    /// Currently tracked pids, ascending.
    pub fn tracked_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.tracked.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn watch(&mut self, pid: i32) {
        if self.tracked.contains_key(&pid) {
            return;
        }
        let worker = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        if self.workers.send(worker, WorkerCommand::Watch(pid)) {
            debug!("Watching pid {} on worker {}", pid, worker);
            self.tracked.insert(pid, worker);
        } else {
            warn!("Worker {} is gone, cannot watch pid {}", worker, pid);
        }
    }

    /// Forgets every process whose exit was reported. Returns how many.
    pub fn drain_exit_events(&mut self) -> usize {
        let mut removed = 0;
        while let Ok(exit) = self.exit_rx.try_recv() {
            if self.tracked.remove(&exit.pid).is_some() {
                debug!("Stopped tracking {}", exit.process_id);
                removed += 1;
            }
        }
        removed
    }

    /// Starts watchers for processes not tracked yet. Returns how many.
    pub fn discover(&mut self) -> usize {
        let mut added = 0;
        for entry in collect_proc_entries(&self.options.proc_root) {
            if !self.tracked.contains_key(&entry.pid) {
                self.watch(entry.pid);
                added += 1;
            }
        }
        if added > 0 {
            debug!("Discovered {} new processes", added);
        }
        added
    }

    /// One sampling round stamped with `time`.
    pub fn tick(&mut self, time: DateTime<Utc>) {
        if self.closed {
            return;
        }
        let start = Instant::now();

        self.drain_exit_events();
        if self.is_whole_system() {
            self.discover();
        }
        self.workers.broadcast(WorkerCommand::Sample(time));

        if let Some(snapshot) = self.system.as_ref().and_then(|s| s.sample(time)) {
            if self
                .feeder_tx
                .send(FeederMessage::SystemSnapshot(snapshot))
                .is_err()
            {
                debug!("Feeder is gone, dropping system snapshot");
            }
        }

        self.stats
            .record_tick(self.tracked.len(), start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Disposes every watcher, stops the workers and waits for them within
    /// the shutdown policy, then tells the feeder to finish.
    ///
    /// Returns false when some worker did not stop in time. Calling it again
    /// is a no-op.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return true;
        }
        self.closed = true;

        info!(
            "Stopping {} workers ({} processes tracked)",
            self.workers.len(),
            self.tracked.len()
        );
        self.workers.broadcast(WorkerCommand::Dispose);
        self.workers.broadcast(WorkerCommand::Stop);
        let stopped = self.workers.join_with_timeout(self.options.shutdown);
        self.tracked.clear();

        if self.feeder_tx.send(FeederMessage::Shutdown).is_err() {
            debug!("Feeder already stopped");
        }
        if stopped {
            info!("All workers stopped");
        }
        stopped
    }

    /// Ticks every period until `cancel` fires, then closes.
    ///
    /// Returns the result of [`Scheduler::close`].
    pub async fn run(mut self, cancel: CancellationToken) -> bool {
        let mut interval = tokio::time::interval(self.options.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Sampling every {:?} ({})",
            self.options.period,
            if self.is_whole_system() {
                "all processes".to_string()
            } else {
                format!("pids {:?}", self.options.pids)
            }
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }

        match tokio::task::spawn_blocking(move || self.close()).await {
            Ok(stopped) => stopped,
            Err(e) => {
                error!("Shutdown task failed: {}", e);
                false
            }
        }
    }
}
