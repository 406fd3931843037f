//! Worker group that owns the process watchers.
//!
//! Every worker is a named OS thread holding a disjoint set of
//! [`ProcessWatcher`]s. The control side talks to it through
//! [`WorkerCommand`]s only; results leave the worker as messages to the
//! feeder (snapshots) and to the scheduler (exits). No watcher state is
//! shared between threads.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::feeder::FeederMessage;
use crate::health_stats::HealthStats;
use crate::process::identity::ProcessId;
use crate::process::watcher::{ProcessWatcher, SampleOutcome};

/// Interval between two checks for stopped workers during shutdown.
pub const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Checks before shutdown gives up on workers that do not stop.
pub const CLOSE_MAX_POLLS: u32 = 100;

/// Default limit of snapshots handed to the feeder but not yet consumed.
pub const DEFAULT_MAX_QUEUED_SNAPSHOTS: usize = 10_000;

/// Bounded wait for workers to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            poll_interval: CLOSE_POLL_INTERVAL,
            max_polls: CLOSE_MAX_POLLS,
        }
    }
}

impl ShutdownPolicy {
    /// Upper bound of the whole wait.
    pub fn timeout(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

/// Request sent from the control side to one worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Start watching a process on this worker.
    Watch(i32),
    /// Sample every watcher, stamping the snapshots with the tick time.
    Sample(DateTime<Utc>),
    /// Drop every watcher.
    Dispose,
    /// Leave the command loop.
    Stop,
}

/// A tracked process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: i32,
    pub process_id: ProcessId,
}

/// What every worker needs to sample and report.
#[derive(Clone)]
pub struct WorkerContext {
    pub proc_root: PathBuf,
    pub feeder_tx: UnboundedSender<FeederMessage>,
    pub exit_tx: UnboundedSender<ProcessExit>,
    /// Snapshots sent to the feeder and not yet received by it.
    pub queued: Arc<AtomicUsize>,
    pub max_queued: usize,
    pub stats: Arc<HealthStats>,
}

impl WorkerContext {
    fn report_exit(&self, process_id: ProcessId) {
        debug!("Process {} exited", process_id);
        self.stats.record_process_exited();
        let exit = ProcessExit {
            pid: process_id.pid,
            process_id,
        };
        if self.exit_tx.send(exit).is_err() {
            debug!("Scheduler is gone, dropping exit of {}", process_id);
        }
    }

    fn start_watcher(&self, pid: i32) -> Option<ProcessWatcher> {
        let mut watcher = ProcessWatcher::new(pid, &self.proc_root);
        let name = watcher.init();
        if !watcher.is_alive() {
            self.report_exit(watcher.process_id());
            return None;
        }
        if !watcher.is_accessible() {
            self.stats.record_process_inaccessible();
        }
        self.stats.record_process_started();

        let message = FeederMessage::ProcessInitialized {
            process_id: watcher.process_id(),
            name: name.unwrap_or_default(),
        };
        if self.feeder_tx.send(message).is_err() {
            debug!("Feeder is gone, not announcing {}", watcher.process_id());
        }
        Some(watcher)
    }

    /// Samples one watcher. Returns false once the process is gone.
    fn sample(&self, watcher: &ProcessWatcher, time: DateTime<Utc>) -> bool {
        if !watcher.is_alive() {
            self.report_exit(watcher.process_id());
            return false;
        }

        let queued = self.queued.load(Ordering::Relaxed);
        if queued >= self.max_queued {
            warn!(
                "{} snapshots queued, skipping sample of {}",
                queued,
                watcher.process_id()
            );
            self.stats.record_sample_throttled();
            return true;
        }

        match watcher.sample(time) {
            Ok(SampleOutcome::Snapshot(snapshot)) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                if self.feeder_tx.send(FeederMessage::Snapshot(snapshot)).is_err() {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    debug!("Feeder is gone, dropping sample of {}", watcher.process_id());
                } else {
                    self.stats.record_sample_sent();
                }
                true
            }
            Ok(SampleOutcome::Exited(process_id)) => {
                self.report_exit(process_id);
                false
            }
            Err(e) => {
                warn!("Failed to sample {}: {}", watcher.process_id(), e);
                self.stats.record_sample_dropped();
                true
            }
        }
    }
}

/// Moves every command already waiting in `rx` to the back of `pending`.
fn drain_pending(rx: &mut UnboundedReceiver<WorkerCommand>, pending: &mut VecDeque<WorkerCommand>) {
    while let Ok(command) = rx.try_recv() {
        pending.push_back(command);
    }
}

fn run_worker(name: &str, mut rx: UnboundedReceiver<WorkerCommand>, ctx: WorkerContext) {
    let mut watchers: Vec<ProcessWatcher> = Vec::new();
    // Commands pulled off the channel ahead of time, still in send order.
    let mut pending: VecDeque<WorkerCommand> = VecDeque::new();
    debug!("{} started", name);

    loop {
        let command = match pending.pop_front() {
            Some(command) => command,
            None => match rx.blocking_recv() {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            WorkerCommand::Watch(pid) => {
                if let Some(watcher) = ctx.start_watcher(pid) {
                    watchers.push(watcher);
                }
            }
            WorkerCommand::Sample(time) => {
                // Ticks that piled up while this worker was blocked are
                // collapsed into the newest one.
                drain_pending(&mut rx, &mut pending);
                if pending
                    .iter()
                    .any(|c| matches!(c, WorkerCommand::Sample(_)))
                {
                    debug!("{} skipping stale tick {}", name, time);
                    ctx.stats.record_stale_tick_skipped();
                    continue;
                }
                watchers.retain(|watcher| ctx.sample(watcher, time));
            }
            WorkerCommand::Dispose => {
                debug!("{} disposing {} watchers", name, watchers.len());
                watchers.clear();
            }
            WorkerCommand::Stop => break,
        }
    }

    debug!("{} stopped", name);
}

struct Worker {
    name: String,
    tx: UnboundedSender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed set of worker threads.
pub struct WorkerGroup {
    workers: Vec<Worker>,
}

impl WorkerGroup {
    /// Starts `count` workers (at least one).
    pub fn spawn(count: usize, ctx: WorkerContext) -> io::Result<Self> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let name = format!("mw-worker-{}", index);
            let (tx, rx) = unbounded_channel();
            let worker_ctx = ctx.clone();
            let thread_name = name.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(&thread_name, rx, worker_ctx))?;
            workers.push(Worker {
                name,
                tx,
                handle: Some(handle),
            });
        }

        info!("Started {} workers", count);
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sends `command` to worker `index`. False when the worker is gone.
    pub fn send(&self, index: usize, command: WorkerCommand) -> bool {
        match self.workers.get(index) {
            Some(worker) => worker.tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Sends `command` to every worker.
    pub fn broadcast(&self, command: WorkerCommand) {
        for worker in &self.workers {
            if worker.tx.send(command.clone()).is_err() {
                debug!("{} no longer accepts commands", worker.name);
            }
        }
    }

    /// Waits for every worker thread to finish, polling per `policy`.
    ///
    /// Returns false when some worker did not stop in time; those threads
    /// are detached and left to the process exit.
    pub fn join_with_timeout(&mut self, policy: ShutdownPolicy) -> bool {
        let mut polls = 0;
        while self.workers.iter().any(|w| !is_finished(w)) {
            if polls >= policy.max_polls {
                let stuck: Vec<&str> = self
                    .workers
                    .iter()
                    .filter(|w| !is_finished(w))
                    .map(|w| w.name.as_str())
                    .collect();
                warn!(
                    "Timeout waiting for workers to stop after {:?}: {}",
                    policy.timeout(),
                    stuck.join(", ")
                );
                for worker in &mut self.workers {
                    worker.handle.take();
                }
                return false;
            }
            thread::sleep(policy.poll_interval);
            polls += 1;
        }

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("{} panicked", worker.name);
                }
            }
        }
        true
    }
}

fn is_finished(worker: &Worker) -> bool {
    worker
        .handle
        .as_ref()
        .map_or(true, |handle| handle.is_finished())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(
        proc_root: PathBuf,
    ) -> (
        WorkerContext,
        UnboundedReceiver<FeederMessage>,
        UnboundedReceiver<ProcessExit>,
    ) {
        let (feeder_tx, feeder_rx) = unbounded_channel();
        let (exit_tx, exit_rx) = unbounded_channel();
        let ctx = WorkerContext {
            proc_root,
            feeder_tx,
            exit_tx,
            queued: Arc::new(AtomicUsize::new(0)),
            max_queued: DEFAULT_MAX_QUEUED_SNAPSHOTS,
            stats: Arc::new(HealthStats::new()),
        };
        (ctx, feeder_rx, exit_rx)
    }

    #[test]
    fn test_shutdown_policy_defaults() {
        let policy = ShutdownPolicy::default();
        assert_eq!(policy.poll_interval, Duration::from_millis(100));
        assert_eq!(policy.max_polls, 100);
        assert_eq!(policy.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_spawn_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _feeder_rx, _exit_rx) = context(dir.path().to_path_buf());

        let mut group = WorkerGroup::spawn(0, ctx).unwrap();
        assert_eq!(group.len(), 1);
        assert!(!group.send(1, WorkerCommand::Dispose));

        group.broadcast(WorkerCommand::Stop);
        assert!(group.join_with_timeout(ShutdownPolicy {
            poll_interval: Duration::from_millis(10),
            max_polls: 500,
        }));
    }

    #[test]
    fn test_watch_of_missing_process_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _feeder_rx, mut exit_rx) = context(dir.path().to_path_buf());

        let mut group = WorkerGroup::spawn(1, ctx).unwrap();
        assert!(group.send(0, WorkerCommand::Watch(4242)));
        group.broadcast(WorkerCommand::Stop);
        assert!(group.join_with_timeout(ShutdownPolicy::default()));

        let exit = exit_rx.try_recv().unwrap();
        assert_eq!(exit.pid, 4242);
    }

    #[test]
    fn test_throttled_sample_keeps_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("5");
        std::fs::create_dir(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("smaps"), "").unwrap();
        std::fs::write(proc_dir.join("statm"), "1 1 1 1 0 1 0\n").unwrap();

        let (mut ctx, mut feeder_rx, _exit_rx) = context(dir.path().to_path_buf());
        ctx.max_queued = 0;
        let watcher = ctx.start_watcher(5).unwrap();
        assert!(matches!(
            feeder_rx.try_recv().unwrap(),
            FeederMessage::ProcessInitialized { .. }
        ));

        assert!(ctx.sample(&watcher, Utc::now()));
        assert!(feeder_rx.try_recv().is_err());
        assert_eq!(ctx.stats.samples_throttled.load(Ordering::Relaxed), 1);

        ctx.max_queued = 1;
        assert!(ctx.sample(&watcher, Utc::now()));
        assert!(matches!(
            feeder_rx.try_recv().unwrap(),
            FeederMessage::Snapshot(_)
        ));
        assert_eq!(ctx.queued.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_blocked_worker_samples_only_newest_tick() {
        use nix::sys::stat::Mode;
        use nix::unistd::mkfifo;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("6");
        std::fs::create_dir(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("statm"), "1 1 1 1 0 1 0\n").unwrap();
        let smaps = proc_dir.join("smaps");
        mkfifo(&smaps, Mode::S_IRWXU).unwrap();

        let (ctx, mut feeder_rx, _exit_rx) = context(dir.path().to_path_buf());
        let stats = ctx.stats.clone();
        let mut group = WorkerGroup::spawn(1, ctx).unwrap();

        // The watcher blocks opening the FIFO while the ticks queue up.
        let t = |ms| DateTime::from_timestamp_millis(ms).unwrap();
        assert!(group.send(0, WorkerCommand::Watch(6)));
        for ms in [1_000, 2_000, 3_000] {
            assert!(group.send(0, WorkerCommand::Sample(t(ms))));
        }

        // Opening the write end releases the reader; later reads hit a
        // regular file.
        let mut writer = std::fs::OpenOptions::new().write(true).open(&smaps).unwrap();
        std::fs::remove_file(&smaps).unwrap();
        std::fs::write(
            &smaps,
            "1000-2000 rw-p 00000000 00:00 0\nRss: 8 kB\nPss: 8 kB\nVmFlags: rd\n",
        )
        .unwrap();
        writer.write_all(b"1000-2000 rw-p 00000000 00:00 0\nVmFlags: rd\n").unwrap();
        drop(writer);

        group.broadcast(WorkerCommand::Stop);
        assert!(group.join_with_timeout(ShutdownPolicy {
            poll_interval: Duration::from_millis(10),
            max_polls: 500,
        }));

        let mut times = Vec::new();
        while let Ok(message) = feeder_rx.try_recv() {
            if let FeederMessage::Snapshot(snapshot) = message {
                times.push(snapshot.time);
            }
        }
        assert_eq!(times, vec![t(3_000)]);
        assert_eq!(stats.stale_ticks_skipped.load(Ordering::Relaxed), 2);
    }
}
