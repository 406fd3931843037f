//! The single writer of the store.
//!
//! Workers and the scheduler hand immutable values to the feeder over one
//! channel; the feeder thread owns the [`Storage`] and persists them in the
//! order it receives them.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::health_stats::HealthStats;
use crate::process::identity::ProcessId;
use crate::process::watcher::ProcessSnapshot;
use crate::storage::Storage;
use crate::system::SystemSnapshot;

#[derive(Debug, Clone)]
pub enum FeederMessage {
    /// A watcher was set up; sent before its first snapshot.
    ProcessInitialized { process_id: ProcessId, name: String },
    Snapshot(ProcessSnapshot),
    SystemSnapshot(SystemSnapshot),
    /// Stop after everything received so far is written.
    Shutdown,
}

pub struct Feeder {
    storage: Storage,
    rx: UnboundedReceiver<FeederMessage>,
    queued: Arc<AtomicUsize>,
    stats: Arc<HealthStats>,
}

impl Feeder {
    pub fn new(
        storage: Storage,
        rx: UnboundedReceiver<FeederMessage>,
        queued: Arc<AtomicUsize>,
        stats: Arc<HealthStats>,
    ) -> Self {
        Self {
            storage,
            rx,
            queued,
            stats,
        }
    }

    /// Runs the feeder on its own thread. Joining yields the store back.
    pub fn spawn(self) -> io::Result<JoinHandle<Storage>> {
        thread::Builder::new()
            .name("mw-feeder".to_string())
            .spawn(move || self.run())
    }

    /// Writes messages until [`FeederMessage::Shutdown`] or until every
    /// sender is gone.
    pub fn run(mut self) -> Storage {
        debug!("Feeder started");
        while let Some(message) = self.rx.blocking_recv() {
            if !self.handle(message) {
                break;
            }
        }
        info!("Feeder stopped");
        self.storage
    }

    /// Persists one message. Returns false on shutdown.
    fn handle(&mut self, message: FeederMessage) -> bool {
        match message {
            FeederMessage::ProcessInitialized { process_id, name } => {
                if let Err(e) = self.storage.upsert_process(&process_id, &name) {
                    warn!("Failed to store process {}: {}", process_id, e);
                }
            }
            FeederMessage::Snapshot(snapshot) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                let start = Instant::now();
                match self.storage.insert_snapshot(&snapshot) {
                    Ok(_) => self
                        .stats
                        .record_snapshot_committed(start.elapsed().as_secs_f64() * 1000.0),
                    // already logged by the store
                    Err(_) => self.stats.record_snapshot_failed(),
                }
            }
            FeederMessage::SystemSnapshot(snapshot) => {
                match self.storage.insert_system_snapshot(&snapshot) {
                    Ok(_) => self.stats.record_system_snapshot_committed(),
                    Err(e) => warn!("Failed to store system memory snapshot: {}", e),
                }
            }
            FeederMessage::Shutdown => return false,
        }
        true
    }
}
