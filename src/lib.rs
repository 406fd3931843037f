//! Memory Watcher Library
//!
//! Periodically samples per-process memory maps and system-wide memory
//! counters from the proc filesystem and records them into an embedded
//! SQLite time series for later peak analysis and replay.
//!
//! # Components
//!
//! - **Sampling**: [`process`] parses smaps/statm/OOM sources and keeps one
//!   [`process::ProcessWatcher`] per monitored process
//! - **Scheduling**: [`scheduler::Scheduler`] drives the tick and hands work
//!   to the threads of a [`pool::WorkerGroup`]
//! - **Persistence**: [`feeder::Feeder`] is the single writer of
//!   [`storage::Storage`], which also serves the read queries
//! - **Classification**: [`process::group`] re-derives heap, stacks, sockets,
//!   anonymous memory and per-library sizes from stored ranges
//!
//! # Usage
//!
//! ```rust
//! use memory_watcher::process::MemoryType;
//! use memory_watcher::storage::Storage;
//!
//! let mut storage = Storage::open_in_memory().unwrap();
//! let count = storage.measurement_count().unwrap();
//! if let Some(peak) = storage
//!     .get_memory_peak(None, MemoryType::Pss, 0, count, false)
//!     .unwrap()
//! {
//!     let groups = peak.groups(MemoryType::Pss, true);
//!     for mapping in groups.sorted_mappings().iter().take(10) {
//!         println!("{}: {} kB", mapping.name, mapping.size);
//!     }
//! }
//! ```

pub mod error;
pub mod feeder;
pub mod health_stats;
pub mod pool;
pub mod process;
pub mod scheduler;
pub mod storage;
pub mod system;

// Re-export main types for convenience
pub use error::{ProcError, StorageError};
pub use feeder::{Feeder, FeederMessage};
pub use pool::{ShutdownPolicy, WorkerCommand, WorkerGroup, CLOSE_MAX_POLLS, CLOSE_POLL_INTERVAL};
pub use process::{MeasurementGroups, MemoryType, ProcessId, ProcessSnapshot, ProcessWatcher};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use storage::{Measurement, Storage};
pub use system::{AvailableEstimator, MemInfo, SystemSampler, SystemSnapshot};
