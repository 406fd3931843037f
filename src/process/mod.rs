//! Process-related modules for identity, parsing, classification and sampling.
//!
//! This module provides:
//! - `identity`: `(pid, start time)` identity and content hashes
//! - `memory`: parsing of smaps, statm and OOM values
//! - `scanner`: process discovery and display names
//! - `classifier`: grouping of mappings into memory categories
//! - `watcher`: per-process sampling state

pub mod classifier;
pub mod identity;
pub mod memory;
pub mod scanner;
pub mod watcher;

// Re-export commonly used types
pub use classifier::{group, MappingSize, MeasurementGroups, MemoryType};
pub use identity::{ContentHash, ProcessId};
pub use memory::{OomScore, RangeKey, SmapsRange, StatM, PAGE_SIZE_KIB};
pub use scanner::{collect_proc_entries, read_process_name, ProcEntry};
pub use watcher::{load_smaps_snapshot, ProcessSnapshot, ProcessWatcher, SampleOutcome};
