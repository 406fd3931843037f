//! Stable process identity and the content hash used for row ids.
//!
//! A pid alone is not a stable identity because the kernel reuses pids. The
//! pair `(pid, starttime)` from `/proc/<pid>/stat` is, and every persisted row
//! is keyed by a 64-bit FNV-1a hash over such immutable fields.

use fnv::FnvHasher;
use std::fmt;
use std::fs;
use std::hash::Hasher;
use std::path::Path;
use tracing::warn;

use crate::error::ProcError;

/// Incremental FNV-1a hash over little-endian integers and strings.
///
/// Collisions are treated as identity; nothing checks for them.
#[derive(Default)]
pub struct ContentHash {
    inner: FnvHasher,
}

impl ContentHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.inner.write(&value.to_le_bytes());
        self
    }

    pub fn i64(self, value: i64) -> Self {
        self.u64(value as u64)
    }

    /// Strings are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn str(mut self, value: &str) -> Self {
        self.inner.write(&(value.len() as u64).to_le_bytes());
        self.inner.write(value.as_bytes());
        self
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

/// `(pid, start time)` composite identity of a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub pid: i32,
    /// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot.
    pub start_time: u64,
}

impl ProcessId {
    pub fn new(pid: i32, start_time: u64) -> Self {
        Self { pid, start_time }
    }

    /// Reads the start time of `pid` below `proc_root`.
    ///
    /// An unreadable stat file yields start time 0; the process is still
    /// tracked, only its identity degrades to the pid.
    pub fn read(pid: i32, proc_root: &Path) -> Self {
        let proc_path = proc_root.join(pid.to_string());
        let start_time = match parse_start_time_ticks(&proc_path) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to read start time of pid {}: {}", pid, e);
                0
            }
        };
        Self { pid, start_time }
    }

    /// Content hash identifying this process in the store.
    pub fn hash(&self) -> u64 {
        ContentHash::new()
            .i64(i64::from(self.pid))
            .u64(self.start_time)
            .finish()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (started at {})", self.pid, self.start_time)
    }
}

/// Parse process start time from /proc/<pid>/stat (field 22 - starttime in clock ticks).
///
/// The command name in field 2 may contain spaces and parentheses, so fields
/// are counted after the last `)`.
pub fn parse_start_time_ticks(proc_path: &Path) -> Result<u64, ProcError> {
    let stat_path = proc_path.join("stat");
    let content = fs::read_to_string(&stat_path).map_err(|e| ProcError::io(&stat_path, e))?;

    let line = content.lines().next().unwrap_or("");
    let comm_end = line
        .rfind(')')
        .ok_or_else(|| ProcError::malformed(&stat_path, "missing command name"))?;

    // Fields after comm start with field 3 (state), so starttime is index 19.
    let parts: Vec<&str> = line[comm_end + 1..].split_whitespace().collect();
    if parts.len() < 20 {
        return Err(ProcError::malformed(&stat_path, "too few fields"));
    }

    parts[19]
        .parse()
        .map_err(|_| ProcError::malformed(&stat_path, "invalid starttime field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_start_time_ticks() {
        let dir = tempdir().expect("Failed to create temp dir");
        let stat_content = "1234 (test process) S 1 1234 1234 0 -1 4194304 100 0 0 0 1000 500 0 0 20 0 1 0 12345 12345678 1234 18446744073709551615";
        std::fs::write(dir.path().join("stat"), stat_content).expect("Failed to write stat file");

        assert_eq!(parse_start_time_ticks(dir.path()).unwrap(), 12345);
    }

    #[test]
    fn test_parse_start_time_ticks_paren_in_name() {
        let dir = tempdir().expect("Failed to create temp dir");
        let stat_content = "77 (weird) name) R 1 77 77 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 999 0 0";
        std::fs::write(dir.path().join("stat"), stat_content).expect("Failed to write stat file");

        assert_eq!(parse_start_time_ticks(dir.path()).unwrap(), 999);
    }

    #[test]
    fn test_parse_start_time_ticks_truncated() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("stat"), "1234 (test) S 1 2 3").unwrap();

        assert!(parse_start_time_ticks(dir.path()).is_err());
    }

    #[test]
    fn test_read_missing_stat_defaults_to_zero() {
        let dir = tempdir().expect("Failed to create temp dir");
        let id = ProcessId::read(4242, dir.path());
        assert_eq!(id, ProcessId::new(4242, 0));
    }

    #[test]
    fn test_hash_is_stable_and_distinguishes_reuse() {
        let a = ProcessId::new(100, 5000);
        let b = ProcessId::new(100, 5000);
        let reused = ProcessId::new(100, 9000);

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), reused.hash());
    }

    #[test]
    fn test_content_hash_length_prefix() {
        let ab_c = ContentHash::new().str("ab").str("c").finish();
        let a_bc = ContentHash::new().str("a").str("bc").finish();
        assert_ne!(ab_c, a_bc);
    }
}
