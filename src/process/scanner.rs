//! Process scanning utilities for discovering and reading process entries from /proc.
//!
//! This module provides functions to scan the proc root for process entries
//! and read the process display name.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Process entry representing a directory in /proc filesystem.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub pid: i32,
    pub proc_path: PathBuf,
}

/// Scans the proc root for process entries with numeric PIDs that expose smaps.
pub fn collect_proc_entries(root: &Path) -> Vec<ProcEntry> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to list {}: {}", root.display(), e);
            return out;
        }
    };

    for entry in entries.flatten() {
        let p = entry.path();
        let name = match p.file_name().and_then(|s| s.to_str()) {
            Some(v) => v,
            None => continue,
        };
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if !p.join("smaps").exists() {
            continue;
        }
        let pid: i32 = match name.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        out.push(ProcEntry { pid, proc_path: p });
    }
    out.sort_by_key(|e| e.pid);
    out
}

/// Reads process name from the `Name:` line of status, falling back to comm.
pub fn read_process_name(proc_path: &Path) -> Option<String> {
    if let Ok(status) = fs::read_to_string(proc_path.join("status")) {
        for line in status.lines() {
            if let Some(name) = line.strip_prefix("Name:") {
                let name = name.trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
                break;
            }
        }
    }

    let comm = fs::read_to_string(proc_path.join("comm")).ok()?;
    let t = comm.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collect_proc_entries() {
        let dir = tempdir().unwrap();
        for pid in ["12", "3", "self", "40"] {
            let p = dir.path().join(pid);
            fs::create_dir(&p).unwrap();
            fs::write(p.join("smaps"), "").unwrap();
        }
        // numeric but without smaps (e.g. a vanished process)
        fs::create_dir(dir.path().join("99")).unwrap();

        let pids: Vec<i32> = collect_proc_entries(dir.path()).iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![3, 12, 40]);
    }

    #[test]
    fn test_collect_proc_entries_missing_root() {
        assert!(collect_proc_entries(Path::new("/nonexistent/proc/root")).is_empty());
    }

    #[test]
    fn test_read_process_name_from_status() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("status"),
            "Name:\tpostgres\nUmask:\t0077\nState:\tS (sleeping)\n",
        )
        .unwrap();
        fs::write(dir.path().join("comm"), "other\n").unwrap();

        assert_eq!(read_process_name(dir.path()).as_deref(), Some("postgres"));
    }

    #[test]
    fn test_read_process_name_falls_back_to_comm() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("comm"), "nginx\n").unwrap();

        assert_eq!(read_process_name(dir.path()).as_deref(), Some("nginx"));
        assert_eq!(read_process_name(&dir.path().join("missing")), None);
    }
}
