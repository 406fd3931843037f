//! Synthetic proc root shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const SMAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/lib/libapp.so
Rss:                 200 kB
Pss:                 100 kB
VmFlags: rd ex mr mw me dw
00452000-00460000 rw-p 00052000 08:02 173521      /usr/lib/libapp.so
Rss:                  40 kB
Pss:                  40 kB
VmFlags: rd wr mr mw me ac
00460000-00470000 rw-p 00000000 00:00 0
Rss:                  16 kB
Pss:                  16 kB
VmFlags: rd wr mr mw me ac
00e03000-00e24000 rw-p 00000000 00:00 0           [heap]
Rss:                  60 kB
Pss:                  60 kB
VmFlags: rd wr mr mw me ac
7ffd1000-7ffd2000 rw-p 00000000 00:00 0           [stack]
Rss:                   8 kB
Pss:                   8 kB
VmFlags: rd wr mr mw me gd ac
";

pub const MEMINFO: &str = "\
MemTotal:       16314516 kB
MemFree:         1021364 kB
MemAvailable:    9234880 kB
Buffers:          527700 kB
Cached:          7880520 kB
SwapCached:            0 kB
SwapTotal:       2097148 kB
SwapFree:        2097148 kB
AnonPages:       5100000 kB
Mapped:           900000 kB
Shmem:            600000 kB
SReclaimable:     400000 kB
";

/// Writes `<root>/<pid>` with stat, status, statm, OOM values and smaps.
pub fn write_process(root: &Path, pid: i32, name: &str, start_time: u64) -> PathBuf {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("stat"),
        format!("{pid} ({name}) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 {start_time} 0 0"),
    )
    .unwrap();
    fs::write(dir.join("status"), format!("Name:\t{name}\n")).unwrap();
    fs::write(dir.join("statm"), "1000 81 10 5 0 20 0\n").unwrap();
    fs::write(dir.join("oom_adj"), "0\n").unwrap();
    fs::write(dir.join("oom_score"), "12\n").unwrap();
    fs::write(dir.join("oom_score_adj"), "-100\n").unwrap();
    fs::write(dir.join("smaps"), SMAPS).unwrap();
    dir
}

pub fn write_meminfo(root: &Path) {
    fs::write(root.join("meminfo"), MEMINFO).unwrap();
}

/// Polls `f` until it returns `Some` or `timeout` elapses.
pub fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
