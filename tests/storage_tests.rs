//! End-to-end recording tests: synthetic proc root, watcher, feeder thread,
//! on-disk store, then analysis through a reopened store.

mod common;

use chrono::{DateTime, Utc};
use memory_watcher::feeder::{Feeder, FeederMessage};
use memory_watcher::health_stats::HealthStats;
use memory_watcher::process::watcher::SampleOutcome;
use memory_watcher::process::{MemoryType, ProcessId, ProcessWatcher};
use memory_watcher::storage::Storage;
use memory_watcher::system::{AvailableEstimator, SystemSampler};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

use common::{write_meminfo, write_process, SMAPS};

const LIBRARY: &str = "/usr/lib/libapp.so";

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

/// The shared smaps content with the heap resident size replaced.
fn smaps_with_heap(rss: u64) -> String {
    SMAPS.replace(
        "Rss:                  60 kB\nPss:                  60 kB",
        &format!("Rss: {rss} kB\nPss: {rss} kB"),
    )
}

#[test]
fn test_recording_survives_reopen_and_finds_peak() {
    let proc_root = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("measurement.db");

    let dir = write_process(proc_root.path(), 100, "alpha", 1_000);
    write_meminfo(proc_root.path());

    let storage = Storage::init(&db_path).unwrap();
    let (tx, rx) = unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    let stats = Arc::new(HealthStats::new());
    let feeder = Feeder::new(storage, rx, queued.clone(), stats.clone())
        .spawn()
        .unwrap();

    let mut watcher = ProcessWatcher::new(100, proc_root.path());
    let name = watcher.init().unwrap();
    assert!(watcher.is_accessible());
    tx.send(FeederMessage::ProcessInitialized {
        process_id: watcher.process_id(),
        name,
    })
    .unwrap();

    let system = SystemSampler::new(proc_root.path());
    for (i, heap) in [100, 500, 300].into_iter().enumerate() {
        fs::write(dir.join("smaps"), smaps_with_heap(heap)).unwrap();
        let time = at(10_000 + i as i64 * 1_000);
        match watcher.sample(time).unwrap() {
            SampleOutcome::Snapshot(snapshot) => {
                queued.fetch_add(1, Ordering::Relaxed);
                tx.send(FeederMessage::Snapshot(snapshot)).unwrap();
            }
            SampleOutcome::Exited(id) => panic!("{} exited", id),
        }
        tx.send(FeederMessage::SystemSnapshot(system.sample(time).unwrap()))
            .unwrap();
    }
    tx.send(FeederMessage::Shutdown).unwrap();

    let storage = feeder.join().unwrap();
    assert_eq!(storage.measurement_count().unwrap(), 3);
    assert_eq!(queued.load(Ordering::Relaxed), 0);
    assert_eq!(stats.snapshots_committed.load(Ordering::Relaxed), 3);
    assert_eq!(stats.system_snapshots_committed.load(Ordering::Relaxed), 3);
    drop(storage);

    // a fresh connection sees everything the feeder committed
    let mut storage = Storage::init(&db_path).unwrap();
    let process_id = ProcessId::new(100, 1_000);
    assert_eq!(storage.measurement_count().unwrap(), 3);
    assert_eq!(storage.process_count().unwrap(), 1);
    assert_eq!(storage.system_snapshot_count().unwrap(), 3);
    assert_eq!(storage.lookup_pid(100).unwrap()[0].name, "alpha");
    assert_eq!(storage.get_all_ranges(&process_id).unwrap().len(), 5);

    let peak = storage
        .get_memory_peak(Some(&process_id), MemoryType::Rss, 0, 3, true)
        .unwrap()
        .unwrap();
    assert_eq!(peak.seq, 1);
    assert_eq!(peak.time, at(11_000));
    assert_eq!(peak.rss_sum, 264 + 500);
    assert_eq!(peak.ranges.len(), 5);

    let groups = peak.groups(MemoryType::Rss, true);
    assert_eq!(groups.mappings[LIBRARY], 200 + 40 + 16);
    assert_eq!(groups.heap, 500);
    assert_eq!(groups.thread_stacks, 8);
    assert_eq!(groups.anonymous, 0);
    assert_eq!(groups.sum, peak.rss_sum);
    assert_eq!(groups.statm.resident, 81 * 4);

    // outside the peak's window the next largest wins
    let later = storage
        .get_memory_peak(None, MemoryType::Rss, 2, 3, false)
        .unwrap()
        .unwrap();
    assert_eq!(later.rss_sum, 264 + 300);
    assert!(storage
        .get_memory_peak(None, MemoryType::Rss, 3, 10, false)
        .unwrap()
        .is_none());

    let system_peak = storage
        .get_system_memory_peak(AvailableEstimator::Kernel)
        .unwrap()
        .unwrap();
    assert_eq!(system_peak.time, at(10_000));

    let at_peak = storage.get_system_memory_at(at(11_500)).unwrap().unwrap();
    assert_eq!(at_peak.system.time, at(11_000));
    assert_eq!(at_peak.measurements.len(), 1);
    assert_eq!(at_peak.measurements[0].id, peak.id);
}

#[test]
fn test_inaccessible_process_is_recorded_from_statm() {
    let proc_root = tempfile::tempdir().unwrap();
    let dir = write_process(proc_root.path(), 7, "kthread", 70);
    fs::remove_file(dir.join("smaps")).unwrap();
    fs::create_dir(dir.join("smaps")).unwrap();

    let mut watcher = ProcessWatcher::new(7, proc_root.path());
    watcher.init();
    assert!(!watcher.is_accessible());

    let snapshot = match watcher.sample(at(1_000)).unwrap() {
        SampleOutcome::Snapshot(snapshot) => snapshot,
        SampleOutcome::Exited(id) => panic!("{} exited", id),
    };
    assert!(snapshot.ranges.is_empty());

    let mut storage = Storage::open_in_memory().unwrap();
    let id = storage.insert_snapshot(&snapshot).unwrap();
    let stored = storage.get_measurement(id).unwrap().unwrap();
    assert_eq!(stored.rss_sum, 0);
    assert_eq!(stored.statm.resident, 81 * 4);
    assert_eq!(stored.value(MemoryType::StatmRss), 81 * 4);
    assert_eq!(stored.oom_score.score, 12);
}
