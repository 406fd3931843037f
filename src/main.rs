//! memory-watcher - version 0.1.0
//!
//! Records per-process memory maps and system memory counters into an SQLite
//! time series. This is the main entry point that wires the scheduler, the
//! workers and the feeder together and handles shutdown signals.

mod cli;
mod config;
mod startup_checks;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
#[cfg(unix)]
use std::task::Poll;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use cli::Args;
use config::{resolve_config, show_config, validate_effective_config, Config};
use memory_watcher::feeder::Feeder;
use memory_watcher::health_stats::HealthStats;
use memory_watcher::process::load_smaps_snapshot;
use memory_watcher::scheduler::Scheduler;
use memory_watcher::storage::Storage;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config) {
    let log_level = match config.log_level.as_deref().unwrap_or("info") {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    info!("Logging initialized with level: {}", log_level);
}

/// Signals that end a recording, with the name logged on receipt.
#[cfg(unix)]
fn shutdown_signal_kinds() -> [(SignalKind, &'static str); 4] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::quit(), "SIGQUIT"),
        (SignalKind::hangup(), "SIGHUP"),
    ]
}

/// Installed listeners for every shutdown signal.
struct ShutdownSignals {
    #[cfg(unix)]
    listeners: Vec<(Signal, &'static str)>,
}

impl ShutdownSignals {
    /// Installs the handlers. One that cannot be installed is logged and
    /// left out.
    fn install() -> Self {
        #[cfg(unix)]
        let listeners = shutdown_signal_kinds()
            .into_iter()
            .filter_map(|(kind, name)| match signal::unix::signal(kind) {
                Ok(listener) => Some((listener, name)),
                Err(e) => {
                    error!("Failed to install {} handler: {}", name, e);
                    None
                }
            })
            .collect();

        Self {
            #[cfg(unix)]
            listeners,
        }
    }

    /// Resolves with the name of the first shutdown signal received.
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        std::future::poll_fn(|cx| {
            for (listener, name) in self.listeners.iter_mut() {
                if listener.poll_recv(cx).is_ready() {
                    return Poll::Ready(*name);
                }
            }
            Poll::Pending
        })
        .await
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}

/// Stores a saved smaps file as one measurement of the configured pid.
fn load_saved_smaps(config: &Config, smaps_file: &Path) -> anyhow::Result<()> {
    let pid = match config.pids.as_deref() {
        Some([pid]) => *pid,
        _ => anyhow::bail!("--load-smaps needs exactly one pid"),
    };
    let snapshot = load_smaps_snapshot(pid, smaps_file, Utc::now())
        .with_context(|| format!("cannot load {}", smaps_file.display()))?;

    let database_file = config.effective_database_file();
    let mut storage = Storage::init(&database_file)
        .with_context(|| format!("cannot open store {}", database_file.display()))?;
    let name = smaps_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| pid.to_string());
    storage.upsert_process(&snapshot.process_id, &name)?;
    let id = storage.insert_snapshot(&snapshot)?;

    info!(
        "Stored {} ranges of pid {} as measurement {} in {}",
        snapshot.ranges.len(),
        pid,
        id,
        database_file.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    let config = resolve_config(&args).map_err(|e| anyhow::anyhow!("{}", e))?;

    if args.check_config {
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }
        println!("✅ Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        return show_config(&config, args.config_format).map_err(|e| anyhow::anyhow!("{}", e));
    }

    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config);

    info!(
        "Starting memory-watcher {} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_BUILD_TIMESTAMP")
    );

    if let Some(smaps_file) = &args.load_smaps {
        return load_saved_smaps(&config, smaps_file);
    }

    let options = config.scheduler_options();
    startup_checks::validate_requirements(&options.proc_root)?;

    // The only fatal error after startup checks: without a store there is
    // nothing to record into.
    let database_file = config.effective_database_file();
    let storage = Storage::init(&database_file)
        .with_context(|| format!("cannot open store {}", database_file.display()))?;

    let stats = Arc::new(HealthStats::new());
    let queued = Arc::new(AtomicUsize::new(0));
    let (feeder_tx, feeder_rx) = unbounded_channel();

    let feeder = Feeder::new(storage, feeder_rx, queued.clone(), stats.clone())
        .spawn()
        .context("cannot start feeder thread")?;

    let scheduler = Scheduler::new(options, feeder_tx, queued, stats.clone())
        .context("cannot start workers")?;

    let mut signals = ShutdownSignals::install();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(cancel.clone()));

    let received = signals.recv().await;
    info!("Received {}, shutting down gracefully...", received);
    cancel.cancel();

    let stopped = match run.await {
        Ok(stopped) => stopped,
        Err(e) => {
            error!("Scheduler task failed: {}", e);
            false
        }
    };
    if !stopped {
        warn!("Some workers did not stop in time, exiting anyway");
    }

    match tokio::task::spawn_blocking(move || feeder.join()).await {
        Ok(Ok(storage)) => match storage.measurement_count() {
            Ok(count) => info!(
                "Recorded {} measurements into {}",
                count,
                database_file.display()
            ),
            Err(e) => warn!("Cannot count measurements: {}", e),
        },
        Ok(Err(_)) => error!("Feeder thread panicked"),
        Err(e) => error!("Feeder join failed: {}", e),
    }

    info!("\n{}", stats.render_table());
    info!("memory-watcher stopped gracefully");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal as RawSignal};
    use std::time::Duration;

    #[test]
    fn test_shutdown_signal_names() {
        let names: Vec<&str> = shutdown_signal_kinds().iter().map(|(_, n)| *n).collect();
        assert_eq!(names, vec!["SIGINT", "SIGTERM", "SIGQUIT", "SIGHUP"]);
    }

    #[tokio::test]
    async fn test_quit_and_hangup_end_the_recording() {
        let mut signals = ShutdownSignals::install();
        assert_eq!(signals.listeners.len(), 4);

        raise(RawSignal::SIGHUP).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(received, "SIGHUP");

        raise(RawSignal::SIGQUIT).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(received, "SIGQUIT");
    }
}
