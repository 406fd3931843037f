//! CLI arguments for memory-watcher.
//!
//! This module defines the command-line interface structure using the clap library.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "memory-watcher",
    about = "Records per-process memory maps and system memory into an SQLite time series",
    long_about = "Records per-process memory maps and system memory into an SQLite time series.\n\n\
                  Samples /proc/<pid>/smaps, statm and the OOM scores of the selected processes \
                  (or of every process) once per period, plus /proc/meminfo, and stores them \
                  for later peak analysis and replay.",
    version,
    propagate_version = true
)]
pub struct Args {
    /// Log level [default: info]
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Processes to watch (comma-separated); default is every process
    #[arg(short = 'p', long, value_delimiter = ',')]
    pub pids: Vec<i32>,

    /// Sampling period in milliseconds
    #[arg(long)]
    pub period_ms: Option<u64>,

    /// SQLite file to record into
    #[arg(short = 'o', long)]
    pub database_file: Option<PathBuf>,

    /// Root of the proc filesystem
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Worker threads (0 = available parallelism)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Do not record /proc/meminfo
    #[arg(long)]
    pub no_system_memory: bool,

    /// Store a saved smaps file as one measurement of the single --pids
    /// process, then exit
    #[arg(long, value_name = "FILE")]
    pub load_smaps: Option<PathBuf>,
}
