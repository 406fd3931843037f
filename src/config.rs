//! Configuration management for memory-watcher.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat};
use memory_watcher::pool::{
    ShutdownPolicy, CLOSE_MAX_POLLS, CLOSE_POLL_INTERVAL, DEFAULT_MAX_QUEUED_SNAPSHOTS,
};
use memory_watcher::scheduler::{default_workers, SchedulerOptions, DEFAULT_PERIOD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// Default configuration constants
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_DATABASE_FILE: &str = "measurement.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    // Sampling
    pub period_ms: Option<u64>,
    pub proc_root: Option<PathBuf>,
    pub pids: Option<Vec<i32>>,
    pub workers: Option<usize>,
    pub max_queued_snapshots: Option<usize>,
    pub record_system_memory: Option<bool>,

    // Storage
    pub database_file: Option<PathBuf>,

    // Shutdown
    pub close_poll_interval_ms: Option<u64>,
    pub close_max_polls: Option<u32>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            period_ms: Some(DEFAULT_PERIOD.as_millis() as u64),
            proc_root: Some(PathBuf::from(DEFAULT_PROC_ROOT)),
            pids: None,
            workers: None,
            max_queued_snapshots: Some(DEFAULT_MAX_QUEUED_SNAPSHOTS),
            record_system_memory: Some(true),
            database_file: None,
            close_poll_interval_ms: Some(CLOSE_POLL_INTERVAL.as_millis() as u64),
            close_max_polls: Some(CLOSE_MAX_POLLS),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    /// The configured file, or `measurement.<pid>.db` when exactly one
    /// process is watched, or `measurement.db`.
    pub fn effective_database_file(&self) -> PathBuf {
        if let Some(path) = &self.database_file {
            return path.clone();
        }
        match self.pids.as_deref() {
            Some([pid]) => PathBuf::from(format!("measurement.{}.db", pid)),
            _ => PathBuf::from(DEFAULT_DATABASE_FILE),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        let defaults = SchedulerOptions::default();
        SchedulerOptions {
            proc_root: self.proc_root.clone().unwrap_or(defaults.proc_root),
            period: self
                .period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.period),
            pids: self.pids.clone().unwrap_or_default(),
            workers: match self.workers {
                Some(n) if n > 0 => n,
                _ => default_workers(),
            },
            max_queued_snapshots: self
                .max_queued_snapshots
                .unwrap_or(defaults.max_queued_snapshots),
            record_system_memory: self
                .record_system_memory
                .unwrap_or(defaults.record_system_memory),
            shutdown: ShutdownPolicy {
                poll_interval: self
                    .close_poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(CLOSE_POLL_INTERVAL),
                max_polls: self.close_max_polls.unwrap_or(CLOSE_MAX_POLLS),
            },
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.period_ms == Some(0) {
        return Err("period_ms must be greater than 0".into());
    }
    if cfg.close_max_polls == Some(0) {
        return Err("close_max_polls must be greater than 0".into());
    }
    if cfg.max_queued_snapshots == Some(0) {
        return Err("max_queued_snapshots must be greater than 0".into());
    }
    if cfg
        .proc_root
        .as_ref()
        .is_some_and(|p| p.as_os_str().is_empty())
    {
        return Err("proc_root must not be empty".into());
    }
    if let Some(pids) = &cfg.pids {
        if let Some(pid) = pids.iter().find(|pid| **pid <= 0) {
            return Err(format!("Invalid pid {}", pid).into());
        }
    }
    if let Some(level) = cfg.log_level.as_deref() {
        if !matches!(level, "off" | "error" | "warn" | "info" | "debug" | "trace") {
            return Err(format!(
                "Invalid log_level '{}', expected off/error/warn/info/debug/trace",
                level
            )
            .into());
        }
    }
    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if !args.pids.is_empty() {
        config.pids = Some(args.pids.clone());
    }
    if let Some(period_ms) = args.period_ms {
        config.period_ms = Some(period_ms);
    }
    if let Some(path) = &args.database_file {
        config.database_file = Some(path.clone());
    }
    if let Some(proc_root) = &args.proc_root {
        config.proc_root = Some(proc_root.clone());
    }
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    if args.no_system_memory {
        config.record_system_memory = Some(false);
    }
    if let Some(level) = args.log_level {
        config.log_level = Some(level.as_str().to_string());
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        // Try default locations
        let defaults = [
            "/etc/memory-watcher/config.yaml",
            "./memory-watcher.yaml",
            "./memory-watcher.json",
        ];

        defaults
            .iter()
            .find(|p| Path::new(p).exists())
            .map(PathBuf::from)
            .unwrap_or_default()
    };

    if path.as_os_str().is_empty() || !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    println!("{output}");
    Ok(())
}
