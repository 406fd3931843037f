//! Startup requirement validation for memory-watcher.
//!
//! This module checks that the recorder can see the processes it is asked to
//! watch before any worker is started.

use nix::unistd::geteuid;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Validate all runtime requirements
pub fn validate_requirements(proc_root: &Path) -> Result<(), ValidationError> {
    info!("🔍 Validating runtime requirements...");

    check_user_privileges();
    check_proc_root(proc_root)?;
    check_smaps_access(proc_root);

    info!("✅ All runtime requirements validated");
    Ok(())
}

/// Check if running with sufficient privileges
fn check_user_privileges() {
    if !geteuid().is_root() {
        warn!("⚠️  Not running as root - smaps of other users' processes will be inaccessible");
        warn!("   Those processes are recorded from statm only");
    } else {
        info!("✅ Running as root (uid=0)");
    }
}

fn check_proc_root(proc_root: &Path) -> Result<(), ValidationError> {
    match fs::metadata(proc_root) {
        Ok(metadata) if metadata.is_dir() => {
            debug!("proc root {} found", proc_root.display());
            Ok(())
        }
        Ok(_) => {
            error!("❌ {} is not a directory", proc_root.display());
            Err(ValidationError::ProcRootMissing(proc_root.display().to_string()))
        }
        Err(e) => {
            error!("❌ Cannot access {}: {}", proc_root.display(), e);
            Err(ValidationError::ProcRootMissing(proc_root.display().to_string()))
        }
    }
}

/// Probe the smaps of init (pid 1) to report what will be visible.
fn check_smaps_access(proc_root: &Path) {
    let test_file = proc_root.join("1").join("smaps");

    match fs::File::open(&test_file) {
        Ok(_) => info!("✅ {} readable: all processes can be sampled", test_file.display()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!("⚠️  Cannot read {} - insufficient permissions", test_file.display());
            warn!("   Only processes of the current user get full mapping data");
            warn!("   Solution: run as root or grant cap_sys_ptrace,cap_dac_read_search");
        }
        Err(e) => debug!("Could not test-read {}: {}", test_file.display(), e),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("proc filesystem not found at {0}")]
    ProcRootMissing(String),
}
