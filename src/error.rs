//! Error types shared by the sampling path and the storage engine.

use std::path::PathBuf;

/// Failure to read or interpret one of the per-process `/proc` sources.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl ProcError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProcError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ProcError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the underlying open failed for lack of privileges.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ProcError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// Errors raised by [`crate::storage::Storage`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
