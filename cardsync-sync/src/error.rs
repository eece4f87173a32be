//! Error types for cardsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use cardsync_core::ConfigError;

/// Store-level and I/O errors. Any of these is fatal for the run; per-block
/// conditions are reported as data in [`crate::pipeline::RunReport`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from configuration loading.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (state store save path).
    #[error("state store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted state exists but cannot be read as a State Store.
    #[error("state store at {path} is corrupt: {source}; rebuild it from the remote collection")]
    StoreCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another writer holds the store.
    #[error("state store at {path} is locked by another run (remove {path}.lock if stale)")]
    StoreLocked { path: PathBuf },

    /// Flush attempted on a store opened for reporting only.
    #[error("state store at {path} was opened read-only")]
    StoreReadOnly { path: PathBuf },

    /// Marker label or comment prefix produced an unusable pattern.
    #[error("invalid marker pattern: {0}")]
    MarkerPattern(#[from] regex::Error),

    /// A marker injection targets a line the file does not have.
    #[error("{path}: line {line} is out of range (file has {len} lines)")]
    LineOutOfRange {
        path: PathBuf,
        line: usize,
        len: usize,
    },

    /// A remote query failed during reconciliation or rebuild.
    #[error("remote collection error: {0}")]
    Remote(#[from] RemoteError),
}

/// Failure reported by the remote collection client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote rejected or failed a single call.
    #[error("remote call failed: {message}")]
    Call { message: String },

    /// The remote could not be reached at all.
    #[error("remote collection unavailable: {message}")]
    Unavailable { message: String },
}

impl RemoteError {
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
