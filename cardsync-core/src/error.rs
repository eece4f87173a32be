//! Error types for cardsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load, with file path and serde_yaml line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    /// A value parsed but is out of range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    /// A collection routing pattern is not a valid glob.
    #[error("invalid path pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.cardsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
