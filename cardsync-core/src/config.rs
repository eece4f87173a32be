//! Sync configuration loaded from `cardsync.yaml`.
//!
//! # Storage layout
//!
//! ```text
//! <source_root>/
//!   cardsync.yaml        (per-repository config, optional)
//! ~/.cardsync/
//!   state.json           (default State Store location)
//! ```
//!
//! # API pattern
//!
//! Functions that depend on the home directory come in two forms:
//! - `fn_at(home: &Path, …)`: explicit home, used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::CollectionLocation;

/// File name searched for by [`find_config`].
pub const CONFIG_FILE: &str = "cardsync.yaml";

pub const DEFAULT_MARKER_LABEL: &str = "cardsync-id";
pub const DEFAULT_COMMENT_PREFIX: &str = "%";
pub const DEFAULT_CONTEXT_WINDOW: usize = 20;
pub const DEFAULT_SHORT_IDENTITY_LEN: usize = 12;
pub const DEFAULT_REMOTE_SCOPE: &str = "tag:auto tag:from-tex";
pub const DEFAULT_LOCATION: &str = "Default";

/// Shortest and longest short identity accepted in a marker.
pub const MIN_SHORT_IDENTITY_LEN: usize = 8;
pub const MAX_SHORT_IDENTITY_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Routes source files to a collection location by path glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRule {
    /// Glob patterns relative to the source root (`notes/analysis/**/*.tex`).
    pub paths: Vec<String>,
    pub location: CollectionLocation,
}

/// Engine configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Label token inside marker comments.
    pub marker_label: String,
    /// Line comment prefix of the source language.
    pub comment_prefix: String,
    /// Lines scanned above a block's opening line for its marker.
    pub context_window: usize,
    /// Characters of the full identity written into markers.
    pub short_identity_len: usize,
    /// Scope for `QUERY` against the remote collection.
    pub remote_scope: String,
    /// Location for files matching no rule.
    pub default_location: CollectionLocation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionRule>,
    /// Explicit State Store path; defaults to `~/.cardsync/state.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            marker_label: DEFAULT_MARKER_LABEL.to_string(),
            comment_prefix: DEFAULT_COMMENT_PREFIX.to_string(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            short_identity_len: DEFAULT_SHORT_IDENTITY_LEN,
            remote_scope: DEFAULT_REMOTE_SCOPE.to_string(),
            default_location: CollectionLocation::from(DEFAULT_LOCATION),
            collections: vec![],
            state_file: None,
        }
    }
}

impl SyncConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.marker_label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "marker_label",
                message: "must not be empty".to_string(),
            });
        }
        if self.comment_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "comment_prefix",
                message: "must not be empty".to_string(),
            });
        }
        if self.context_window == 0 {
            return Err(ConfigError::Invalid {
                field: "context_window",
                message: "must be at least 1 line".to_string(),
            });
        }
        if !(MIN_SHORT_IDENTITY_LEN..=MAX_SHORT_IDENTITY_LEN).contains(&self.short_identity_len) {
            return Err(ConfigError::Invalid {
                field: "short_identity_len",
                message: format!(
                    "{} is outside {MIN_SHORT_IDENTITY_LEN}..={MAX_SHORT_IDENTITY_LEN}",
                    self.short_identity_len
                ),
            });
        }
        for rule in &self.collections {
            for pattern in &rule.paths {
                Pattern::new(pattern).map_err(|source| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Collection location for a source file. First matching rule wins.
    pub fn location_for(&self, source_file: &str) -> CollectionLocation {
        for rule in &self.collections {
            let matched = rule
                .paths
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .any(|p| p.matches(source_file));
            if matched {
                return rule.location.clone();
            }
        }
        self.default_location.clone()
    }

    /// State Store path: the configured one, or `<home>/.cardsync/state.json`.
    pub fn state_path_at(&self, home: &Path) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| default_state_path_at(home))
    }

    /// `state_path_at` convenience wrapper.
    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(default_state_path_at(&home()?)),
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.cardsync/state.json`. Pure, no I/O.
pub fn default_state_path_at(home: &Path) -> PathBuf {
    home.join(".cardsync").join("state.json")
}

/// Locate `cardsync.yaml` in `dir` or any of its ancestors.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .map(|d| d.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load and validate a config file.
///
/// Returns `ConfigError::NotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_config(path: &Path) -> Result<SyncConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let config: SyncConfig = if contents.trim().is_empty() {
        SyncConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Load the config found from `dir` upwards, or defaults when there is none.
pub fn load_config_or_default(dir: &Path) -> Result<SyncConfig, ConfigError> {
    match find_config(dir) {
        Some(path) => load_config(&path),
        None => Ok(SyncConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
