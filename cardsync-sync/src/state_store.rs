//! State Store: durable mapping from identity to remote-record metadata.
//!
//! Persists a [`StateFile`] JSON document, by default at
//! `<home>/.cardsync/state.json`. Writes use the atomic `.tmp` + rename
//! protocol from [`crate::writer`].
//!
//! A [`StateStore`] handle owns an exclusive `<path>.lock` file for its whole
//! lifetime. Dropping the handle flushes pending changes and releases the
//! lock on every exit path; [`StateStore::close`] does the same but surfaces
//! flush errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cardsync_core::{
    config, CollectionLocation, Identity, NoteRecord, RemoteRecord, ShortIdentity, SyncConfig,
};

use crate::error::{io_err, SyncError};
use crate::normalize::content_hash;
use crate::writer::atomic_write;

/// Current on-disk schema version.
pub const STORE_VERSION: u32 = 1;

/// Length of a minted identity; shorter embedded identities are not adopted.
const FULL_IDENTITY_LEN: usize = 64;

// ---------------------------------------------------------------------------
// On-disk payload
// ---------------------------------------------------------------------------

/// One audit entry of the generation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEntry {
    pub recorded_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    /// Raw generator response, stored as returned.
    pub response: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, response: Value) -> Self {
        Self {
            recorded_at: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            response,
            extra: Map::new(),
        }
    }
}

/// On-disk State Store payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Last processed source revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_marker: Option<String>,
    #[serde(default)]
    pub notes: BTreeMap<Identity, NoteRecord>,
    #[serde(default)]
    pub generations: BTreeMap<Identity, Vec<GenerationEntry>>,
    /// Top-level fields written by newer versions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            process_marker: None,
            notes: BTreeMap::new(),
            generations: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// Summary numbers for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub total_notes: usize,
    /// Records without a remote id (written offline).
    pub unlinked_notes: usize,
    pub locations: BTreeSet<CollectionLocation>,
    pub generation_entries: usize,
    pub process_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// Lock file
// ---------------------------------------------------------------------------

/// `<path>.lock` for a store at `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store_path: &Path) -> Result<Self, SyncError> {
        if let Some(dir) = store_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }
        let path = lock_path_for(store_path);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SyncError::StoreLocked {
                    path: store_path.to_path_buf(),
                });
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        // Best effort: the pid only helps an operator clear a stale lock.
        let _ = writeln!(file, "{}", std::process::id());
        tracing::debug!("lock acquired: {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to release lock {}: {e}", self.path.display());
        } else {
            tracing::debug!("lock released: {}", self.path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Handle on an opened State Store.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: StateFile,
    dirty: bool,
    /// `None` for read-only handles.
    lock: Option<StoreLock>,
}

impl StateStore {
    /// Open the store at `path` for writing, taking the lock.
    ///
    /// A missing file yields an empty store. A file that cannot be parsed is
    /// [`SyncError::StoreCorrupt`]; it is never reset silently.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let lock = StoreLock::acquire(&path)?;
        let state = load_state(&path)?;
        tracing::debug!(
            "opened state store {} ({} notes)",
            path.display(),
            state.notes.len()
        );
        Ok(Self {
            path,
            state,
            dirty: false,
            lock: Some(lock),
        })
    }

    /// Open the store configured for `home` (see [`SyncConfig::state_path_at`]).
    pub fn open_at(home: &Path, config: &SyncConfig) -> Result<Self, SyncError> {
        Self::open(config.state_path_at(home))
    }

    /// Open a snapshot for reporting without taking the lock.
    ///
    /// The handle can be inspected freely; [`StateStore::flush`] refuses to
    /// write it back.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let state = load_state(&path)?;
        Ok(Self {
            path,
            state,
            dirty: false,
            lock: None,
        })
    }

    /// Replace whatever is at `path` with records rebuilt from a remote snapshot.
    ///
    /// Records carrying a full embedded identity keep it; all others get a
    /// synthetic `remote-<id>` identity. A corrupt file at `path` is first
    /// copied to `<path>.corrupt` so nothing is lost.
    ///
    /// Source blocks are not consulted, so later runs mint fresh identities
    /// for unmarked blocks and may create duplicates until reconciled.
    pub fn rebuild_from_remote(
        path: impl Into<PathBuf>,
        records: &[RemoteRecord],
    ) -> Result<Self, SyncError> {
        let path = path.into();
        let lock = StoreLock::acquire(&path)?;

        let mut state = StateFile::default();
        match load_state(&path) {
            Ok(previous) => {
                state.extra = previous.extra;
                state.generations = previous.generations;
            }
            Err(SyncError::StoreCorrupt { .. }) => {
                let backup = PathBuf::from(format!("{}.corrupt", path.display()));
                std::fs::copy(&path, &backup).map_err(|e| io_err(&backup, e))?;
                tracing::warn!("corrupt state store saved to {}", backup.display());
            }
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        for record in records {
            let identity = adoptable_identity(record, |id| state.notes.contains_key(id));
            let hash = content_hash(record.front.as_deref().unwrap_or_default());
            let note = NoteRecord::created(
                identity.clone(),
                Some(record.remote_id),
                record.collection_location.clone(),
                hash,
                now,
            );
            state.notes.insert(identity, note);
        }
        tracing::info!(
            "rebuilt state store {} from {} remote records",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            state,
            dirty: true,
            lock: Some(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // -- records -------------------------------------------------------------

    pub fn get(&self, identity: &Identity) -> Option<&NoteRecord> {
        self.state.notes.get(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.state.notes.contains_key(identity)
    }

    /// Insert or replace the record for `identity`.
    pub fn put(&mut self, identity: Identity, mut record: NoteRecord) {
        record.identity = identity.clone();
        self.state.notes.insert(identity, record);
        self.dirty = true;
    }

    /// Remove a record. Only reconciliation calls this.
    pub fn remove(&mut self, identity: &Identity) -> Option<NoteRecord> {
        let removed = self.state.notes.remove(identity);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// All records in identity order.
    pub fn all_records(&self) -> impl Iterator<Item = (&Identity, &NoteRecord)> {
        self.state.notes.iter()
    }

    pub fn len(&self) -> usize {
        self.state.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.notes.is_empty()
    }

    /// Every tracked identity starting with `short`.
    pub fn match_short(&self, short: &ShortIdentity) -> Vec<Identity> {
        let start = Identity::from(short.as_str());
        self.state
            .notes
            .range((Bound::Included(start), Bound::Unbounded))
            .map(|(identity, _)| identity)
            .take_while(|identity| short.matches(identity))
            .cloned()
            .collect()
    }

    // -- process marker ------------------------------------------------------

    pub fn process_marker(&self) -> Option<&str> {
        self.state.process_marker.as_deref()
    }

    pub fn set_process_marker(&mut self, marker: impl Into<String>) {
        self.state.process_marker = Some(marker.into());
        self.dirty = true;
    }

    // -- generation log ------------------------------------------------------

    /// Append to the generation log of `identity`. Entries are never rewritten.
    pub fn append_generation(&mut self, identity: &Identity, entry: GenerationEntry) {
        self.state
            .generations
            .entry(identity.clone())
            .or_default()
            .push(entry);
        self.dirty = true;
    }

    pub fn generations(&self, identity: &Identity) -> &[GenerationEntry] {
        self.state
            .generations
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // -- maintenance ---------------------------------------------------------

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            total_notes: self.state.notes.len(),
            unlinked_notes: self
                .state
                .notes
                .values()
                .filter(|r| r.remote_id.is_none())
                .count(),
            locations: self
                .state
                .notes
                .values()
                .map(|r| r.collection_location.clone())
                .collect(),
            generation_entries: self.state.generations.values().map(Vec::len).sum(),
            process_marker: self.state.process_marker.clone(),
        }
    }

    /// Forget every record, the generation log and the process marker.
    /// Unknown top-level fields survive.
    pub fn clear(&mut self) {
        let extra = std::mem::take(&mut self.state.extra);
        self.state = StateFile {
            extra,
            ..StateFile::default()
        };
        self.dirty = true;
    }

    /// Write pending changes to disk.
    pub fn flush(&mut self) -> Result<(), SyncError> {
        if !self.dirty {
            return Ok(());
        }
        if self.is_read_only() {
            return Err(SyncError::StoreReadOnly {
                path: self.path.clone(),
            });
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        atomic_write(&self.path, &json, true)?;
        self.dirty = false;
        tracing::debug!("flushed state store {}", self.path.display());
        Ok(())
    }

    /// Flush and release the lock.
    pub fn close(mut self) -> Result<(), SyncError> {
        self.flush()
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if self.dirty && !self.is_read_only() {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush state store on drop: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn load_state(path: &Path) -> Result<StateFile, SyncError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StateFile::default()),
        Err(e) => return Err(io_err(path, e)),
    };
    let mut state: StateFile =
        serde_json::from_str(&contents).map_err(|source| SyncError::StoreCorrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if state.version > STORE_VERSION {
        tracing::warn!(
            "state store {} has version {}, newer than {STORE_VERSION}; unknown fields are kept",
            path.display(),
            state.version
        );
    }
    for (identity, record) in state.notes.iter_mut() {
        record.identity = identity.clone();
    }
    Ok(state)
}

/// Identity to adopt a remote record under: its embedded identity when that is
/// a full minted identity not already tracked, else `remote-<id>`.
pub(crate) fn adoptable_identity(
    record: &RemoteRecord,
    is_tracked: impl Fn(&Identity) -> bool,
) -> Identity {
    match &record.identity {
        Some(embedded) if is_full_identity(embedded) => {
            let identity = Identity::from(embedded.to_ascii_lowercase());
            if is_tracked(&identity) {
                Identity::synthetic(record.remote_id)
            } else {
                identity
            }
        }
        _ => Identity::synthetic(record.remote_id),
    }
}

fn is_full_identity(s: &str) -> bool {
    s.len() == FULL_IDENTITY_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// `<home>/.cardsync/state.json`.
pub fn store_path_at(home: &Path) -> PathBuf {
    config::default_state_path_at(home)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
