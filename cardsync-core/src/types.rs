//! Domain types for cardsync.
//!
//! Source paths inside [`Block`] are kept as the extractor reports them
//! (relative to the source root); they take part in identity minting, so
//! they are stored as `String`, not `PathBuf`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of identities assigned to remote records that have no discoverable
/// source identity.
pub const SYNTHETIC_PREFIX: &str = "remote-";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Full identity of a block's card lineage.
///
/// Minted identities are 64 lowercase hex characters. Identities adopted from
/// the remote collection without a source counterpart are synthetic
/// (`remote-<id>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Synthetic identity for a remote record with no discoverable source identity.
    pub fn synthetic(remote_id: RemoteId) -> Self {
        Self(format!("{SYNTHETIC_PREFIX}{remote_id}"))
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_PREFIX)
    }

    /// The leading `len` characters, the only form written into source files.
    pub fn short(&self, len: usize) -> ShortIdentity {
        ShortIdentity(self.0.chars().take(len).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Truncated identity as embedded in a source marker comment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortIdentity(pub String);

impl ShortIdentity {
    /// Whether `identity` starts with this short form.
    pub fn matches(&self, identity: &Identity) -> bool {
        identity.0.starts_with(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ShortIdentity {
    fn from(s: String) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

impl From<&str> for ShortIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

/// Digest of a block's canonical body. Independent of the source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier the remote collection assigned to a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub u64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for RemoteId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Where a note lives inside the remote collection (a deck name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionLocation(pub String);

impl fmt::Display for CollectionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CollectionLocation {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CollectionLocation {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Processing epoch attached to UPDATE actions for audit tagging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub String);

impl Revision {
    /// `rev:YYYYMMDD` for the given instant.
    pub fn for_date(at: DateTime<Utc>) -> Self {
        Self(format!("rev:{}", at.format("%Y%m%d")))
    }

    pub fn today() -> Self {
        Self::for_date(Utc::now())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A unit of source content eligible for conversion to a flashcard.
///
/// Produced by the upstream extractor; `(source_file, start_line)` is only
/// meaningful for the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub source_file: String,
    /// 1-based line of the block's opening marker.
    pub start_line: usize,
    pub end_line: usize,
    /// Environment kind (`definition`, `theorem`, ...).
    pub kind: String,
    pub raw_body: String,
    pub normalized_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_short_identity: Option<ShortIdentity>,
    /// 1-based line the embedded marker was read from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_line: Option<usize>,
}

impl Block {
    /// `file:line`, used in every report and log line.
    pub fn location(&self) -> String {
        format!("{}:{}", self.source_file, self.start_line)
    }
}

/// The State Store's record of a block's remote flashcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    /// Mirrors the store key; restored from the key on load.
    #[serde(default)]
    pub identity: Identity,
    /// Absent for records written without a remote collection (offline export).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    pub collection_location: CollectionLocation,
    pub content_hash: ContentHash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fields written by newer versions; kept verbatim on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NoteRecord {
    /// A fresh record for a successful CREATE.
    pub fn created(
        identity: Identity,
        remote_id: Option<RemoteId>,
        collection_location: CollectionLocation,
        content_hash: ContentHash,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            remote_id,
            collection_location,
            content_hash,
            created_at: at,
            updated_at: at,
            extra: Map::new(),
        }
    }
}

/// A note as seen through a scoped query against the remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub remote_id: RemoteId,
    pub collection_location: CollectionLocation,
    /// Identity embedded in the remote note (e.g. a tag), where available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Front field text, used to hash adopted records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
