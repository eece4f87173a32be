//! Boundary to the remote flashcard collection.
//!
//! The network client lives outside this crate and implements
//! [`RemoteCollection`]. [`MemoryCollection`] is an in-process stand-in used
//! for tests and offline previews.

use std::collections::{BTreeMap, BTreeSet};

use cardsync_core::{Block, CollectionLocation, Identity, RemoteId, RemoteRecord, Revision};

use crate::error::RemoteError;

/// Operations the engine needs from the remote collection.
pub trait RemoteCollection {
    /// Create a note for `block` and return the id the collection assigned.
    fn create(
        &mut self,
        block: &Block,
        identity: &Identity,
        location: &CollectionLocation,
    ) -> Result<RemoteId, RemoteError>;

    /// Update the note `remote_id` in place, tagging it with `revision`.
    fn update(
        &mut self,
        remote_id: RemoteId,
        block: &Block,
        revision: &Revision,
    ) -> Result<(), RemoteError>;

    /// Every note within `scope`.
    fn query(&self, scope: &str) -> Result<Vec<RemoteRecord>, RemoteError>;
}

/// A note held by [`MemoryCollection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNote {
    pub location: CollectionLocation,
    pub identity: Option<Identity>,
    pub front: String,
    pub tags: Vec<String>,
}

/// In-memory remote collection.
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    next_id: u64,
    notes: BTreeMap<RemoteId, MemoryNote>,
    failing: BTreeSet<String>,
    unavailable: bool,
    creates: usize,
    updates: usize,
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection whose first created note gets `first_id`.
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: first_id,
            notes: BTreeMap::new(),
            failing: BTreeSet::new(),
            unavailable: false,
            creates: 0,
            updates: 0,
        }
    }

    /// Make every call for the block at `file:line` fail.
    pub fn fail_at(&mut self, location: impl Into<String>) {
        self.failing.insert(location.into());
    }

    pub fn clear_failures(&mut self) {
        self.failing.clear();
        self.unavailable = false;
    }

    /// Make every call fail as if the collection were unreachable.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// Add a note created outside the engine.
    pub fn insert(&mut self, remote_id: RemoteId, note: MemoryNote) {
        self.next_id = self.next_id.max(remote_id.0 + 1);
        self.notes.insert(remote_id, note);
    }

    /// Delete a note out of band, as a user of the collection would.
    pub fn delete(&mut self, remote_id: RemoteId) -> Option<MemoryNote> {
        self.notes.remove(&remote_id)
    }

    pub fn get(&self, remote_id: RemoteId) -> Option<&MemoryNote> {
        self.notes.get(&remote_id)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Successful `create` calls so far.
    pub fn create_calls(&self) -> usize {
        self.creates
    }

    /// Successful `update` calls so far.
    pub fn update_calls(&self) -> usize {
        self.updates
    }

    fn check(&self, block: &Block) -> Result<(), RemoteError> {
        if self.unavailable {
            return Err(RemoteError::unavailable("memory collection offline"));
        }
        let location = block.location();
        if self.failing.contains(&location) {
            return Err(RemoteError::call(format!("injected failure for {location}")));
        }
        Ok(())
    }
}

impl RemoteCollection for MemoryCollection {
    fn create(
        &mut self,
        block: &Block,
        identity: &Identity,
        location: &CollectionLocation,
    ) -> Result<RemoteId, RemoteError> {
        self.check(block)?;
        let remote_id = RemoteId(self.next_id);
        self.next_id += 1;
        self.notes.insert(
            remote_id,
            MemoryNote {
                location: location.clone(),
                identity: Some(identity.clone()),
                front: block.normalized_body.clone(),
                tags: vec!["auto".into(), "from-tex".into()],
            },
        );
        self.creates += 1;
        Ok(remote_id)
    }

    fn update(
        &mut self,
        remote_id: RemoteId,
        block: &Block,
        revision: &Revision,
    ) -> Result<(), RemoteError> {
        self.check(block)?;
        let note = self
            .notes
            .get_mut(&remote_id)
            .ok_or_else(|| RemoteError::call(format!("note {remote_id} does not exist")))?;
        note.front = block.normalized_body.clone();
        if !note.tags.contains(&revision.0) {
            note.tags.push(revision.0.clone());
        }
        self.updates += 1;
        Ok(())
    }

    /// Scope is a tag filter: every whitespace-separated `tag:<name>` term
    /// must be present on the note. Other terms are ignored.
    fn query(&self, scope: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        if self.unavailable {
            return Err(RemoteError::unavailable("memory collection offline"));
        }
        let required: Vec<&str> = scope
            .split_whitespace()
            .filter_map(|term| term.strip_prefix("tag:"))
            .collect();
        Ok(self
            .notes
            .iter()
            .filter(|(_, note)| required.iter().all(|t| note.tags.iter().any(|x| x == t)))
            .map(|(remote_id, note)| RemoteRecord {
                remote_id: *remote_id,
                collection_location: note.location.clone(),
                identity: note.identity.as_ref().map(|id| id.0.clone()),
                front: Some(note.front.clone()),
            })
            .collect())
    }
}
