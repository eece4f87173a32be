//! Orphan detection over the full source tree.
//!
//! Only meaningful with the complete block set: an incremental batch would
//! report every block outside it as an orphan.

use std::collections::BTreeSet;

use serde::Serialize;

use cardsync_core::{Block, Identity, ShortIdentity};

use crate::identity::{self, Resolution};
use crate::planner::Action;
use crate::reconcile::{selection_query, DiffEntry};
use crate::state_store::StateStore;

/// A block whose marker could not be resolved to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousBlock {
    /// `file:line`.
    pub location: String,
    pub short: ShortIdentity,
    pub candidates: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Tracked identities with no block anywhere in the source tree.
    pub orphans: Vec<DiffEntry>,
    /// Collision candidates, counted as present and never reported as orphans.
    pub ambiguous: Vec<AmbiguousBlock>,
    /// `nid:..` over orphans that have a remote id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_query: Option<String>,
}

impl OrphanReport {
    pub fn deletion_candidates(&self) -> Vec<Action> {
        self.orphans
            .iter()
            .map(|entry| Action::DeleteCandidate {
                identity: entry.identity.clone(),
                remote_id: entry.remote_id,
                location: entry.collection_location.clone(),
            })
            .collect()
    }
}

/// Compare every tracked identity against the full current block set.
pub fn detect(store: &StateStore, blocks: &[Block]) -> OrphanReport {
    let mut present: BTreeSet<Identity> = BTreeSet::new();
    let mut ambiguous = Vec::new();

    for block in blocks {
        match identity::resolve(store, block) {
            Resolution::Reused(id) | Resolution::Minted(id) => {
                present.insert(id);
            }
            Resolution::Collision { short, candidates } => {
                present.extend(candidates.iter().cloned());
                ambiguous.push(AmbiguousBlock {
                    location: block.location(),
                    short,
                    candidates,
                });
            }
        }
    }

    let orphans: Vec<DiffEntry> = store
        .all_records()
        .filter(|(id, _)| !present.contains(*id))
        .map(|(id, record)| DiffEntry {
            identity: id.clone(),
            remote_id: record.remote_id,
            collection_location: record.collection_location.clone(),
        })
        .collect();

    tracing::info!(
        "orphan scan: {} tracked, {} blocks, {} orphan(s), {} ambiguous",
        store.len(),
        blocks.len(),
        orphans.len(),
        ambiguous.len()
    );

    OrphanReport {
        selection_query: selection_query(orphans.iter().filter_map(|e| e.remote_id)),
        orphans,
        ambiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::content_hash;
    use crate::state_store::store_path_at;
    use cardsync_core::{CollectionLocation, NoteRecord, RemoteId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn block(file: &str, body: &str, marker: Option<&str>) -> Block {
        Block {
            source_file: file.into(),
            start_line: 2,
            end_line: 4,
            kind: "theorem".into(),
            raw_body: body.into(),
            normalized_body: body.into(),
            embedded_short_identity: marker.map(ShortIdentity::from),
            marker_line: marker.map(|_| 1),
        }
    }

    fn track(store: &mut StateStore, id: &Identity, remote_id: Option<u64>) {
        store.put(
            id.clone(),
            NoteRecord::created(
                id.clone(),
                remote_id.map(RemoteId),
                CollectionLocation::from("Default"),
                content_hash("x"),
                Utc::now(),
            ),
        );
    }

    #[test]
    fn untouched_tree_has_no_orphans() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let b = block("F.tex", "x", None);
        track(&mut store, &identity::mint(&b.kind, &b.normalized_body, &b.source_file), Some(1));

        let report = detect(&store, &[b]);
        assert!(report.orphans.is_empty());
        assert_eq!(report.selection_query, None);
    }

    #[test]
    fn removed_block_is_an_orphan() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let kept = Identity::from(format!("aaaaaaaaaaaa{}", "0".repeat(52)));
        let gone = Identity::from(format!("bbbbbbbbbbbb{}", "0".repeat(52)));
        track(&mut store, &kept, Some(1));
        track(&mut store, &gone, Some(2));

        let report = detect(&store, &[block("F.tex", "x", Some("aaaaaaaaaaaa"))]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].identity, gone);
        assert_eq!(report.selection_query.as_deref(), Some("nid:2"));
        assert!(matches!(
            report.deletion_candidates()[0],
            Action::DeleteCandidate {
                remote_id: Some(RemoteId(2)),
                ..
            }
        ));
    }

    #[test]
    fn collision_candidates_count_as_present() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        track(&mut store, &Identity::from(format!("abcdef12{}", "1".repeat(56))), Some(1));
        track(&mut store, &Identity::from(format!("abcdef12{}", "2".repeat(56))), None);

        let report = detect(&store, &[block("F.tex", "x", Some("abcdef12"))]);
        assert!(report.orphans.is_empty());
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].location, "F.tex:2");
    }
}
