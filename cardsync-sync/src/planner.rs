//! Change detection and action planning.
//!
//! Planning is pure: it reads the State Store but never mutates it, and it
//! never talks to the remote collection.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use cardsync_core::{
    Block, CollectionLocation, ContentHash, Identity, NoteRecord, RemoteId, Revision,
    ShortIdentity, SyncConfig,
};

use crate::identity::{self, Resolution};
use crate::normalize::content_hash;
use crate::state_store::StateStore;

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// How a block's content relates to what the State Store last recorded.
///
/// `Unchanged` and `Changed` borrow the matched record, so an UPDATE can only
/// be planned from a record that exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState<'a> {
    New,
    Unchanged(&'a NoteRecord),
    Changed(&'a NoteRecord),
}

/// Compare a block body against the stored hash for `identity`.
pub fn compare<'a>(
    store: &'a StateStore,
    identity: &Identity,
    normalized_body: &str,
) -> ChangeState<'a> {
    match store.get(identity) {
        None => ChangeState::New,
        Some(record) if record.content_hash == content_hash(normalized_body) => {
            ChangeState::Unchanged(record)
        }
        Some(record) => ChangeState::Changed(record),
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Why a block was set aside for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    /// The embedded marker prefix-matches several tracked identities.
    IdentityCollision {
        short: ShortIdentity,
        candidates: Vec<Identity>,
    },
    /// Another block in the same file claimed the same marker line.
    SharedMarker { short: ShortIdentity, marker_line: usize },
    /// Another block in this batch resolved to the same identity.
    DuplicateIdentity { identity: Identity },
}

/// What to do with one block (or, for `DeleteCandidate`, one remote record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Create {
        identity: Identity,
        location: CollectionLocation,
        content_hash: ContentHash,
        inject_marker: bool,
    },
    Update {
        identity: Identity,
        remote_id: RemoteId,
        content_hash: ContentHash,
        revision: Revision,
    },
    Skip {
        identity: Identity,
        /// The block has no marker yet although its record exists.
        inject_marker: bool,
    },
    Defer {
        reason: DeferReason,
    },
    /// Recommendation only; never executed.
    DeleteCandidate {
        identity: Identity,
        remote_id: Option<RemoteId>,
        location: CollectionLocation,
    },
}

impl Action {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Action::Create { identity, .. }
            | Action::Update { identity, .. }
            | Action::Skip { identity, .. }
            | Action::DeleteCandidate { identity, .. } => Some(identity),
            Action::Defer { .. } => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Action::Create { .. } | Action::Update { .. })
    }
}

/// Plan one block whose identity is already resolved.
pub fn plan(
    block: &Block,
    identity: Identity,
    inject_marker: bool,
    change: ChangeState<'_>,
    config: &SyncConfig,
    revision: &Revision,
) -> Action {
    let hash = content_hash(&block.normalized_body);
    match change {
        ChangeState::New => Action::Create {
            identity,
            location: config.location_for(&block.source_file),
            content_hash: hash,
            inject_marker,
        },
        ChangeState::Unchanged(_) => Action::Skip {
            identity,
            inject_marker,
        },
        ChangeState::Changed(record) => match record.remote_id {
            Some(remote_id) => Action::Update {
                identity,
                remote_id,
                content_hash: hash,
                revision: revision.clone(),
            },
            None => {
                tracing::info!(
                    "{}: record {identity} has no remote id, creating and re-linking",
                    block.location()
                );
                Action::Create {
                    identity,
                    location: record.collection_location.clone(),
                    content_hash: hash,
                    inject_marker,
                }
            }
        },
    }
}

/// A planned action together with the index of its block in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub index: usize,
    pub action: Action,
}

/// Plan a whole batch, applying the cross-block rules:
///
/// - blocks sharing one marker line in one file are all deferred;
/// - blocks resolving to the same identity defer, except one owner picked by
///   [`duplicate_owner`].
///
/// Output order follows input order.
pub fn plan_batch(
    blocks: &[Block],
    store: &StateStore,
    config: &SyncConfig,
    revision: &Revision,
) -> Vec<PlannedAction> {
    // Shared marker lines.
    let mut marker_owners: HashMap<(&str, usize), usize> = HashMap::new();
    for block in blocks {
        if let (Some(_), Some(line)) = (&block.embedded_short_identity, block.marker_line) {
            *marker_owners
                .entry((block.source_file.as_str(), line))
                .or_default() += 1;
        }
    }

    let mut resolved: Vec<Result<Resolution, DeferReason>> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let shared = match (&block.embedded_short_identity, block.marker_line) {
            (Some(short), Some(line))
                if marker_owners
                    .get(&(block.source_file.as_str(), line))
                    .is_some_and(|n| *n > 1) =>
            {
                Some(DeferReason::SharedMarker {
                    short: short.clone(),
                    marker_line: line,
                })
            }
            _ => None,
        };
        resolved.push(match shared {
            Some(reason) => Err(reason),
            None => Ok(identity::resolve(store, block)),
        });
    }

    // Duplicate identities within the batch: (index, carries a marker).
    let mut claimants: BTreeMap<&Identity, Vec<(usize, bool)>> = BTreeMap::new();
    for (index, resolution) in resolved.iter().enumerate() {
        match resolution {
            Ok(Resolution::Reused(id)) => claimants.entry(id).or_default().push((index, true)),
            Ok(Resolution::Minted(id)) => claimants.entry(id).or_default().push((index, false)),
            _ => {}
        }
    }
    let owners: HashMap<Identity, Option<usize>> = claimants
        .into_iter()
        .filter(|(_, claims)| claims.len() > 1)
        .map(|(id, claims)| (id.clone(), duplicate_owner(&claims)))
        .collect();

    let plan_resolved = |index: usize, block: &Block, id: Identity, inject_marker: bool| {
        if owners.get(&id).is_some_and(|owner| *owner != Some(index)) {
            return Action::Defer {
                reason: DeferReason::DuplicateIdentity { identity: id },
            };
        }
        let change = compare(store, &id, &block.normalized_body);
        plan(block, id, inject_marker, change, config, revision)
    };

    blocks
        .iter()
        .zip(resolved)
        .enumerate()
        .map(|(index, (block, resolution))| {
            let action = match resolution {
                Err(reason) => Action::Defer { reason },
                Ok(Resolution::Collision { short, candidates }) => Action::Defer {
                    reason: DeferReason::IdentityCollision { short, candidates },
                },
                Ok(Resolution::Reused(id)) => plan_resolved(index, block, id, false),
                Ok(Resolution::Minted(id)) => plan_resolved(index, block, id, true),
            };
            if let Action::Defer { reason } = &action {
                tracing::warn!("{}: deferred: {reason:?}", block.location());
            }
            PlannedAction { index, action }
        })
        .collect()
}

/// Which claimant of a duplicated identity may act on it.
///
/// A single marked block owns its identity against unmarked copies of the
/// same body; among unmarked blocks only, the first one wins. Two or more
/// marked blocks mean a copied marker, and none of them may act.
fn duplicate_owner(claims: &[(usize, bool)]) -> Option<usize> {
    let mut marked = claims.iter().filter(|(_, has_marker)| *has_marker);
    match (marked.next(), marked.next()) {
        (Some((index, _)), None) => Some(*index),
        (None, _) => claims.first().map(|(index, _)| *index),
        (Some(_), Some(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::store_path_at;
    use chrono::Utc;
    use tempfile::TempDir;

    fn block(file: &str, start: usize, body: &str) -> Block {
        Block {
            source_file: file.into(),
            start_line: start,
            end_line: start + 2,
            kind: "definition".into(),
            raw_body: body.into(),
            normalized_body: body.into(),
            embedded_short_identity: None,
            marker_line: None,
        }
    }

    fn with_marker(mut b: Block, short: &str, line: usize) -> Block {
        b.embedded_short_identity = Some(ShortIdentity::from(short));
        b.marker_line = Some(line);
        b
    }

    fn track(store: &mut StateStore, id: &Identity, body: &str, remote_id: Option<u64>) {
        store.put(
            id.clone(),
            NoteRecord::created(
                id.clone(),
                remote_id.map(RemoteId),
                CollectionLocation::from("Default"),
                content_hash(body),
                Utc::now(),
            ),
        );
    }

    fn rev() -> Revision {
        Revision::from("rev:20260101")
    }

    #[test]
    fn compare_classifies_new_unchanged_changed() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let id = Identity::from("a".repeat(64));
        assert_eq!(compare(&store, &id, "abc"), ChangeState::New);

        track(&mut store, &id, "abc", Some(1));
        assert!(matches!(compare(&store, &id, "abc  "), ChangeState::Unchanged(_)));
        assert!(matches!(compare(&store, &id, "abcd"), ChangeState::Changed(_)));
    }

    #[test]
    fn changed_record_updates_in_place() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let id = Identity::from("a".repeat(64));
        track(&mut store, &id, "abc", Some(100));

        let b = block("F.tex", 3, "abcd");
        let action = plan(
            &b,
            id.clone(),
            false,
            compare(&store, &id, "abcd"),
            &SyncConfig::default(),
            &rev(),
        );
        match action {
            Action::Update {
                remote_id,
                revision,
                ..
            } => {
                assert_eq!(remote_id, RemoteId(100));
                assert_eq!(revision, rev());
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn changed_record_without_remote_id_is_recreated() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let id = Identity::from("a".repeat(64));
        track(&mut store, &id, "abc", None);

        let b = block("F.tex", 3, "abcd");
        let action = plan(
            &b,
            id.clone(),
            false,
            compare(&store, &id, "abcd"),
            &SyncConfig::default(),
            &rev(),
        );
        assert!(matches!(action, Action::Create { .. }), "got {action:?}");
    }

    #[test]
    fn new_block_routes_to_configured_location() {
        let home = TempDir::new().expect("home");
        let store = StateStore::open(store_path_at(home.path())).expect("open");
        let config = SyncConfig {
            collections: vec![cardsync_core::CollectionRule {
                paths: vec!["analysis/*.tex".into()],
                location: CollectionLocation::from("Math::Analysis"),
            }],
            ..SyncConfig::default()
        };

        let planned = plan_batch(&[block("analysis/ch1.tex", 1, "abc")], &store, &config, &rev());
        match &planned[0].action {
            Action::Create {
                location,
                inject_marker,
                ..
            } => {
                assert_eq!(location.0, "Math::Analysis");
                assert!(inject_marker);
            }
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn shared_marker_line_defers_both_blocks() {
        let home = TempDir::new().expect("home");
        let store = StateStore::open(store_path_at(home.path())).expect("open");
        let blocks = vec![
            with_marker(block("F.tex", 5, "one"), "abcdef123456", 4),
            with_marker(block("F.tex", 6, "two"), "abcdef123456", 4),
            block("F.tex", 20, "three"),
        ];
        let planned = plan_batch(&blocks, &store, &SyncConfig::default(), &rev());
        assert!(matches!(
            planned[0].action,
            Action::Defer {
                reason: DeferReason::SharedMarker { marker_line: 4, .. }
            }
        ));
        assert!(matches!(
            planned[1].action,
            Action::Defer {
                reason: DeferReason::SharedMarker { .. }
            }
        ));
        assert!(matches!(planned[2].action, Action::Create { .. }));
    }

    #[test]
    fn copied_marker_defers_all_claimants() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let id = Identity::from(format!("abcdef123456{}", "0".repeat(52)));
        track(&mut store, &id, "abc", Some(1));

        let blocks = vec![
            with_marker(block("F.tex", 5, "abc"), "abcdef123456", 4),
            with_marker(block("G.tex", 5, "abc"), "abcdef123456", 4),
        ];
        let planned = plan_batch(&blocks, &store, &SyncConfig::default(), &rev());
        for p in &planned {
            assert!(
                matches!(
                    &p.action,
                    Action::Defer {
                        reason: DeferReason::DuplicateIdentity { identity }
                    } if *identity == id
                ),
                "got {:?}",
                p.action
            );
        }
    }

    #[test]
    fn identical_unmarked_blocks_create_once() {
        let home = TempDir::new().expect("home");
        let store = StateStore::open(store_path_at(home.path())).expect("open");
        let blocks = vec![block("F.tex", 1, "abc"), block("F.tex", 10, "abc")];

        let planned = plan_batch(&blocks, &store, &SyncConfig::default(), &rev());
        assert!(matches!(planned[0].action, Action::Create { .. }), "{planned:?}");
        assert!(matches!(
            planned[1].action,
            Action::Defer {
                reason: DeferReason::DuplicateIdentity { .. }
            }
        ));
    }

    #[test]
    fn marked_block_keeps_its_identity_against_an_unmarked_copy() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let id = identity::mint("definition", "abc", "F.tex");
        track(&mut store, &id, "abc", Some(1));

        let short = id.short(12).0;
        let blocks = vec![
            block("F.tex", 1, "abc"),
            with_marker(block("F.tex", 10, "abc"), &short, 9),
        ];
        let planned = plan_batch(&blocks, &store, &SyncConfig::default(), &rev());
        assert!(matches!(
            planned[0].action,
            Action::Defer {
                reason: DeferReason::DuplicateIdentity { .. }
            }
        ));
        assert_eq!(
            planned[1].action,
            Action::Skip {
                identity: id,
                inject_marker: false
            }
        );
    }

    #[test]
    fn collision_defers_with_candidates() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        track(&mut store, &Identity::from(format!("abcdef12{}", "1".repeat(56))), "x", Some(1));
        track(&mut store, &Identity::from(format!("abcdef12{}", "2".repeat(56))), "y", Some(2));

        let blocks = vec![with_marker(block("F.tex", 5, "x"), "abcdef12", 4)];
        let planned = plan_batch(&blocks, &store, &SyncConfig::default(), &rev());
        match &planned[0].action {
            Action::Defer {
                reason: DeferReason::IdentityCollision { candidates, .. },
            } => assert_eq!(candidates.len(), 2),
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn unmarked_block_with_existing_record_skips_and_heals_marker() {
        let home = TempDir::new().expect("home");
        let mut store = StateStore::open(store_path_at(home.path())).expect("open");
        let b = block("F.tex", 5, "abc");
        let id = identity::mint(&b.kind, &b.normalized_body, &b.source_file);
        track(&mut store, &id, "abc", Some(1));

        let planned = plan_batch(&[b], &store, &SyncConfig::default(), &rev());
        assert_eq!(
            planned[0].action,
            Action::Skip {
                identity: id,
                inject_marker: true
            }
        );
    }
}
