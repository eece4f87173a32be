//! Reconciliation between the State Store and the remote collection.
//!
//! Records are paired by remote id: a State Store record is present remotely
//! iff its `remote_id` appears in the scoped query result.
//!
//! Policy per [`ReconcileMode`]:
//! 1. `RemoteIsTruth`: drop unpaired store records, adopt remote-only notes
//! 2. `StateIsTruth`: store untouched, remote-only notes become deletion candidates
//! 3. `ReportOnly`: diff only
//!
//! No mode ever deletes a remote note.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

use cardsync_core::{CollectionLocation, Identity, NoteRecord, RemoteId, RemoteRecord};

use crate::error::SyncError;
use crate::normalize::content_hash;
use crate::planner::Action;
use crate::remote::RemoteCollection;
use crate::state_store::{adoptable_identity, StateStore};

/// Operator-chosen divergence policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileMode {
    RemoteIsTruth,
    StateIsTruth,
    ReportOnly,
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileMode::RemoteIsTruth => "remote-is-truth",
            ReconcileMode::StateIsTruth => "state-is-truth",
            ReconcileMode::ReportOnly => "report-only",
        })
    }
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-is-truth" => Ok(ReconcileMode::RemoteIsTruth),
            "state-is-truth" => Ok(ReconcileMode::StateIsTruth),
            "report-only" => Ok(ReconcileMode::ReportOnly),
            other => Err(format!(
                "unknown reconcile mode '{other}' (expected remote-is-truth, state-is-truth or report-only)"
            )),
        }
    }
}

/// One side of the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub identity: Identity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    pub collection_location: CollectionLocation,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    pub in_state_not_remote: Vec<DiffEntry>,
    pub in_remote_not_state: Vec<DiffEntry>,
    /// Selection query over every remote-only note, for manual review.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_query: Option<String>,
    /// Store records removed (remote-is-truth only).
    pub dropped: Vec<Identity>,
    /// Store records added for remote-only notes (remote-is-truth only).
    pub adopted: Vec<Identity>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.in_state_not_remote.is_empty() && self.in_remote_not_state.is_empty()
    }

    /// Remote-only notes as deletion recommendations.
    ///
    /// Empty under remote-is-truth, where those notes were adopted instead.
    pub fn deletion_candidates(&self) -> Vec<Action> {
        if self.mode == ReconcileMode::RemoteIsTruth {
            return vec![];
        }
        self.in_remote_not_state
            .iter()
            .map(|entry| Action::DeleteCandidate {
                identity: entry.identity.clone(),
                remote_id: entry.remote_id,
                location: entry.collection_location.clone(),
            })
            .collect()
    }
}

/// `nid:1,2,3` over `ids`, or `None` when there are none.
pub fn selection_query(ids: impl IntoIterator<Item = RemoteId>) -> Option<String> {
    let ids: BTreeSet<RemoteId> = ids.into_iter().collect();
    if ids.is_empty() {
        return None;
    }
    let joined = ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("nid:{joined}"))
}

/// Pure diff of the store against a remote snapshot:
/// `(in_state_not_remote, in_remote_not_state)`.
pub fn diff(store: &StateStore, remote: &[RemoteRecord]) -> (Vec<DiffEntry>, Vec<DiffEntry>) {
    let remote_ids: BTreeSet<RemoteId> = remote.iter().map(|r| r.remote_id).collect();
    let tracked_ids: BTreeSet<RemoteId> =
        store.all_records().filter_map(|(_, r)| r.remote_id).collect();

    let state_only = store
        .all_records()
        .filter(|(_, r)| !r.remote_id.is_some_and(|id| remote_ids.contains(&id)))
        .map(|(identity, r)| DiffEntry {
            identity: identity.clone(),
            remote_id: r.remote_id,
            collection_location: r.collection_location.clone(),
        })
        .collect();

    let mut remote_only: Vec<DiffEntry> = remote
        .iter()
        .filter(|r| !tracked_ids.contains(&r.remote_id))
        .map(|r| DiffEntry {
            identity: r
                .identity
                .clone()
                .map(Identity::from)
                .unwrap_or_else(|| Identity::synthetic(r.remote_id)),
            remote_id: Some(r.remote_id),
            collection_location: r.collection_location.clone(),
        })
        .collect();
    remote_only.sort_by_key(|e| e.remote_id);

    (state_only, remote_only)
}

/// Report-only reconciliation. Needs only shared access to the store.
pub fn report(
    store: &StateStore,
    remote: &dyn RemoteCollection,
    scope: &str,
) -> Result<ReconcileReport, SyncError> {
    let snapshot = remote.query(scope)?;
    Ok(build_report(store, &snapshot, ReconcileMode::ReportOnly))
}

/// Reconcile under `mode`. `ReportOnly` behaves exactly like [`report`].
pub fn reconcile(
    store: &mut StateStore,
    remote: &dyn RemoteCollection,
    scope: &str,
    mode: ReconcileMode,
) -> Result<ReconcileReport, SyncError> {
    let snapshot = remote.query(scope)?;
    let mut report = build_report(store, &snapshot, mode);
    tracing::info!(
        "reconcile ({mode}): {} state-only, {} remote-only",
        report.in_state_not_remote.len(),
        report.in_remote_not_state.len()
    );

    if mode != ReconcileMode::RemoteIsTruth {
        return Ok(report);
    }

    for entry in &report.in_state_not_remote {
        if store.remove(&entry.identity).is_some() {
            tracing::info!("dropped {} (no remote counterpart)", entry.identity);
            report.dropped.push(entry.identity.clone());
        }
    }

    let now = Utc::now();
    for entry in &report.in_remote_not_state {
        let Some(record) = snapshot.iter().find(|r| Some(r.remote_id) == entry.remote_id) else {
            continue;
        };
        let identity = adoptable_identity(record, |id| store.contains(id));
        let note = NoteRecord::created(
            identity.clone(),
            Some(record.remote_id),
            record.collection_location.clone(),
            content_hash(record.front.as_deref().unwrap_or_default()),
            now,
        );
        tracing::info!("adopted remote note {} as {identity}", record.remote_id);
        store.put(identity.clone(), note);
        report.adopted.push(identity);
    }

    Ok(report)
}

/// Rebuild a lost or corrupt store at `path` from the remote collection.
pub fn rebuild(
    path: impl Into<PathBuf>,
    remote: &dyn RemoteCollection,
    scope: &str,
) -> Result<StateStore, SyncError> {
    let snapshot = remote.query(scope)?;
    StateStore::rebuild_from_remote(path, &snapshot)
}

fn build_report(
    store: &StateStore,
    snapshot: &[RemoteRecord],
    mode: ReconcileMode,
) -> ReconcileReport {
    let (in_state_not_remote, in_remote_not_state) = diff(store, snapshot);
    let deletion_query = selection_query(in_remote_not_state.iter().filter_map(|e| e.remote_id));
    ReconcileReport {
        mode,
        in_state_not_remote,
        in_remote_not_state,
        deletion_query,
        dropped: vec![],
        adopted: vec![],
    }
}
