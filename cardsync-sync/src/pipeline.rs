//! Sync pipeline: plan a batch, execute it against the remote collection,
//! record results and inject markers.
//!
//! Order of effects for one run:
//! 1. Plan every block (pure).
//! 2. Execute CREATE / UPDATE serially; a failed call is recorded for its
//!    block and the batch continues.
//! 3. Inject markers for successful CREATEs, per file, bottom-up.
//! 4. Advance the process marker when no remote call failed.
//! 5. Flush the State Store.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use cardsync_core::{Block, Identity, NoteRecord, RemoteId, Revision, SyncConfig};

use crate::error::SyncError;
use crate::marker::{self, MarkerInjection, MarkerSyntax};
use crate::planner::{plan_batch, Action, DeferReason};
use crate::remote::RemoteCollection;
use crate::state_store::StateStore;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Per-run knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Directory that `Block::source_file` paths are relative to.
    pub source_root: PathBuf,
    /// Revision tag attached to UPDATEs.
    pub revision: Revision,
    /// Source revision to record as processed when the run succeeds.
    pub process_marker: Option<String>,
    /// Plan only: no remote calls, no store or source writes.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            revision: Revision::today(),
            process_marker: None,
            dry_run: false,
        }
    }
}

/// What happened to one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created { remote_id: RemoteId },
    Updated { remote_id: RemoteId },
    Skipped,
    Deferred { reason: DeferReason },
    /// The remote call failed; nothing was recorded for this block.
    Failed { message: String },
    /// `dry_run`: would have been created.
    WouldCreate,
    /// `dry_run`: would have been updated.
    WouldUpdate { remote_id: RemoteId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockOutcome {
    /// `file:line`.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Non-fatal problems noticed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum Warning {
    /// The remote record exists but its marker could not be written.
    InjectionFailure {
        location: String,
        identity: Identity,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<BlockOutcome>,
    pub warnings: Vec<Warning>,
    pub markers_injected: usize,
    pub process_marker_advanced: bool,
    pub dry_run: bool,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Created { .. } | Outcome::WouldCreate))
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Updated { .. } | Outcome::WouldUpdate { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Deferred { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    /// Outcome for the block at `file:line`.
    pub fn outcome_at(&self, location: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.location == location)
            .map(|o| &o.outcome)
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Process one batch of blocks end to end.
///
/// Store-level failures (I/O, lock, corrupt JSON) abort the run; every
/// per-block condition is reported in the returned [`RunReport`].
pub fn run(
    store: &mut StateStore,
    blocks: &[Block],
    remote: &mut dyn RemoteCollection,
    config: &SyncConfig,
    options: &RunOptions,
) -> Result<RunReport, SyncError> {
    // Remote calls made against a store that cannot record them would be
    // repeated as duplicates on the next run.
    if store.is_read_only() && !options.dry_run {
        return Err(SyncError::StoreReadOnly {
            path: store.path().to_path_buf(),
        });
    }
    let syntax = MarkerSyntax::new(config)?;
    let planned = plan_batch(blocks, store, config, &options.revision);

    let mut report = RunReport {
        dry_run: options.dry_run,
        ..RunReport::default()
    };
    let mut injections: Vec<(MarkerInjection, Identity)> = Vec::new();

    for item in planned {
        let block = &blocks[item.index];
        let identity = item.action.identity().cloned();
        let outcome = match item.action {
            Action::Create {
                identity,
                location,
                content_hash,
                inject_marker,
            } => {
                if store.get(&identity).is_some_and(|r| r.remote_id.is_some()) {
                    tracing::warn!(
                        "{}: {identity} already has a remote record, not creating again",
                        block.location()
                    );
                    Outcome::Skipped
                } else if options.dry_run {
                    tracing::info!("[dry-run] would create: {}", block.location());
                    Outcome::WouldCreate
                } else {
                    match remote.create(block, &identity, &location) {
                        Ok(remote_id) => {
                            let now = Utc::now();
                            let record = match store.get(&identity) {
                                // Re-link an offline record, keeping its history.
                                Some(existing) => NoteRecord {
                                    remote_id: Some(remote_id),
                                    content_hash,
                                    updated_at: now,
                                    ..existing.clone()
                                },
                                None => NoteRecord::created(
                                    identity.clone(),
                                    Some(remote_id),
                                    location,
                                    content_hash,
                                    now,
                                ),
                            };
                            store.put(identity.clone(), record);
                            tracing::info!("created: {} -> {remote_id}", block.location());
                            if inject_marker {
                                let injection = injection_for(blocks, block, &identity, config);
                                injections.push((injection, identity));
                            }
                            Outcome::Created { remote_id }
                        }
                        Err(e) => {
                            tracing::warn!("{}: create failed: {e}", block.location());
                            Outcome::Failed {
                                message: e.to_string(),
                            }
                        }
                    }
                }
            }
            Action::Update {
                identity,
                remote_id,
                content_hash,
                revision,
            } => {
                if options.dry_run {
                    tracing::info!("[dry-run] would update: {} ({remote_id})", block.location());
                    Outcome::WouldUpdate { remote_id }
                } else {
                    match remote.update(remote_id, block, &revision) {
                        Ok(()) => {
                            if let Some(existing) = store.get(&identity) {
                                let record = NoteRecord {
                                    content_hash,
                                    updated_at: Utc::now(),
                                    ..existing.clone()
                                };
                                store.put(identity, record);
                            }
                            tracing::info!("updated: {} ({remote_id})", block.location());
                            Outcome::Updated { remote_id }
                        }
                        Err(e) => {
                            tracing::warn!(
                                "{}: update of {remote_id} failed: {e}",
                                block.location()
                            );
                            Outcome::Failed {
                                message: e.to_string(),
                            }
                        }
                    }
                }
            }
            Action::Skip {
                identity,
                inject_marker,
            } => {
                tracing::debug!("unchanged: {}", block.location());
                if inject_marker && !options.dry_run {
                    injections.push((injection_for(blocks, block, &identity, config), identity));
                }
                Outcome::Skipped
            }
            Action::Defer { reason } => Outcome::Deferred { reason },
            Action::DeleteCandidate { .. } => Outcome::Skipped,
        };
        report.outcomes.push(BlockOutcome {
            location: block.location(),
            identity,
            outcome,
        });
    }

    if options.dry_run {
        return Ok(report);
    }

    inject_all(&injections, &syntax, options, &mut report);

    if report.failed() == 0 {
        if let Some(marker) = &options.process_marker {
            store.set_process_marker(marker.clone());
            report.process_marker_advanced = true;
        }
    } else {
        tracing::warn!(
            "{} remote call(s) failed; process marker left at {:?}",
            report.failed(),
            store.process_marker()
        );
    }

    store.flush()?;
    tracing::info!(
        "run complete: {} created, {} updated, {} skipped, {} deferred, {} failed",
        report.created(),
        report.updated(),
        report.skipped(),
        report.deferred(),
        report.failed()
    );
    Ok(report)
}

fn injection_for(
    blocks: &[Block],
    block: &Block,
    identity: &Identity,
    config: &SyncConfig,
) -> MarkerInjection {
    MarkerInjection {
        source_file: block.source_file.clone(),
        start_line: block.start_line,
        floor: marker::window_floor(blocks, block),
        short: identity.short(config.short_identity_len),
    }
}

fn inject_all(
    injections: &[(MarkerInjection, Identity)],
    syntax: &MarkerSyntax,
    options: &RunOptions,
    report: &mut RunReport,
) {
    let plain: Vec<MarkerInjection> = injections.iter().map(|(inj, _)| inj.clone()).collect();
    for (file, group) in marker::by_file(&plain) {
        let path = options.source_root.join(file);
        match marker::inject_markers(&path, &group, syntax) {
            Ok(n) => report.markers_injected += n,
            Err(e) => {
                tracing::warn!("marker injection into {} failed: {e}", path.display());
                let in_file = injections.iter().filter(|(inj, _)| inj.source_file == file);
                for (inj, identity) in in_file {
                    report.warnings.push(Warning::InjectionFailure {
                        location: format!("{}:{}", inj.source_file, inj.start_line),
                        identity: identity.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
