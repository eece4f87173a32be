//! Dry-run unified diffs of marker injection.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use similar::TextDiff;

use cardsync_core::{Block, Revision, SyncConfig};

use crate::{
    error::io_err,
    marker::{self, MarkerInjection, MarkerSyntax},
    planner::{plan_batch, Action},
    state_store::StateStore,
    SyncError,
};

/// A single file diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub unified_diff: String,
}

/// Render what injecting `injections` would change. No files are written.
pub fn preview_injections(
    source_root: &Path,
    injections: &[MarkerInjection],
    config: &SyncConfig,
) -> Result<Vec<FileDiff>, SyncError> {
    let syntax = MarkerSyntax::new(config)?;

    let mut diffs = Vec::new();
    for (file, group) in marker::by_file(injections) {
        let path = source_root.join(file);
        let existing = read_existing_or_empty(&path)?;
        let updated = marker::apply_injections(&path, &existing, &group, &syntax)?;
        if existing == updated {
            continue;
        }

        let old_header = format!("a/{file}");
        let new_header = format!("b/{file}");
        let unified = TextDiff::from_lines(&existing, &updated)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();

        diffs.push(FileDiff {
            path,
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

/// Markers a run over `blocks` would write, assuming every CREATE succeeds.
pub fn planned_injections(
    store: &StateStore,
    blocks: &[Block],
    config: &SyncConfig,
) -> Vec<MarkerInjection> {
    plan_batch(blocks, store, config, &Revision::today())
        .into_iter()
        .filter_map(|item| match item.action {
            Action::Create {
                identity,
                inject_marker: true,
                ..
            }
            | Action::Skip {
                identity,
                inject_marker: true,
            } => {
                let block = &blocks[item.index];
                Some(MarkerInjection {
                    source_file: block.source_file.clone(),
                    start_line: block.start_line,
                    floor: marker::window_floor(blocks, block),
                    short: identity.short(config.short_identity_len),
                })
            }
            _ => None,
        })
        .collect()
}

fn read_existing_or_empty(path: &Path) -> Result<String, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(io_err(path, err)),
    }
}
