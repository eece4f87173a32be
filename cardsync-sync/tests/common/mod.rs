//! Shared helpers for cardsync-sync integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use cardsync_core::{Block, Revision, SyncConfig};
use cardsync_sync::{
    marker::{self, MarkerSyntax},
    normalize::canonical,
    state_store::store_path_at,
    MemoryCollection, RunOptions, RunReport, StateStore,
};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Minimal `\begin{kind} .. \end{kind}` extractor, enough to drive the engine.
pub fn extract(root: &Path, file: &str, config: &SyncConfig) -> Vec<Block> {
    let text = fs::read_to_string(root.join(file)).expect("read source");
    let lines: Vec<&str> = text.lines().collect();

    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let kind = lines[i]
            .trim()
            .strip_prefix("\\begin{")
            .and_then(|rest| rest.strip_suffix('}'));
        let Some(kind) = kind else {
            i += 1;
            continue;
        };

        let mut j = i + 1;
        while j < lines.len() && !lines[j].trim().starts_with("\\end{") {
            j += 1;
        }
        let raw = lines[i + 1..j.min(lines.len())].join("\n");
        blocks.push(Block {
            source_file: file.to_string(),
            start_line: i + 1,
            end_line: j + 1,
            kind: kind.to_string(),
            normalized_body: canonical(&raw),
            raw_body: raw,
            embedded_short_identity: None,
            marker_line: None,
        });
        i = j + 1;
    }

    let syntax = MarkerSyntax::new(config).expect("marker syntax");
    marker::attach_markers(&mut blocks, file, &text, &syntax);
    blocks
}

/// A home dir (State Store), a source tree and an in-memory remote.
pub struct Workspace {
    pub home: TempDir,
    pub src: TempDir,
    pub remote: MemoryCollection,
    pub config: SyncConfig,
}

impl Workspace {
    pub fn new() -> Self {
        init_logging();
        Self {
            home: TempDir::new().expect("home"),
            src: TempDir::new().expect("src"),
            remote: MemoryCollection::starting_at(100),
            config: SyncConfig::default(),
        }
    }

    pub fn write(&self, file: &str, content: &str) {
        let path = self.src.path().join(file);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).expect("mkdir");
        }
        fs::write(path, content).expect("write source");
    }

    pub fn read(&self, file: &str) -> String {
        fs::read_to_string(self.src.path().join(file)).expect("read source")
    }

    pub fn store_path(&self) -> std::path::PathBuf {
        store_path_at(self.home.path())
    }

    pub fn open_store(&self) -> StateStore {
        StateStore::open(self.store_path()).expect("open store")
    }

    pub fn options(&self) -> RunOptions {
        RunOptions {
            revision: Revision::from("rev:20260101"),
            ..RunOptions::new(self.src.path())
        }
    }

    /// Extract `files` and run one batch over them.
    pub fn sync(&mut self, files: &[&str]) -> RunReport {
        let blocks: Vec<Block> = files
            .iter()
            .flat_map(|f| extract(self.src.path(), f, &self.config))
            .collect();
        let mut store = self.open_store();
        let options = self.options();
        let report =
            cardsync_sync::run(&mut store, &blocks, &mut self.remote, &self.config, &options)
                .expect("run");
        store.close().expect("close store");
        report
    }
}
