//! Identity markers embedded in source files.
//!
//! A marker is a single comment line such as
//!
//! ```text
//! % cardsync-id: 3fa2c9d01b7e
//! \begin{definition}
//! ```
//!
//! found within a bounded window above the block's opening line. Only the
//! short identity is ever written into source.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;

use cardsync_core::{
    config::{MAX_SHORT_IDENTITY_LEN, MIN_SHORT_IDENTITY_LEN},
    Block, ShortIdentity, SyncConfig,
};

use crate::error::{io_err, SyncError};
use crate::writer::atomic_write;

/// Compiled marker syntax for one configuration.
#[derive(Debug, Clone)]
pub struct MarkerSyntax {
    pattern: Regex,
    comment_prefix: String,
    label: String,
    window: usize,
}

impl MarkerSyntax {
    /// Fails when `config` does not validate: a short identity outside the
    /// accepted length range would be written but never read back.
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let pattern = Regex::new(&format!(
            r"(?i){}\s*{}:\s*([0-9a-f]{{{MIN_SHORT_IDENTITY_LEN},{MAX_SHORT_IDENTITY_LEN}}})\b",
            regex::escape(config.comment_prefix.trim()),
            regex::escape(config.marker_label.trim()),
        ))?;
        Ok(Self {
            pattern,
            comment_prefix: config.comment_prefix.trim().to_string(),
            label: config.marker_label.trim().to_string(),
            window: config.context_window,
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Short identity carried by `line`, if it is a marker.
    pub fn parse_line(&self, line: &str) -> Option<ShortIdentity> {
        self.pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| ShortIdentity::from(m.as_str()))
    }

    /// Fresh marker text, without indentation or line ending.
    pub fn render(&self, short: &ShortIdentity) -> String {
        format!("{} {}: {short}", self.comment_prefix, self.label)
    }

    /// `line` with its short identity replaced; surrounding text is kept.
    pub fn rewrite_line(&self, line: &str, short: &ShortIdentity) -> String {
        match self.pattern.captures(line).and_then(|caps| caps.get(1)) {
            Some(m) => format!("{}{short}{}", &line[..m.start()], &line[m.end()..]),
            None => line.to_string(),
        }
    }

    /// Closest marker above `start_line`, never looking at or above `floor`.
    ///
    /// Lines are 1-based. Returns the short identity and its line number.
    pub fn scan_window(
        &self,
        lines: &[&str],
        start_line: usize,
        floor: usize,
    ) -> Option<(ShortIdentity, usize)> {
        let (from, to) = window_bounds(start_line, floor, self.window);
        (from..to).rev().find_map(|line_no| {
            lines
                .get(line_no - 1)
                .and_then(|line| self.parse_line(line))
                .map(|short| (short, line_no))
        })
    }
}

/// Half-open 1-based line range `[from, to)` scanned above a block.
fn window_bounds(start_line: usize, floor: usize, window: usize) -> (usize, usize) {
    let from = start_line.saturating_sub(window).max(floor).max(1);
    (from, start_line.max(from))
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// First line a block's marker may sit on: the line after the previous
/// block's end in the same file, or 1.
pub fn window_floor(blocks: &[Block], block: &Block) -> usize {
    blocks
        .iter()
        .filter(|other| other.source_file == block.source_file && other.end_line < block.start_line)
        .map(|other| other.end_line + 1)
        .max()
        .unwrap_or(1)
}

/// Attach markers found in `source` to the blocks of that file which lack one.
///
/// Blocks from other files and blocks that already carry a short identity
/// are left untouched.
pub fn attach_markers(
    blocks: &mut [Block],
    source_file: &str,
    source: &str,
    syntax: &MarkerSyntax,
) {
    let lines: Vec<&str> = source.lines().collect();
    let floors: Vec<usize> = {
        let all: &[Block] = blocks;
        all.iter().map(|b| window_floor(all, b)).collect()
    };

    for (block, floor) in blocks.iter_mut().zip(floors) {
        if block.source_file != source_file || block.embedded_short_identity.is_some() {
            continue;
        }
        if let Some((short, line_no)) = syntax.scan_window(&lines, block.start_line, floor) {
            tracing::debug!("{}: found marker {short} on line {line_no}", block.location());
            block.embedded_short_identity = Some(short);
            block.marker_line = Some(line_no);
        }
    }
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

/// A marker to write above one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerInjection {
    pub source_file: String,
    pub start_line: usize,
    /// See [`window_floor`].
    pub floor: usize,
    pub short: ShortIdentity,
}

/// Group injections by source file.
pub fn by_file(injections: &[MarkerInjection]) -> BTreeMap<&str, Vec<&MarkerInjection>> {
    let mut grouped: BTreeMap<&str, Vec<&MarkerInjection>> = BTreeMap::new();
    for injection in injections {
        grouped
            .entry(injection.source_file.as_str())
            .or_default()
            .push(injection);
    }
    grouped
}

/// Apply injections to the text of one file, returning the new text.
///
/// Injections are applied from the bottom of the file upwards so the line
/// numbers of those above stay valid. An existing marker in the window is
/// rewritten in place; otherwise a new marker line is inserted directly above
/// the block with the block's indentation.
pub fn apply_injections(
    path: &Path,
    text: &str,
    injections: &[&MarkerInjection],
    syntax: &MarkerSyntax,
) -> Result<String, SyncError> {
    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    let mut ordered: Vec<&MarkerInjection> = injections.to_vec();
    ordered.sort_by(|a, b| b.start_line.cmp(&a.start_line));

    for injection in ordered {
        if injection.start_line == 0 || injection.start_line > lines.len() {
            return Err(SyncError::LineOutOfRange {
                path: path.to_path_buf(),
                line: injection.start_line,
                len: lines.len(),
            });
        }

        let existing = {
            let view: Vec<&str> = lines.iter().map(String::as_str).collect();
            syntax.scan_window(&view, injection.start_line, injection.floor)
        };
        match existing {
            Some((short, _)) if short == injection.short => {}
            Some((_, line_no)) => {
                let rewritten = syntax.rewrite_line(&lines[line_no - 1], &injection.short);
                lines[line_no - 1] = rewritten;
            }
            None => {
                let opening = &lines[injection.start_line - 1];
                let indent: String = opening.chars().take_while(|c| c.is_whitespace()).collect();
                let marker = format!("{indent}{}", syntax.render(&injection.short));
                lines.insert(injection.start_line - 1, marker);
            }
        }
    }

    let mut out = lines.join(newline);
    if text.ends_with('\n') {
        out.push_str(newline);
    }
    Ok(out)
}

/// Write markers into the file at `path` atomically.
///
/// Returns the number of injections applied. Nothing is written when any
/// injection cannot be applied.
pub fn inject_markers(
    path: &Path,
    injections: &[&MarkerInjection],
    syntax: &MarkerSyntax,
) -> Result<usize, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let updated = apply_injections(path, &text, injections, syntax)?;
    if updated != text {
        atomic_write(path, &updated, false)?;
    }
    tracing::info!(
        "injected {} marker(s) into {}",
        injections.len(),
        path.display()
    );
    Ok(injections.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn syntax() -> MarkerSyntax {
        MarkerSyntax::new(&SyncConfig::default()).expect("syntax")
    }

    fn block(start: usize, end: usize) -> Block {
        Block {
            source_file: "ch1.tex".into(),
            start_line: start,
            end_line: end,
            kind: "definition".into(),
            raw_body: String::new(),
            normalized_body: String::new(),
            embedded_short_identity: None,
            marker_line: None,
        }
    }

    fn injection(start_line: usize, floor: usize, short: &str) -> MarkerInjection {
        MarkerInjection {
            source_file: "ch1.tex".into(),
            start_line,
            floor,
            short: ShortIdentity::from(short),
        }
    }

    #[test]
    fn parses_marker_case_insensitively() {
        let s = syntax();
        assert_eq!(
            s.parse_line("%   CardSync-ID:  ABCDEF123456").map(|x| x.0),
            Some("abcdef123456".into())
        );
        assert_eq!(s.parse_line("% cardsync-id: abc"), None, "too short");
        assert_eq!(s.parse_line("cardsync-id: abcdef123456"), None, "no comment prefix");
    }

    #[test]
    fn custom_prefix_and_label() {
        let config = SyncConfig {
            comment_prefix: "//".into(),
            marker_label: "card.id".into(),
            ..SyncConfig::default()
        };
        let s = MarkerSyntax::new(&config).expect("syntax");
        assert!(s.parse_line("// card.id: 0123456789ab").is_some());
        assert!(s.parse_line("// cardXid: 0123456789ab").is_none(), "label is literal");
        assert_eq!(s.render(&ShortIdentity::from("0123456789ab")), "// card.id: 0123456789ab");
    }

    #[test]
    fn rejects_config_whose_markers_cannot_be_read_back() {
        let config = SyncConfig {
            short_identity_len: 6,
            ..SyncConfig::default()
        };
        let err = MarkerSyntax::new(&config).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "got {err:?}");
    }

    #[test]
    fn closest_preceding_marker_wins() {
        let text = concat!(
            "% cardsync-id: 111111111111\n\n",
            "% cardsync-id: 222222222222\n",
            "\\begin{definition}\n",
        );
        let lines: Vec<&str> = text.lines().collect();
        let found = syntax().scan_window(&lines, 4, 1).expect("marker");
        assert_eq!(found, (ShortIdentity::from("222222222222"), 3));
    }

    #[test]
    fn window_is_bounded() {
        let mut text = String::from("% cardsync-id: 111111111111\n");
        text.push_str(&"\n".repeat(25));
        text.push_str("\\begin{definition}\n");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(syntax().scan_window(&lines, 27, 1), None);
    }

    #[test]
    fn floor_stops_stealing_neighbour_marker() {
        let text = "% cardsync-id: 111111111111\n\\begin{a}\n\\end{a}\n\\begin{b}\n";
        let mut blocks = vec![block(2, 3), block(4, 4)];
        attach_markers(&mut blocks, "ch1.tex", text, &syntax());

        assert_eq!(blocks[0].marker_line, Some(1));
        assert_eq!(blocks[1].embedded_short_identity, None);
    }

    #[test]
    fn attach_keeps_extractor_supplied_identity() {
        let text = "% cardsync-id: 111111111111\n\\begin{a}\n";
        let mut blocks = vec![block(2, 2)];
        blocks[0].embedded_short_identity = Some(ShortIdentity::from("999999999999"));
        attach_markers(&mut blocks, "ch1.tex", text, &syntax());
        assert_eq!(blocks[0].embedded_short_identity.as_ref().unwrap().as_str(), "999999999999");
    }

    #[test]
    fn inserts_bottom_up_keeping_line_numbers_valid() {
        let text = "intro\n\\begin{a}\nx\n\\end{a}\n  \\begin{b}\ny\n\\end{b}\n";
        let a = injection(2, 1, "aaaaaaaaaaaa");
        let b = injection(5, 5, "bbbbbbbbbbbb");
        let out = apply_injections(Path::new("ch1.tex"), text, &[&a, &b], &syntax()).unwrap();
        assert_eq!(
            out,
            concat!(
                "intro\n% cardsync-id: aaaaaaaaaaaa\n\\begin{a}\nx\n\\end{a}\n",
                "  % cardsync-id: bbbbbbbbbbbb\n  \\begin{b}\ny\n\\end{b}\n",
            )
        );
    }

    #[test]
    fn rewrites_stale_marker_in_place() {
        let text = "% cardsync-id: deadbeef0000 keep\n\\begin{a}\n";
        let inj = injection(2, 1, "aaaaaaaaaaaa");
        let out = apply_injections(Path::new("ch1.tex"), text, &[&inj], &syntax()).unwrap();
        assert_eq!(out, "% cardsync-id: aaaaaaaaaaaa keep\n\\begin{a}\n");
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let text = "\\begin{a}\r\nx\r\n";
        let inj = injection(1, 1, "aaaaaaaaaaaa");
        let out = apply_injections(Path::new("ch1.tex"), text, &[&inj], &syntax()).unwrap();
        assert_eq!(out, "% cardsync-id: aaaaaaaaaaaa\r\n\\begin{a}\r\nx\r\n");
    }

    #[test]
    fn out_of_range_line_is_rejected() {
        let inj = injection(9, 1, "aaaaaaaaaaaa");
        let err = apply_injections(Path::new("ch1.tex"), "one\n", &[&inj], &syntax()).unwrap_err();
        assert!(matches!(err, SyncError::LineOutOfRange { line: 9, len: 1, .. }));
    }

    #[test]
    fn inject_markers_writes_file() {
        let dir = TempDir::new().expect("dir");
        let path = dir.path().join("ch1.tex");
        std::fs::write(&path, "\\begin{a}\n").expect("write");
        let inj = injection(1, 1, "aaaaaaaaaaaa");

        let applied = inject_markers(&path, &[&inj], &syntax()).expect("inject");
        assert_eq!(applied, 1);
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "% cardsync-id: aaaaaaaaaaaa\n\\begin{a}\n"
        );
    }
}
