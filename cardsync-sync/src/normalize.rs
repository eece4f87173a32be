//! Canonical block normalization and content hashing.
//!
//! Two bodies that differ only in whitespace layout outside math must hash
//! the same; anything inside a math span is significant and kept verbatim.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use cardsync_core::ContentHash;

// Placeholder delimiters come from the Private Use Area and never occur in
// real source text.
const HOLD_OPEN: char = '\u{E000}';
const HOLD_CLOSE: char = '\u{E001}';

fn math_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Alternation order matters: `$$` must be tried before `$`.
    RE.get_or_init(|| {
        Regex::new(r"(?s)\\\[.*?\\\]|\$\$.*?\$\$|\$[^$]+?\$").expect("valid math span regex")
    })
}

/// Canonical form of a block body.
///
/// 1. CRLF / CR become LF.
/// 2. Math spans (`\[..\]`, `$$..$$`, `$..$`) are kept byte-for-byte.
/// 3. Elsewhere each line is trimmed and runs of whitespace collapse to one space.
/// 4. Runs of blank lines collapse to a single paragraph break.
/// 5. Leading and trailing blank lines are dropped.
///
/// `canonical(canonical(x)) == canonical(x)`.
pub fn canonical(body: &str) -> String {
    let body = body.replace("\r\n", "\n").replace('\r', "\n");

    let mut held: Vec<String> = Vec::new();
    let protected = math_span().replace_all(&body, |caps: &regex::Captures<'_>| {
        let idx = held.len();
        if let Some(m) = caps.get(0) {
            held.push(m.as_str().to_owned());
        }
        format!("{HOLD_OPEN}{idx}{HOLD_CLOSE}")
    });

    let mut lines: Vec<String> = Vec::new();
    let mut in_blank_run = false;
    for line in protected.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !lines.is_empty() && !in_blank_run {
                lines.push(String::new());
                in_blank_run = true;
            }
            continue;
        }
        in_blank_run = false;
        lines.push(collapsed);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let mut out = lines.join("\n");
    // Restore in reverse so `{1}` never clobbers part of `{10}`.
    for (idx, span) in held.iter().enumerate().rev() {
        out = out.replace(&format!("{HOLD_OPEN}{idx}{HOLD_CLOSE}"), span);
    }
    out
}

/// SHA-256 hex digest of arbitrary text.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content hash of a block body. Excludes the source path.
pub fn content_hash(normalized_body: &str) -> ContentHash {
    ContentHash(sha256_hex(&canonical(normalized_body)))
}
