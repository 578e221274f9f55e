//! Output post-processing
//!
//! Reduces raw interpreter output to the "compact" form served to
//! token-bounded consumers, and enforces the inline token budget by
//! spilling oversized output to a file beside the session log.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Command echo: the interpreter's dot prompt followed by the command.
static ECHO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\. (.*)$").unwrap());

/// Numbered body echo printed while a block command is being entered,
/// e.g. `  2. summarize price`.
static NUMBERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\d+\.\s?(.*)$").unwrap());

/// Orphaned numbered line carrying no content.
static ORPHAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\d+\.\s*$").unwrap());

/// Cosmetic bookkeeping notes.
static COSMETIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(\d[\d,]* (real changes? made(, .*)?|missing values? generated)\)$").unwrap()
});

/// Echoed commands that open a definition block terminated by `end`.
static DEFINE_OPENER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(quietly\s+)?(capture\s+)?(program\s+(define|def)\b|python:?\s*$|mata:?\s*$)")
        .unwrap()
});

/// Echo state while consuming the body of a multi-line construct.
enum Block {
    /// Brace-delimited loop (`foreach`, `forvalues`, `while`); tracks
    /// nesting depth across the numbered body echoes
    Braces(i32),
    /// `program define` / inline `python` / `mata` block, terminated by
    /// a body line reading `end`
    UntilEnd,
}

/// Reduce raw interpreter output to compact form.
///
/// Drops command echoes and their `> ` continuations, loop-body echoes
/// (the values produced inside the loop are kept), program and
/// inline-language definition blocks, cosmetic change notes, and orphaned
/// numbered lines. Line endings are normalized to `\n`. The pass is
/// idempotent: compact output runs through unchanged.
pub fn compact(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut kept: Vec<&str> = Vec::new();
    let mut block: Option<Block> = None;

    for line in normalized.lines() {
        if let Some(state) = &mut block {
            match state {
                Block::Braces(depth) => {
                    if let Some(caps) = NUMBERED.captures(line) {
                        let body = caps.get(1).map_or("", |m| m.as_str());
                        *depth += brace_delta(body);
                        if *depth <= 0 {
                            block = None;
                        }
                        continue;
                    }
                    // Anything unnumbered means the block entry is over.
                    block = None;
                }
                Block::UntilEnd => {
                    let body = NUMBERED
                        .captures(line)
                        .and_then(|c| c.get(1))
                        .map_or(line, |m| m.as_str());
                    if body.trim() == "end" {
                        block = None;
                    }
                    continue;
                }
            }
        }

        if let Some(caps) = ECHO.captures(line) {
            let command = caps.get(1).map_or("", |m| m.as_str());
            let trimmed = command.trim_start();
            if DEFINE_OPENER.is_match(trimmed) {
                block = Some(Block::UntilEnd);
            } else {
                let depth = brace_delta(command);
                if depth > 0 {
                    block = Some(Block::Braces(depth));
                }
            }
            continue;
        }
        if line == "." || line.starts_with("> ") || line == ">" {
            continue;
        }
        if ORPHAN.is_match(line) || COSMETIC.is_match(line) {
            continue;
        }

        kept.push(line);
    }

    collapse_blanks(&kept)
}

/// Net brace nesting contributed by one echoed line.
fn brace_delta(text: &str) -> i32 {
    let mut delta = 0i32;
    for ch in text.chars() {
        match ch {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Collapse runs of blank lines and trim blank edges.
fn collapse_blanks(lines: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = true; // swallow leading blanks
    for line in lines {
        if line.trim().is_empty() {
            if !blank_run {
                out.push("");
            }
            blank_run = true;
        } else {
            out.push(line);
            blank_run = false;
        }
    }
    while matches!(out.last(), Some(l) if l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Approximate token count: one token per 4 bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Enforce the inline token budget.
///
/// Returns the text to send inline and, when the budget was exceeded, the
/// path of the spill file holding the unbounded text. A budget of zero
/// means unlimited.
pub fn apply_token_budget(
    text: String,
    max_tokens: usize,
    spill_dir: &Path,
    run_id: &str,
) -> std::io::Result<(String, Option<PathBuf>)> {
    if max_tokens == 0 || estimate_tokens(&text) <= max_tokens {
        return Ok((text, None));
    }

    std::fs::create_dir_all(spill_dir)?;
    let spill_path = spill_dir.join(format!("output_{run_id}.txt"));
    std::fs::write(&spill_path, &text)?;

    let keep_bytes = max_tokens.saturating_mul(4);
    let mut cut = keep_bytes.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let inline = format!(
        "{}\n[output truncated: ~{} tokens exceeds the {}-token limit; full output written to {}]",
        &text[..cut],
        estimate_tokens(&text),
        max_tokens,
        spill_path.display(),
    );
    Ok((inline, Some(spill_path)))
}
