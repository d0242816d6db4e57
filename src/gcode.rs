//! G-code line annotation.
//!
//! Not an interpreter: this only strips comments, tokenizes a line into
//! letter-keyed attributes, pulls out an `N` line number and a leading
//! command word (`g`/`m`/`t`), and normalizes numeric values. The streaming
//! controller uses the returned line number to track dispatch progress.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Letters that start a command word rather than a parameter.
pub const VALID_CMD_LETTERS: [char; 3] = ['m', 'g', 't'];

/// `;`-to-end-of-line comments, parenthesized comments, and whitespace.
#[allow(clippy::unwrap_used)]
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(;.*)|(\(.*?\))|\s+").unwrap());

/// `;(` -style comments removed by [`strip_gcode`].
#[allow(clippy::unwrap_used)]
static TRAILING_PAREN_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(.*?);\(.*$").unwrap());

/// The command word of a G-code line, e.g. `g` + `"1"` for `G1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcodeCommand {
    pub letter: char,
    pub value: String,
}

/// Per-parse scratch state: the line number consumed from an `N` token and
/// the command in effect.
#[derive(Debug, Clone, Default)]
pub struct GcodeContext {
    pub line: Option<i64>,
    pub command: Option<GcodeCommand>,
}

/// A parsed G-code line as published on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedLine {
    pub command: Option<GcodeCommand>,
    pub values: BTreeMap<char, String>,
    pub line: Option<i64>,
    /// The line exactly as it was written to the transport.
    pub raw: String,
}

/// Annotate one raw G-code line.
///
/// An `N` token at the front is consumed into `ctx.line` and removed; a
/// following `g`/`m`/`t` token becomes the command; everything else lands
/// in the attribute map. Returns `None` (no event) when nothing but a line
/// number remains. `ctx.line` is updated either way so callers can track
/// the last dispatched line number.
pub fn annotate(raw: &str, ctx: &mut GcodeContext) -> Option<AnnotatedLine> {
    let stripped = COMMENT_RE.replace_all(raw.trim(), "").to_lowercase();

    let mut tokens = tokenize(&stripped);

    if let Some(first) = tokens.first() {
        if first.starts_with('n') {
            ctx.line = token_value(first).parse().ok();
            tokens.remove(0);
        }
    }

    if tokens.is_empty() {
        return None;
    }

    if let Some(first) = tokens.first() {
        let letter = first.chars().next()?;
        if VALID_CMD_LETTERS.contains(&letter) {
            ctx.command = Some(GcodeCommand {
                letter,
                value: token_value(first),
            });
            tokens.remove(0);
        }
    }

    let mut values = BTreeMap::new();
    for token in &tokens {
        if let Some(letter) = token.chars().next() {
            values.insert(letter, token_value(token));
        }
    }

    Some(AnnotatedLine {
        command: ctx.command.clone(),
        values,
        line: ctx.line,
        raw: raw.to_string(),
    })
}

/// Uppercase a G-code program and drop `;(`-comments and whitespace, for
/// comparing against device echoes.
pub fn strip_gcode(gcode: &str) -> String {
    let stripped = TRAILING_PAREN_COMMENT_RE.replace_all(gcode, "$1");
    stripped
        .chars()
        .filter(|c| *c != ' ' && *c != '\t')
        .collect::<String>()
        .to_uppercase()
}

/// Split a cleaned line at letter boundaries: `"n5g1x10"` becomes
/// `["n5", "g1", "x10"]`. Leading non-letter noise forms its own token.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for ch in line.chars() {
        if ch.is_ascii_alphabetic() || tokens.is_empty() {
            tokens.push(ch.to_string());
        } else if let Some(last) = tokens.last_mut() {
            last.push(ch);
        }
    }
    tokens
}

/// The value of a token past its letter, with redundant leading zeros
/// removed ("010" -> "10") and the digit string otherwise untouched.
fn token_value(token: &str) -> String {
    let value = token.get(1..).unwrap_or_default().trim();
    strip_leading_zeros(value).to_string()
}

fn strip_leading_zeros(value: &str) -> &str {
    let bytes = value.as_bytes();
    let mut start = 0;
    while start + 1 < bytes.len() && bytes[start] == b'0' && bytes[start + 1].is_ascii_digit() {
        start += 1;
    }
    &value[start..]
}
