//! Post-processing: deterministic cleanup of model replies.
//!
//! Even when told to "respond with JSON only", vision models regularly wrap
//! the object in ` ```json ... ``` ` fences or prefix it with a BOM. These
//! rules undo that without touching the content. Nothing here repairs broken
//! JSON: a reply that still does not parse after cleanup is a
//! [`InvoiceError::ResponseParse`], carrying the raw text for diagnosis.
//!
//! ## Rule Order
//!
//! Invisible characters go first so a BOM in front of the opening fence does
//! not defeat the fence match. For JSON they are removed only outside string
//! literals: a zero-width joiner inside a seller name is content.

use crate::error::InvoiceError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// A model reply, either still text or already structured.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Parsed(Value),
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Reply::Text(s.to_string())
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Reply::Text(s)
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Parsed(v)
    }
}

/// Turn a reply into a JSON value.
///
/// `Parsed` passes through unchanged, so coercing an already-coerced value is
/// a no-op.
pub fn coerce(reply: Reply) -> Result<Value, InvoiceError> {
    match reply {
        Reply::Parsed(v) => Ok(v),
        Reply::Text(raw) => {
            let cleaned = strip_json_fences(&remove_invisible_outside_strings(&raw));
            serde_json::from_str(cleaned.trim()).map_err(|e| InvoiceError::ResponseParse {
                detail: e.to_string(),
                raw,
            })
        }
    }
}

/// Cleanup for free-text transcription replies.
///
/// Strips an outer fence of any language tag, normalises line endings and
/// trailing whitespace, and ends with exactly one newline. Interior spacing
/// and line breaks are preserved.
pub fn clean_transcript(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = normalise_line_endings(&s);
    let s = strip_any_fences(&s);
    let s = trim_trailing_whitespace(&s);
    ensure_final_newline(&s)
}

// ── Invisible Unicode ────────────────────────────────────────────────────────

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn remove_invisible_chars(input: &str) -> String {
    input.replace(INVISIBLE, "")
}

/// Like [`remove_invisible_chars`] but leaves JSON string literals alone.
fn remove_invisible_outside_strings(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in input.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        } else if INVISIBLE.contains(&c) {
            continue;
        }
        out.push(c);
    }
    out
}

// ── Code fences ──────────────────────────────────────────────────────────────

static RE_JSON_FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^```(?:json)?[ \t]*\n?").unwrap());

static RE_FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n?```\s*$").unwrap());

fn strip_json_fences(input: &str) -> String {
    let trimmed = input.trim();
    let opened = RE_JSON_FENCE_OPEN.replace(trimmed, "");
    RE_FENCE_CLOSE.replace(&opened, "").into_owned()
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\n(.*)\n```\s*$").unwrap());

fn strip_any_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Whitespace ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
