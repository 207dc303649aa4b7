//! Relaxed object-literal frames to strict JSON.
//!
//! The backend emits frames in an object-literal syntax: single- or
//! double-quoted strings, `True`/`False`/`None`, and `\x`/`\U` escapes. The
//! rewrite here follows quoting context, so an apostrophe or the word "True"
//! inside a string value passes through untouched.

use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::Value;

use crate::error::FrameError;

/// The fields of a frame the client cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRecord {
    /// `message.content`, when present and a string.
    pub content: Option<String>,
    /// `message.role`, when present and a string.
    pub role: Option<String>,
    /// Top-level `done`; anything but a boolean `true` reads as `false`.
    pub done: bool,
}

impl NormalizedRecord {
    /// Reads the record out of a parsed frame. Missing or mistyped fields
    /// are treated as absent rather than as errors.
    pub fn from_value(value: &Value) -> Self {
        let message = value.get("message");
        let field = |name: &str| {
            message
                .and_then(|m| m.get(name))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };

        Self {
            content: field("content"),
            role: field("role"),
            done: value.get("done").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// Normalizes one frame and parses it.
pub fn normalize(frame: &str) -> Result<NormalizedRecord, FrameError> {
    let json = to_strict_json(frame)?;
    let value: Value = serde_json::from_str(&json)?;
    Ok(NormalizedRecord::from_value(&value))
}

/// Rewrites relaxed syntax into strict JSON text without parsing it.
pub fn to_strict_json(frame: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(frame.len() + 8);
    let mut chars = frame.char_indices().peekable();

    while let Some((at, c)) = chars.next() {
        match c {
            '\'' | '"' => read_string(at, c, &mut chars, &mut out)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn read_string(
    start: usize,
    quote: char,
    chars: &mut Peekable<CharIndices<'_>>,
    out: &mut String,
) -> Result<(), FrameError> {
    out.push('"');

    while let Some((at, c)) = chars.next() {
        if c == quote && closes_string(chars) {
            out.push('"');
            return Ok(());
        }
        if c != '\\' {
            push_escaped(out, c);
            continue;
        }

        let Some((_, escape)) = chars.next() else {
            break;
        };
        match escape {
            '\'' => out.push('\''),
            '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' => {
                out.push('\\');
                out.push(escape);
            }
            'u' => {
                let hex = take_hex(chars, 4, at)?;
                out.push_str("\\u");
                out.push_str(&hex);
            }
            'x' | 'U' => {
                let digits = if escape == 'x' { 2 } else { 8 };
                let hex = take_hex(chars, digits, at)?;
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(FrameError::InvalidEscape(at))?;
                push_escaped(out, decoded);
            }
            // Unknown escapes keep their backslash.
            other => {
                out.push_str("\\\\");
                push_escaped(out, other);
            }
        }
    }

    Err(FrameError::UnterminatedString(start))
}

/// A quote ends its string only when what follows could follow a value;
/// `'it's'` reads as one string.
fn closes_string(rest: &Peekable<CharIndices<'_>>) -> bool {
    let next = rest.clone().map(|(_, c)| c).find(|c| !c.is_whitespace());
    matches!(next, None | Some(',' | ':' | '}' | ']'))
}

fn take_hex(
    chars: &mut Peekable<CharIndices<'_>>,
    count: usize,
    at: usize,
) -> Result<String, FrameError> {
    let mut hex = String::with_capacity(count);
    for _ in 0..count {
        match chars.next() {
            Some((_, c)) if c.is_ascii_hexdigit() => hex.push(c),
            _ => return Err(FrameError::InvalidEscape(at)),
        }
    }
    Ok(hex)
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
        c => out.push(c),
    }
}
