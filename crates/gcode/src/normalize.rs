//! Line normalization.
//!
//! Raw serial text goes through a fixed pipeline before word extraction:
//!
//! 1. Optional `*NN` checksum verification (XOR of every byte ahead of the
//!    `*`). A checksummed line must also carry a line number.
//! 2. Whitespace and control characters are stripped; letters fold to upper
//!    case.
//! 3. Leading zeros on numeric literals are dropped (octal defense).
//! 4. `;` and `%` terminate the line. Parenthesized comments are elided,
//!    except "active comments": `({...})` payloads and `(MSG ...)` messages
//!    are captured and merged into a single trailing JSON object.
//! 5. A leading `/` marks the block for deletion.

use crate::error::ParseError;
use crate::MAX_LINE_LEN;
use serde_json::{Map, Value};

/// Result of normalizing one raw input line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedLine {
    /// Canonical text: upper-case, no whitespace, no comments, no checksum.
    pub text: String,
    /// Leading `/` was present.
    pub block_delete: bool,
    /// A `*NN` checksum was present (and verified).
    pub had_checksum: bool,
    /// Merged active-comment payload: `(MSG ...)` contributes a `msg` key,
    /// `({...})` contributes its object fields.
    pub payload: Option<Value>,
}

impl NormalizedLine {
    /// Message text from a `(MSG ...)` comment, if any.
    pub fn message(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|v| v.get("msg"))
            .and_then(Value::as_str)
    }
}

/// XOR checksum over a byte run, as transmitted by checksumming senders.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Normalizes one raw line. See the module docs for the pipeline.
pub fn normalize(raw: &str) -> Result<NormalizedLine, ParseError> {
    if raw.len() > MAX_LINE_LEN {
        return Err(ParseError::LineOverflow(MAX_LINE_LEN));
    }
    let raw = raw.trim_end_matches(['\r', '\n']);

    // Checksum runs over the raw bytes ahead of '*', before any stripping.
    let (body, had_checksum) = match raw.find('*') {
        Some(star) => {
            let computed = checksum(raw[..star].as_bytes());
            let digits = raw[star + 1..].trim();
            let received: u8 = digits
                .parse()
                .map_err(|_| ParseError::BadNumberFormat(format!("*{digits}")))?;
            if received != computed {
                return Err(ParseError::ChecksumMatchFailed { computed, received });
            }
            (&raw[..star], true)
        }
        None => (raw, false),
    };

    let mut out = String::with_capacity(body.len());
    let mut block_delete = false;
    let mut messages: Vec<String> = Vec::new();
    let mut json_comments: Vec<String> = Vec::new();

    let mut chars = body.chars().peekable();
    let mut seen_content = false;
    while let Some(c) = chars.next() {
        match c {
            ';' | '%' => break,
            '/' if !seen_content => {
                block_delete = true;
                seen_content = true;
            }
            '(' => {
                // Capture comment text verbatim; case matters for messages.
                let mut comment = String::new();
                for cc in chars.by_ref() {
                    if cc == ')' {
                        break;
                    }
                    comment.push(cc);
                }
                let trimmed = comment.trim();
                if trimmed.starts_with('{') {
                    json_comments.push(trimmed.to_string());
                } else if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("msg")) {
                    messages.push(trimmed[3..].trim_start().to_string());
                }
                // Plain comments are elided.
            }
            c if c.is_whitespace() || c.is_control() => {}
            c => {
                seen_content = true;
                out.push(c.to_ascii_uppercase());
            }
        }
    }

    let text = strip_leading_zeros(&out);
    let payload = merge_payload(&messages, &json_comments)?;

    if had_checksum && !text.starts_with('N') {
        return Err(ParseError::MissingLineNumberWithChecksum);
    }

    Ok(NormalizedLine {
        text,
        block_delete,
        had_checksum,
        payload,
    })
}

/// Drops leading zeros from integer runs ("G01" -> "G1", "N007" -> "N7")
/// while leaving decimals intact ("X0.5" stays "X0.5").
fn strip_leading_zeros(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        out.push(b as char);
        let starts_number = b.is_ascii_alphabetic() || b == b'-' || b == b'+';
        if starts_number {
            // Skip zeros as long as another digit follows.
            let mut j = i + 1;
            while j + 1 < bytes.len() && bytes[j] == b'0' && bytes[j + 1].is_ascii_digit() {
                j += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    out
}

/// Folds `(MSG ...)` texts and `({...})` objects into one JSON object.
fn merge_payload(
    messages: &[String],
    json_comments: &[String],
) -> Result<Option<Value>, ParseError> {
    if messages.is_empty() && json_comments.is_empty() {
        return Ok(None);
    }
    let mut map = Map::new();
    for jc in json_comments {
        let value: Value = serde_json::from_str(jc)
            .map_err(|_| ParseError::InvalidOrMalformedCommand(jc.clone()))?;
        match value {
            Value::Object(obj) => map.extend(obj),
            _ => return Err(ParseError::InvalidOrMalformedCommand(jc.clone())),
        }
    }
    if !messages.is_empty() {
        map.insert("msg".to_string(), Value::String(messages.join(" ")));
    }
    Ok(Some(Value::Object(map)))
}
