//! Line-oriented patch text.
//!
//! ```text
//! @@ -1,3 +1,4 @@
//!  abc
//! +d
//! ```
//!
//! Coordinates are one-based except for empty ranges, which name the offset
//! they sit at with an explicit length of zero. Line bodies are
//! percent-encoded so arbitrary bytes (newlines included) fit on one line.

use super::{Edit, Hunk, PatchError};

/// Escaped bytes that stay readable when written out.
const READABLE: &[u8] = b" !~*'();/?:@&=+$,#";

pub(super) fn serialize(hunks: &[Hunk]) -> String {
    let mut out = String::new();
    for hunk in hunks {
        out.push_str("@@ -");
        out.push_str(&coords(hunk.start1, hunk.length1));
        out.push_str(" +");
        out.push_str(&coords(hunk.start2, hunk.length2));
        out.push_str(" @@\n");
        for edit in &hunk.edits {
            let prefix = match edit {
                Edit::Equal(_) => ' ',
                Edit::Delete(_) => '-',
                Edit::Insert(_) => '+',
            };
            out.push(prefix);
            out.push_str(&encode(edit.bytes()));
            out.push('\n');
        }
    }
    out
}

fn coords(start: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}

fn encode(bytes: &[u8]) -> String {
    let escaped = urlencoding::encode_binary(bytes);
    let mut out = String::with_capacity(escaped.len());
    let raw = escaped.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let Some(b) = hex_pair(raw[i + 1], raw[i + 2]) {
                if READABLE.contains(&b) {
                    out.push(b as char);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(raw[i] as char);
        i += 1;
    }
    out
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

pub(super) fn parse(text: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("@@") {
            hunks.push(parse_header(line)?);
            continue;
        }
        let hunk = hunks
            .last_mut()
            .ok_or_else(|| PatchError::OrphanLine(line.to_string()))?;
        let mut chars = line.chars();
        let prefix = chars.next().unwrap_or(' ');
        let body = decode(chars.as_str())?;
        let edit = match prefix {
            ' ' => Edit::Equal(body),
            '-' => Edit::Delete(body),
            '+' => Edit::Insert(body),
            other => return Err(PatchError::BadPrefix(other)),
        };
        if !edit.bytes().is_empty() {
            hunk.edits.push(edit);
        }
    }
    for hunk in &mut hunks {
        hunk.recompute_lengths();
    }
    Ok(hunks)
}

fn parse_header(line: &str) -> Result<Hunk, PatchError> {
    let bad = || PatchError::BadHeader(line.to_string());
    let body = line
        .strip_prefix("@@ -")
        .and_then(|s| s.strip_suffix(" @@"))
        .ok_or_else(bad)?;
    let (old, new) = body.split_once(" +").ok_or_else(bad)?;
    let (start1, length1) = parse_coords(old).ok_or_else(bad)?;
    let (start2, length2) = parse_coords(new).ok_or_else(bad)?;
    Ok(Hunk {
        start1,
        start2,
        length1,
        length2,
        edits: Vec::new(),
    })
}

fn parse_coords(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, len)) => {
            let start: usize = start.parse().ok()?;
            let len: usize = len.parse().ok()?;
            if len == 0 {
                Some((start, 0))
            } else {
                Some((start.checked_sub(1)?, len))
            }
        }
        None => {
            let start: usize = s.parse().ok()?;
            Some((start.checked_sub(1)?, 1))
        }
    }
}

fn decode(body: &str) -> Result<Vec<u8>, PatchError> {
    let raw = body.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let valid = i + 2 < raw.len() && hex_pair(raw[i + 1], raw[i + 2]).is_some();
            if !valid {
                return Err(PatchError::BadEscape(body.to_string()));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(urlencoding::decode_binary(raw).into_owned())
}
