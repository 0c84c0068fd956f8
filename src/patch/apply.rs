use super::{Hunk, MATCH_DISTANCE};

/// Outcome of applying a patch: the new content and one flag per hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub content: Vec<u8>,
    pub hunks: Vec<bool>,
}

impl Applied {
    /// True when every hunk found its place.
    pub fn is_clean(&self) -> bool {
        self.hunks.iter().all(|ok| *ok)
    }
}

pub(super) fn apply_hunks(hunks: &[Hunk], base: &[u8]) -> Applied {
    let mut text = base.to_vec();
    let mut results = Vec::with_capacity(hunks.len());
    // Drift between where hunks were made and where they land in `text`.
    let mut delta: isize = 0;

    for hunk in hunks {
        let expected = (hunk.start2 as isize + delta).max(0) as usize;
        let source = hunk.source();
        match locate(&text, &source, expected) {
            Some(loc) => {
                let target = hunk.target();
                text.splice(loc..loc + source.len(), target);
                delta = loc as isize - hunk.start2 as isize;
                results.push(true);
            }
            None => {
                delta -= hunk.length2 as isize - hunk.length1 as isize;
                results.push(false);
            }
        }
    }

    Applied {
        content: text,
        hunks: results,
    }
}

/// Exact match at `expected`, else the nearest exact occurrence within
/// `MATCH_DISTANCE`.
fn locate(text: &[u8], pattern: &[u8], expected: usize) -> Option<usize> {
    if pattern.is_empty() {
        return (expected <= text.len()).then_some(expected);
    }
    if text.len() < pattern.len() {
        return None;
    }
    let last = text.len() - pattern.len();
    if expected <= last && &text[expected..expected + pattern.len()] == pattern {
        return Some(expected);
    }

    let lo = expected.saturating_sub(MATCH_DISTANCE).min(last);
    let hi = expected.saturating_add(MATCH_DISTANCE).min(last);
    (lo..=hi)
        .filter(|&at| &text[at..at + pattern.len()] == pattern)
        .min_by_key(|&at| at.abs_diff(expected))
}
