//! Text patches: diffing two states, the line-oriented patch text format
//! exchanged with editors, and tolerant application of hunks.
//!
//! A patch is a list of [`Hunk`]s. Each hunk carries a few bytes of context
//! around its change so it can still be located when the target has drifted
//! from the state the patch was made against.

mod apply;
mod diff;
mod text;

pub use apply::Applied;

/// Bytes of context kept on either side of a change.
pub const CONTEXT_MARGIN: usize = 4;

/// How far from its expected offset a hunk may be found.
pub const MATCH_DISTANCE: usize = 1000;

/// Error parsing patch text.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("malformed patch header: {0}")]
    BadHeader(String),
    #[error("patch line outside of a hunk: {0}")]
    OrphanLine(String),
    #[error("unknown patch line prefix {0:?}")]
    BadPrefix(char),
    #[error("invalid escape in patch line: {0}")]
    BadEscape(String),
}

/// A single edit operation inside a hunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Edit {
    Equal(Vec<u8>),
    Delete(Vec<u8>),
    Insert(Vec<u8>),
}

impl Edit {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Edit::Equal(b) | Edit::Delete(b) | Edit::Insert(b) => b,
        }
    }
}

/// A contiguous group of edits plus surrounding context.
///
/// `start1` is the offset in the original text, `start2` the offset in the
/// text produced by applying every earlier hunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hunk {
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
    pub edits: Vec<Edit>,
}

impl Hunk {
    /// Text this hunk expects to find (context and deletions).
    pub fn source(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length1);
        for edit in &self.edits {
            if let Edit::Equal(b) | Edit::Delete(b) = edit {
                out.extend_from_slice(b);
            }
        }
        out
    }

    /// Text this hunk leaves behind (context and insertions).
    pub fn target(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length2);
        for edit in &self.edits {
            if let Edit::Equal(b) | Edit::Insert(b) = edit {
                out.extend_from_slice(b);
            }
        }
        out
    }

    fn recompute_lengths(&mut self) {
        self.length1 = 0;
        self.length2 = 0;
        for edit in &self.edits {
            match edit {
                Edit::Equal(b) => {
                    self.length1 += b.len();
                    self.length2 += b.len();
                }
                Edit::Delete(b) => self.length1 += b.len(),
                Edit::Insert(b) => self.length2 += b.len(),
            }
        }
    }
}

/// An ordered list of hunks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

impl Patch {
    /// Minimal edit script turning `old` into `new`. Deterministic for identical inputs.
    pub fn diff(old: &[u8], new: &[u8]) -> Self {
        Self {
            hunks: diff::make_hunks(old, new),
        }
    }

    /// Parse the textual representation produced by [`Patch::to_text`].
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        text::parse(text).map(|hunks| Self { hunks })
    }

    pub fn to_text(&self) -> String {
        text::serialize(&self.hunks)
    }

    /// Apply every hunk to `base`, reporting per-hunk success.
    pub fn apply(&self, base: &[u8]) -> Applied {
        apply::apply_hunks(&self.hunks, base)
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Bytes inserted by this patch, across all hunks.
    pub fn inserted(&self) -> impl Iterator<Item = &[u8]> {
        self.hunks.iter().flat_map(|h| {
            h.edits.iter().filter_map(|e| match e {
                Edit::Insert(b) => Some(b.as_slice()),
                _ => None,
            })
        })
    }
}

impl std::fmt::Display for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl std::str::FromStr for Patch {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
