//! The buffer synchronization engine.
//!
//! A [`SyncBuffer`] owns one file's authoritative content. Editors send
//! patches tagged with the fingerprint they started from and the one they
//! ended at; the buffer reconciles stale patches against its
//! [`BufferHistory`], relays what it applied to everyone else, and asks
//! agents that fell out of sync to replace their copy.

mod engine;
mod history;
mod indent;

pub use engine::{PatchOutcome, SetOutcome, SyncBuffer};
pub use history::{BufferHistory, HistoryEntry, Replay};
pub use indent::Indentation;

use crate::fingerprint::Fingerprint;
use crate::patch::PatchError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Buffer ID, unique within a workspace.
pub type BufferId = u64;

/// Error from buffer operations. Reconciliation errors are recovered by
/// resyncing the sender; they are returned for logging and tests.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("malformed patch: {0}")]
    MalformedPatch(#[from] PatchError),
    #[error("patch did not apply cleanly")]
    ApplyFailed,
    #[error("fingerprint mismatch: client expected {expected}, server has {actual}")]
    Desync {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    #[error("no history entry for fingerprint {0}")]
    HistoryMiss(Fingerprint),
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StorageError),
    #[error("buffer {0} has been deleted")]
    Deleted(BufferId),
    #[error("buffer is too big: {len} bytes, max {max}")]
    TooLarge { len: usize, max: usize },
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
}

/// How a buffer's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    #[serde(alias = "base64")]
    Binary,
}

impl Encoding {
    /// Integer code used in persisted records.
    pub fn code(self) -> u8 {
        match self {
            Encoding::Utf8 => 0,
            Encoding::Binary => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Encoding::Utf8),
            1 => Some(Encoding::Binary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Binary => "binary",
        }
    }

    /// Canonical form of content: utf8 text has Windows newlines replaced.
    pub fn normalize(self, content: Vec<u8>) -> Vec<u8> {
        match self {
            Encoding::Utf8 if content.windows(2).any(|w| w == b"\r\n") => {
                let mut out = Vec::with_capacity(content.len());
                let mut iter = content.iter().peekable();
                while let Some(&b) = iter.next() {
                    if b == b'\r' && iter.peek() == Some(&&b'\n') {
                        continue;
                    }
                    out.push(b);
                }
                out
            }
            _ => content,
        }
    }

    /// Canonical form of patch text for this encoding.
    pub fn normalize_patch(self, patch: &str) -> String {
        match self {
            Encoding::Utf8 => patch.replace("%0D%0A", "%0A"),
            Encoding::Binary => patch.to_string(),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utf8" => Ok(Encoding::Utf8),
            "binary" | "base64" => Ok(Encoding::Binary),
            other => Err(SyncError::UnsupportedEncoding(other.to_string())),
        }
    }
}
