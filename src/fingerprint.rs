//! Content fingerprints used to detect divergence between replicas of a buffer.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex MD5 digest of a buffer's bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of `content`.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a fingerprint received from a client or read from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like an MD5 hex digest (32 lowercase hex chars).
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 32 && self.0.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self::from_hex(value)
    }
}
