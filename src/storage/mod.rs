//! Workspace persistence: buffer records, buffer content and a small
//! key/value area for room metadata.

mod memory;
mod pool;
mod redb_store;

pub use memory::{MemoryStore, MemoryStoreOpener};
pub use pool::{StoreLease, StoreOpener, StorePool};
pub use redb_store::{RedbStore, RedbStoreOpener};

use crate::buffer::{BufferId, Encoding};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error from a workspace store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Persisted metadata for one buffer. Content is stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub id: BufferId,
    pub path: String,
    #[serde(default)]
    pub deleted: bool,
    pub md5: Fingerprint,
    #[serde(with = "encoding_code")]
    pub encoding: Encoding,
}

/// Encodings are stored as integer codes.
mod encoding_code {
    use crate::buffer::Encoding;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(encoding: &Encoding, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(encoding.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Encoding, D::Error> {
        let code = u8::deserialize(d)?;
        Encoding::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown encoding code {}", code)))
    }
}

/// Persistence for a single workspace.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Raw content of a buffer. `NotFound` when no content was ever stored.
    async fn load(&self, id: BufferId) -> Result<Vec<u8>, StorageError>;

    /// Write a buffer record and, when given, its content. Empty content
    /// removes the content key.
    async fn save(&self, record: &BufferRecord, content: Option<&[u8]>) -> Result<(), StorageError>;

    /// Tombstone a buffer record and drop its content.
    async fn delete(&self, id: BufferId) -> Result<(), StorageError>;

    /// Every buffer record that is not tombstoned.
    async fn records(&self) -> Result<Vec<BufferRecord>, StorageError>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding_is_numeric() {
        let record = BufferRecord {
            id: 3,
            path: "src/main.rs".into(),
            deleted: false,
            md5: Fingerprint::of(b""),
            encoding: Encoding::Binary,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["encoding"], 1);
        assert_eq!(json["md5"], "d41d8cd98f00b204e9800998ecf8427e");

        let back: BufferRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_unknown_encoding_code_rejected() {
        let json = r#"{"id":1,"path":"a","md5":"x","encoding":7}"#;
        assert!(serde_json::from_str::<BufferRecord>(json).is_err());
    }

    #[test]
    fn test_deleted_defaults_false() {
        let json = r#"{"id":1,"path":"a","md5":"x","encoding":0}"#;
        let record: BufferRecord = serde_json::from_str(json).unwrap();
        assert!(!record.deleted);
        assert_eq!(record.encoding, Encoding::Utf8);
    }
}
