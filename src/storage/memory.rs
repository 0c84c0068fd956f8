use super::{BufferRecord, StorageError, StoreOpener, WorkspaceStore};
use crate::buffer::BufferId;
use crate::WorkspaceId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<BufferId, BufferRecord>,
    content: HashMap<BufferId, Vec<u8>>,
    meta: HashMap<String, String>,
}

/// In-memory workspace store. Used by tests and ephemeral rooms.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes disabled".into()));
        }
        Ok(())
    }

    /// Record for a buffer, tombstoned or not.
    pub async fn record(&self, id: BufferId) -> Option<BufferRecord> {
        self.inner.read().await.records.get(&id).cloned()
    }

    pub async fn has_content(&self, id: BufferId) -> bool {
        self.inner.read().await.content.contains_key(&id)
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn load(&self, id: BufferId) -> Result<Vec<u8>, StorageError> {
        self.inner
            .read()
            .await
            .content
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("content of buffer {}", id)))
    }

    async fn save(&self, record: &BufferRecord, content: Option<&[u8]>) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        inner.records.insert(record.id, record.clone());
        match content {
            Some(bytes) if bytes.is_empty() => {
                inner.content.remove(&record.id);
            }
            Some(bytes) => {
                inner.content.insert(record.id, bytes.to_vec());
            }
            None => {}
        }
        Ok(())
    }

    async fn delete(&self, id: BufferId) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(&id) {
            record.deleted = true;
        }
        inner.content.remove(&id);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<BufferRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .values()
            .filter(|r| !r.deleted)
            .cloned()
            .collect())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.read().await.meta.get(key).cloned())
    }

    async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.inner
            .write()
            .await
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Opens [`MemoryStore`]s, handing back the same store for a workspace on reopen.
#[derive(Debug, Default)]
pub struct MemoryStoreOpener {
    stores: Mutex<HashMap<WorkspaceId, Arc<MemoryStore>>>,
}

impl MemoryStoreOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to a workspace's store, bypassing any pool.
    pub fn store(&self, workspace: WorkspaceId) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.entry(workspace).or_default().clone()
    }
}

impl StoreOpener for MemoryStoreOpener {
    fn open(&self, workspace: WorkspaceId) -> Result<Arc<dyn WorkspaceStore>, StorageError> {
        let store: Arc<dyn WorkspaceStore> = self.store(workspace);
        Ok(store)
    }
}
