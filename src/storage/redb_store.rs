use super::{BufferRecord, StorageError, StoreOpener, WorkspaceStore};
use crate::buffer::BufferId;
use crate::WorkspaceId;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RECORDS: TableDefinition<u64, &str> = TableDefinition::new("buffers");
const CONTENT: TableDefinition<u64, &[u8]> = TableDefinition::new("buffer_content");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Workspace store backed by a single redb file.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl RedbStore {
    /// Open or create the database file, making sure every table exists.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let db = Database::create(path).map_err(backend)?;
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(RECORDS).map_err(backend)?;
            txn.open_table(CONTENT).map_err(backend)?;
            txn.open_table(META).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking database closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(backend)?
    }
}

#[async_trait]
impl WorkspaceStore for RedbStore {
    async fn load(&self, id: BufferId) -> Result<Vec<u8>, StorageError> {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(CONTENT).map_err(backend)?;
            let value = table.get(id).map_err(backend)?;
            value
                .map(|v| v.value().to_vec())
                .ok_or_else(|| StorageError::NotFound(format!("content of buffer {}", id)))
        })
        .await
    }

    async fn save(&self, record: &BufferRecord, content: Option<&[u8]>) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)?;
        let id = record.id;
        let content = content.map(|c| c.to_vec());
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut records = txn.open_table(RECORDS).map_err(backend)?;
                records.insert(id, json.as_str()).map_err(backend)?;
                let mut table = txn.open_table(CONTENT).map_err(backend)?;
                match content {
                    Some(bytes) if bytes.is_empty() => {
                        table.remove(id).map_err(backend)?;
                    }
                    Some(bytes) => {
                        table.insert(id, bytes.as_slice()).map_err(backend)?;
                    }
                    None => {}
                }
            }
            txn.commit().map_err(backend)
        })
        .await
    }

    async fn delete(&self, id: BufferId) -> Result<(), StorageError> {
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut records = txn.open_table(RECORDS).map_err(backend)?;
                let existing = records
                    .get(id)
                    .map_err(backend)?
                    .map(|v| v.value().to_string());
                if let Some(json) = existing {
                    let mut record: BufferRecord = serde_json::from_str(&json)?;
                    record.deleted = true;
                    let json = serde_json::to_string(&record)?;
                    records.insert(id, json.as_str()).map_err(backend)?;
                }
                let mut content = txn.open_table(CONTENT).map_err(backend)?;
                content.remove(id).map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
    }

    async fn records(&self) -> Result<Vec<BufferRecord>, StorageError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(RECORDS).map_err(backend)?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(backend)? {
                let (_, value) = entry.map_err(backend)?;
                let record: BufferRecord = serde_json::from_str(value.value())?;
                if !record.deleted {
                    out.push(record);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(META).map_err(backend)?;
            let value = table.get(key.as_str()).map_err(backend)?;
            Ok(value.map(|v| v.value().to_string()))
        })
        .await
    }

    async fn put_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut table = txn.open_table(META).map_err(backend)?;
                table.insert(key.as_str(), value.as_str()).map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
    }
}

/// Opens one redb file per workspace under a data directory.
#[derive(Debug, Clone)]
pub struct RedbStoreOpener {
    data_dir: PathBuf,
}

impl RedbStoreOpener {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, workspace: WorkspaceId) -> PathBuf {
        self.data_dir.join(workspace.to_string()).join("workspace.redb")
    }
}

impl StoreOpener for RedbStoreOpener {
    fn open(&self, workspace: WorkspaceId) -> Result<Arc<dyn WorkspaceStore>, StorageError> {
        let store: Arc<dyn WorkspaceStore> = Arc::new(RedbStore::open(&self.path_for(workspace))?);
        Ok(store)
    }
}
