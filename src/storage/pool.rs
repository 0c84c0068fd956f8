//! Reference-counted checkout of per-workspace stores.
//!
//! A store stays open while any [`StoreLease`] for it is alive. Released
//! stores are kept open for reuse until more than `max_open` stores are open,
//! at which point the least recently released idle ones are closed. Reopening
//! a closed store is always safe.

use super::{StorageError, WorkspaceStore};
use crate::WorkspaceId;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Opens the store for a workspace. May block; called off the runtime.
pub trait StoreOpener: Send + Sync {
    fn open(&self, workspace: WorkspaceId) -> Result<Arc<dyn WorkspaceStore>, StorageError>;
}

struct PoolEntry {
    store: Arc<dyn WorkspaceStore>,
    refcount: usize,
    released_at: Option<Instant>,
}

struct PoolShared {
    opener: Arc<dyn StoreOpener>,
    max_open: usize,
    entries: Mutex<HashMap<WorkspaceId, PoolEntry>>,
}

impl PoolShared {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<WorkspaceId, PoolEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, workspace: WorkspaceId) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&workspace) else {
            tracing::error!("Released store for workspace {} that is not open", workspace);
            return;
        };
        if entry.refcount == 0 {
            tracing::error!("Refcount for workspace {} store is already zero", workspace);
        }
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        entry.released_at.get_or_insert_with(Instant::now);

        if entries.len() <= self.max_open {
            return;
        }
        let mut idle: Vec<(WorkspaceId, Instant)> = entries
            .iter()
            .filter_map(|(id, e)| match (e.refcount, e.released_at) {
                (0, Some(at)) => Some((*id, at)),
                _ => None,
            })
            .collect();
        idle.sort_by_key(|(_, at)| *at);
        let excess = entries.len() - self.max_open;
        for (id, _) in idle.into_iter().take(excess) {
            tracing::debug!("Closing idle store for workspace {}", id);
            entries.remove(&id);
        }
    }
}

/// Pool of open workspace stores.
#[derive(Clone)]
pub struct StorePool {
    shared: Arc<PoolShared>,
}

impl StorePool {
    pub fn new(opener: Arc<dyn StoreOpener>, max_open: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                opener,
                max_open,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Check out the store for a workspace, opening it if needed.
    pub async fn acquire(&self, workspace: WorkspaceId) -> Result<StoreLease, StorageError> {
        if let Some(lease) = self.checkout(workspace) {
            return Ok(lease);
        }

        tracing::debug!("Opening store for workspace {}", workspace);
        let opener = self.shared.opener.clone();
        let store = tokio::task::spawn_blocking(move || opener.open(workspace))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))??;

        let mut entries = self.shared.entries();
        // Another task may have opened it while we were blocked.
        let entry = entries.entry(workspace).or_insert(PoolEntry {
            store,
            refcount: 0,
            released_at: None,
        });
        entry.refcount += 1;
        entry.released_at = None;
        Ok(StoreLease {
            pool: self.shared.clone(),
            workspace,
            store: entry.store.clone(),
        })
    }

    fn checkout(&self, workspace: WorkspaceId) -> Option<StoreLease> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(&workspace)?;
        entry.refcount += 1;
        entry.released_at = None;
        Some(StoreLease {
            pool: self.shared.clone(),
            workspace,
            store: entry.store.clone(),
        })
    }

    /// Number of stores currently open.
    pub fn open_count(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_open(&self, workspace: WorkspaceId) -> bool {
        self.shared.entries().contains_key(&workspace)
    }

    /// Outstanding leases for a workspace.
    pub fn refcount(&self, workspace: WorkspaceId) -> usize {
        self.shared
            .entries()
            .get(&workspace)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

/// A checked-out store. Dropping the lease releases it back to the pool.
pub struct StoreLease {
    pool: Arc<PoolShared>,
    workspace: WorkspaceId,
    store: Arc<dyn WorkspaceStore>,
}

impl StoreLease {
    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    pub fn store(&self) -> Arc<dyn WorkspaceStore> {
        self.store.clone()
    }
}

impl Deref for StoreLease {
    type Target = dyn WorkspaceStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.pool.release(self.workspace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStoreOpener, RedbStoreOpener};
    use std::time::Duration;

    #[tokio::test]
    async fn test_refcount_tracks_leases() {
        let pool = StorePool::new(Arc::new(MemoryStoreOpener::new()), 10);
        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(1).await.unwrap();
        assert_eq!(pool.refcount(1), 2);
        drop(a);
        assert_eq!(pool.refcount(1), 1);
        drop(b);
        assert_eq!(pool.refcount(1), 0);
        assert!(pool.is_open(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_recently_released_closed_first() {
        let pool = StorePool::new(Arc::new(MemoryStoreOpener::new()), 2);
        let held = pool.acquire(1).await.unwrap();
        for ws in [2, 3] {
            let lease = pool.acquire(ws).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
            drop(lease);
        }
        // 1 is in use, 2 was released before 3.
        assert_eq!(pool.open_count(), 2);
        assert!(pool.is_open(1));
        assert!(!pool.is_open(2));
        assert!(pool.is_open(3));
        drop(held);
    }

    #[tokio::test]
    async fn test_busy_stores_never_closed() {
        let pool = StorePool::new(Arc::new(MemoryStoreOpener::new()), 1);
        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(2).await.unwrap();
        assert_eq!(pool.open_count(), 2);
        drop(a);
        assert_eq!(pool.open_count(), 1);
        assert!(pool.is_open(2));
        drop(b);
    }

    #[tokio::test]
    async fn test_reopen_after_close_sees_data() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::new(Arc::new(RedbStoreOpener::new(dir.path())), 0);
        {
            let lease = pool.acquire(7).await.unwrap();
            lease.put_meta("version", "3").await.unwrap();
        }
        assert!(!pool.is_open(7));
        let lease = pool.acquire(7).await.unwrap();
        assert_eq!(lease.get_meta("version").await.unwrap().as_deref(), Some("3"));
    }
}
