use super::{Room, RoomError};
use crate::config::SyncSettings;
use crate::node::WorkspaceStatus;
use crate::storage::StorePool;
use crate::WorkspaceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Manager for all open workspaces on this node.
pub struct RoomManager {
    rooms: RwLock<HashMap<WorkspaceId, Arc<Room>>>,
    pool: StorePool,
    settings: Arc<SyncSettings>,
}

impl RoomManager {
    pub fn new(pool: StorePool, settings: Arc<SyncSettings>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            pool,
            settings,
        }
    }

    /// Get or open the room for a workspace.
    pub async fn get_or_create_room(&self, id: WorkspaceId) -> Result<Arc<Room>, RoomError> {
        // Check with read lock first
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check
        if let Some(room) = rooms.get(&id) {
            return Ok(room.clone());
        }

        let lease = self.pool.acquire(id).await?;
        let room = Room::open(id, lease, self.settings.clone()).await?;
        rooms.insert(id, room.clone());
        Ok(room)
    }

    pub async fn get_room(&self, id: WorkspaceId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Flush and drop rooms nobody is connected to. Returns their ids.
    pub async fn cleanup_empty_rooms(&self) -> Vec<WorkspaceId> {
        let removed = {
            let mut rooms = self.rooms.write().await;
            let mut to_remove = Vec::new();
            for (id, room) in rooms.iter() {
                if room.agent_count().await == 0 {
                    to_remove.push(*id);
                }
            }
            to_remove
                .into_iter()
                .filter_map(|id| rooms.remove(&id))
                .collect::<Vec<_>>()
        };

        let mut ids = Vec::with_capacity(removed.len());
        for room in removed {
            room.flush().await;
            tracing::debug!("Closed idle workspace {}", room.id());
            ids.push(room.id());
        }
        ids
    }

    /// Disconnect everyone from a workspace and close it.
    pub async fn evict(&self, id: WorkspaceId, reason: &str) -> bool {
        let Some(room) = self.rooms.write().await.remove(&id) else {
            return false;
        };
        room.evict(reason).await;
        true
    }

    /// Status of every open workspace, for node polls.
    pub async fn statuses(&self) -> Vec<WorkspaceStatus> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            out.push(room.status().await);
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
