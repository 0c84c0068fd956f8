//! A workspace as seen by its editors: the buffer tree, who is connected,
//! and the events they share.
//!
//! Buffer-level work (patches, resyncs, saves) is delegated to
//! [`SyncBuffer`]; the room decides who hears about it. Patches and
//! highlights go to everyone but the sender, tree changes and chat go to
//! everyone.

mod backlog;
mod manager;
mod tree;

pub use backlog::{Backlog, LoggedEvent};
pub use manager::RoomManager;
pub use tree::{split_path, PathError, PathTree};

use crate::agent::{Agent, AgentId, ChatMessage, HighlightEvent, ServerEvent};
use crate::buffer::{BufferId, Encoding, PatchOutcome, SetOutcome, SyncBuffer, SyncError};
use crate::config::SyncSettings;
use crate::fingerprint::Fingerprint;
use crate::node::WorkspaceStatus;
use crate::storage::{BufferRecord, StorageError, StoreLease};
use crate::WorkspaceId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const VERSION_KEY: &str = "version";
const BACKLOG_KEY: &str = "backlog";
const PART_IDS_KEY: &str = "part_event_ids";

/// Error from room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("no buffer with id {0}")]
    NoSuchBuffer(BufferId),
    #[error("workspace is too big: {size} bytes, max {max}")]
    WorkspaceTooLarge { size: usize, max: usize },
    #[error("agent {0} is not in this room")]
    NotJoined(AgentId),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-agent patch volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub patch_count: u64,
    pub patch_bytes: u64,
}

struct Member {
    agent: Arc<dyn Agent>,
    stats: AgentStats,
}

/// What a joining agent needs to build its view of the workspace.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub version: u64,
    pub buffers: Vec<BufferRecord>,
    /// `(id, username)` of everyone in the room, the joiner included.
    pub agents: Vec<(AgentId, String)>,
}

/// Result of replacing a buffer's content.
#[derive(Debug)]
pub enum SetResult {
    Updated(SetOutcome),
    /// The encoding changed, so the buffer was deleted and created again.
    Recreated(Arc<SyncBuffer>),
}

struct RoomState {
    buffers: BTreeMap<BufferId, Arc<SyncBuffer>>,
    tree: PathTree,
    members: HashMap<AgentId, Member>,
    backlog: Backlog,
    version: u64,
    next_buffer_id: BufferId,
    /// Id of each user's most recent part event.
    part_event_ids: HashMap<String, u64>,
    last_highlight: Option<HighlightEvent>,
}

impl RoomState {
    fn agent(&self, agent_id: &str) -> Result<Arc<dyn Agent>, RoomError> {
        self.members
            .get(agent_id)
            .map(|m| m.agent.clone())
            .ok_or_else(|| RoomError::NotJoined(agent_id.to_string()))
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<SyncBuffer>, RoomError> {
        self.buffers
            .get(&id)
            .cloned()
            .ok_or(RoomError::NoSuchBuffer(id))
    }

    fn peers(&self, except: &str) -> Vec<Arc<dyn Agent>> {
        self.members
            .iter()
            .filter(|(id, _)| id.as_str() != except)
            .map(|(_, m)| m.agent.clone())
            .collect()
    }

    fn broadcast(&self, event: &ServerEvent) {
        for member in self.members.values() {
            member.agent.write(event.clone());
        }
    }

    fn broadcast_except(&self, except: &str, event: &ServerEvent) {
        for (id, member) in &self.members {
            if id != except {
                member.agent.write(event.clone());
            }
        }
    }

    /// Append a persistent event. Returns its id, the new room version.
    fn log(&mut self, event: ServerEvent) -> u64 {
        self.version += 1;
        self.backlog.push(LoggedEvent {
            id: self.version,
            event,
        });
        self.version
    }

    async fn total_size(&self) -> usize {
        let mut size = 0;
        for buffer in self.buffers.values() {
            size += buffer.loaded_len().await.unwrap_or(0);
        }
        size
    }
}

/// One open workspace.
pub struct Room {
    id: WorkspaceId,
    settings: Arc<SyncSettings>,
    store: StoreLease,
    state: RwLock<RoomState>,
}

impl Room {
    /// Open a workspace from its store. Buffers start unloaded.
    pub async fn open(
        id: WorkspaceId,
        store: StoreLease,
        settings: Arc<SyncSettings>,
    ) -> Result<Arc<Self>, RoomError> {
        let records = store.records().await?;
        let mut tree = PathTree::new();
        let mut buffers = BTreeMap::new();
        let mut next_buffer_id = 1;
        for record in records {
            next_buffer_id = next_buffer_id.max(record.id + 1);
            if let Err(e) = tree.insert(&record.path, record.id) {
                warn!("Skipping buffer {} in workspace {}: {}", record.id, id, e);
                continue;
            }
            let buffer_id = record.id;
            let buffer = SyncBuffer::from_record(id, record, store.store(), settings.clone());
            buffers.insert(buffer_id, buffer);
        }

        let version = match store.get_meta(VERSION_KEY).await? {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("Workspace {} has a bad version {:?}, starting at 0", id, v);
                0
            }),
            None => 0,
        };
        let events: Vec<LoggedEvent> = match store.get_meta(BACKLOG_KEY).await? {
            Some(json) => serde_json::from_str(&json).map_err(StorageError::from)?,
            None => Vec::new(),
        };
        let part_event_ids: HashMap<String, u64> = match store.get_meta(PART_IDS_KEY).await? {
            Some(json) => serde_json::from_str(&json).map_err(StorageError::from)?,
            None => HashMap::new(),
        };

        info!(
            "Opened workspace {} with {} buffers at version {}",
            id,
            buffers.len(),
            version
        );
        Ok(Arc::new(Self {
            id,
            store,
            state: RwLock::new(RoomState {
                buffers,
                tree,
                members: HashMap::new(),
                backlog: Backlog::restore(settings.max_events, events),
                version,
                next_buffer_id,
                part_event_ids,
                last_highlight: None,
            }),
            settings,
        }))
    }

    pub fn id(&self) -> WorkspaceId {
        self.id
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn agent_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub async fn agent_stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.state
            .read()
            .await
            .members
            .get(agent_id)
            .map(|m| m.stats)
    }

    /// `(path, id)` of every buffer, sorted by path.
    pub async fn paths(&self) -> Vec<(String, BufferId)> {
        self.state.read().await.tree.files()
    }

    pub async fn backlog(&self) -> Vec<LoggedEvent> {
        self.state.read().await.backlog.to_vec()
    }

    /// Status as reported to the placement controller.
    pub async fn status(&self) -> WorkspaceStatus {
        let state = self.state.read().await;
        WorkspaceStatus {
            id: self.id,
            version: Some(state.version),
            active: !state.members.is_empty(),
        }
    }

    /// The buffer without loading it.
    pub async fn buffer(&self, id: BufferId) -> Option<Arc<SyncBuffer>> {
        self.state.read().await.buffers.get(&id).cloned()
    }

    pub async fn buffer_by_path(&self, path: &str) -> Option<Arc<SyncBuffer>> {
        let state = self.state.read().await;
        let id = state.tree.get(path)?;
        state.buffers.get(&id).cloned()
    }

    /// The buffer, loaded.
    pub async fn get_buffer(&self, id: BufferId) -> Result<Arc<SyncBuffer>, RoomError> {
        let buffer = self.state.read().await.buffer(id)?;
        buffer.ensure_loaded().await?;
        Ok(buffer)
    }

    /// Add an agent. Everyone else is told; the joiner gets the backlog
    /// newer than its user's last part, and the last shared highlight.
    pub async fn join(&self, agent: Arc<dyn Agent>) -> Result<JoinInfo, RoomError> {
        let (info, replay) = {
            let mut state = self.state.write().await;
            let last_part = state
                .part_event_ids
                .get(agent.username())
                .copied()
                .unwrap_or(0);
            let mut replay: Vec<ServerEvent> =
                state.backlog.since(last_part).map(|e| e.event.clone()).collect();
            if let Some(highlight) = &state.last_highlight {
                replay.push(ServerEvent::Highlight(highlight.clone()));
            }

            let join = ServerEvent::Join {
                user_id: agent.id().to_string(),
                username: agent.username().to_string(),
            };
            state.broadcast(&join);
            state.log(join);
            state.members.insert(
                agent.id().to_string(),
                Member {
                    agent: agent.clone(),
                    stats: AgentStats::default(),
                },
            );

            let mut buffers = Vec::with_capacity(state.buffers.len());
            for buffer in state.buffers.values() {
                buffers.push(buffer.record().await);
            }
            let agents = state
                .members
                .values()
                .map(|m| (m.agent.id().to_string(), m.agent.username().to_string()))
                .collect();
            let info = JoinInfo {
                version: state.version,
                buffers,
                agents,
            };
            (info, replay)
        };

        for event in replay {
            agent.write(event);
        }
        self.persist_events().await;
        info!("{:?} joined workspace {}", agent, self.id);
        Ok(info)
    }

    /// Remove an agent and its per-buffer state. The last agent out
    /// flushes every dirty buffer.
    pub async fn part(&self, agent_id: &str) -> Result<(), RoomError> {
        let (buffers, empty) = {
            let mut state = self.state.write().await;
            let member = state
                .members
                .remove(agent_id)
                .ok_or_else(|| RoomError::NotJoined(agent_id.to_string()))?;
            let part = ServerEvent::Part {
                user_id: agent_id.to_string(),
                username: member.agent.username().to_string(),
            };
            state.broadcast(&part);
            let event_id = state.log(part);
            state
                .part_event_ids
                .insert(member.agent.username().to_string(), event_id);
            if state
                .last_highlight
                .as_ref()
                .is_some_and(|h| h.user_id == agent_id)
            {
                state.last_highlight = None;
            }
            info!("{:?} left workspace {}", member.agent, self.id);
            let buffers: Vec<Arc<SyncBuffer>> = state.buffers.values().cloned().collect();
            (buffers, state.members.is_empty())
        };

        for buffer in &buffers {
            buffer.forget_agent(agent_id).await;
        }
        self.persist_events().await;
        if empty {
            self.flush().await;
        }
        Ok(())
    }

    /// Chat message from an agent, sent to everyone and kept in the backlog.
    pub async fn msg(&self, agent_id: &str, data: &str) -> Result<ChatMessage, RoomError> {
        let message = {
            let mut state = self.state.write().await;
            let agent = state.agent(agent_id)?;
            let message = ChatMessage {
                user_id: agent_id.to_string(),
                username: agent.username().to_string(),
                data: data.to_string(),
                time: chrono::Utc::now(),
            };
            let event = ServerEvent::Msg(message.clone());
            state.broadcast(&event);
            state.log(event);
            message
        };
        self.persist_events().await;
        Ok(message)
    }

    pub async fn create_buffer(
        &self,
        creator: Option<&str>,
        path: &str,
        encoding: Encoding,
        content: Vec<u8>,
    ) -> Result<Arc<SyncBuffer>, RoomError> {
        let mut state = self.state.write().await;
        state.tree.check_free(path)?;
        let size = state.total_size().await + content.len();
        if size > self.settings.max_workspace_size {
            return Err(RoomError::WorkspaceTooLarge {
                size,
                max: self.settings.max_workspace_size,
            });
        }

        let id = state.next_buffer_id;
        let buffer = SyncBuffer::create(
            self.id,
            id,
            path,
            encoding,
            content,
            self.store.store(),
            self.settings.clone(),
        )
        .await?;
        state.next_buffer_id += 1;
        state.tree.insert(path, id)?;
        state.buffers.insert(id, buffer.clone());

        let content = buffer.content().await?;
        state.broadcast(&ServerEvent::CreateBuf(content));
        info!(
            "Created buffer {} {} in workspace {} for {:?}",
            id, path, self.id, creator
        );
        Ok(buffer)
    }

    pub async fn delete_buffer(&self, agent_id: Option<&str>, id: BufferId) -> Result<(), RoomError> {
        let mut state = self.state.write().await;
        let buffer = state.buffer(id)?;
        let path = buffer.path().await;
        buffer.destroy().await?;
        state.buffers.remove(&id);
        state.tree.remove(&path);

        let username = agent_id
            .and_then(|a| state.members.get(a))
            .map(|m| m.agent.username().to_string())
            .unwrap_or_default();
        state.broadcast(&ServerEvent::DeleteBuf {
            id,
            path: path.clone(),
            user_id: agent_id.unwrap_or_default().to_string(),
            username,
        });
        info!("Deleted buffer {} {} in workspace {}", id, path, self.id);
        Ok(())
    }

    pub async fn rename_buffer(
        &self,
        agent_id: Option<&str>,
        id: BufferId,
        new_path: &str,
    ) -> Result<(), RoomError> {
        split_path(new_path)?;
        let mut state = self.state.write().await;
        let buffer = state.buffer(id)?;
        let old_path = buffer.path().await;
        if old_path == new_path {
            return Ok(());
        }
        state.tree.remove(&old_path);
        if let Err(e) = state.tree.insert(new_path, id) {
            if let Err(restore) = state.tree.insert(&old_path, id) {
                error!("Lost buffer {} while renaming: {}", id, restore);
            }
            return Err(e.into());
        }
        if let Err(e) = buffer.rename(new_path).await {
            state.tree.remove(new_path);
            if let Err(restore) = state.tree.insert(&old_path, id) {
                error!("Lost buffer {} while renaming: {}", id, restore);
            }
            return Err(e.into());
        }

        let username = agent_id
            .and_then(|a| state.members.get(a))
            .map(|m| m.agent.username().to_string())
            .unwrap_or_default();
        state.broadcast(&ServerEvent::RenameBuf {
            id,
            old_path: old_path.clone(),
            path: new_path.to_string(),
            user_id: agent_id.unwrap_or_default().to_string(),
            username,
        });
        info!(
            "Renamed buffer {} in workspace {}: {} -> {}",
            id, self.id, old_path, new_path
        );
        Ok(())
    }

    /// Apply a patch from a joined agent and relay it to everyone else.
    pub async fn patch(
        &self,
        agent_id: &str,
        id: BufferId,
        patch: &str,
        md5_before: &Fingerprint,
        md5_after: &Fingerprint,
    ) -> Result<PatchOutcome, RoomError> {
        let (sender, peers, buffer) = {
            let state = self.state.read().await;
            (state.agent(agent_id)?, state.peers(agent_id), state.buffer(id)?)
        };
        let outcome = buffer
            .apply_patch(&sender, &peers, patch, md5_before, md5_after)
            .await?;
        if let PatchOutcome::Applied { bytes_changed, .. } = &outcome {
            let mut state = self.state.write().await;
            if let Some(member) = state.members.get_mut(agent_id) {
                member.stats.patch_count += 1;
                member.stats.patch_bytes += *bytes_changed as u64;
            }
        }
        Ok(outcome)
    }

    /// Replace a buffer's content. `agent_id` is `None` for edits made
    /// outside any editor, which are relayed to everyone.
    pub async fn set_buffer(
        &self,
        agent_id: Option<&str>,
        id: BufferId,
        content: Vec<u8>,
        claimed: Option<&Fingerprint>,
        encoding: Encoding,
    ) -> Result<SetResult, RoomError> {
        let (agent, peers, buffer, size) = {
            let state = self.state.read().await;
            let agent = agent_id.map(|a| state.agent(a)).transpose()?;
            let peers = match agent_id {
                Some(a) => state.peers(a),
                None => state.peers(""),
            };
            (agent, peers, state.buffer(id)?, state.total_size().await)
        };

        if buffer.encoding().await != encoding {
            let path = buffer.path().await;
            debug!(
                "Encoding of {} in workspace {} changed to {}, recreating",
                path, self.id, encoding
            );
            self.delete_buffer(agent_id, id).await?;
            let created = self.create_buffer(agent_id, &path, encoding, content).await?;
            return Ok(SetResult::Recreated(created));
        }

        let old_len = buffer.loaded_len().await.unwrap_or(0);
        let size = size - old_len.min(size) + content.len();
        if size > self.settings.max_workspace_size {
            return Err(RoomError::WorkspaceTooLarge {
                size,
                max: self.settings.max_workspace_size,
            });
        }
        let outcome = buffer.set(agent.as_ref(), &peers, content, claimed).await?;
        Ok(SetResult::Updated(outcome))
    }

    /// Send a buffer's full content to the agent that asked for it.
    pub async fn get_buf(&self, agent_id: &str, id: BufferId) -> Result<(), RoomError> {
        let (agent, buffer) = {
            let state = self.state.read().await;
            (state.agent(agent_id)?, state.buffer(id)?)
        };
        buffer.send_content(&agent).await?;
        Ok(())
    }

    pub async fn highlight(
        &self,
        agent_id: &str,
        id: BufferId,
        ranges: Vec<(usize, usize)>,
        summon: bool,
        following: bool,
    ) -> Result<HighlightEvent, RoomError> {
        let (agent, buffer) = {
            let state = self.state.read().await;
            (state.agent(agent_id)?, state.buffer(id)?)
        };
        let event = buffer.highlight(&agent, ranges, summon, following).await;

        let mut state = self.state.write().await;
        state.broadcast_except(agent_id, &ServerEvent::Highlight(event.clone()));
        if summon || !following {
            state.last_highlight = Some(event.clone());
        }
        Ok(event)
    }

    /// Save every dirty buffer now. Returns how many were written.
    pub async fn flush(&self) -> usize {
        let buffers: Vec<Arc<SyncBuffer>> =
            self.state.read().await.buffers.values().cloned().collect();
        let mut saved = 0;
        for buffer in buffers {
            match buffer.flush().await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => error!(
                    "Error flushing buffer {} in workspace {}: {}",
                    buffer.id(),
                    self.id,
                    e
                ),
            }
        }
        debug!("Flushed {} buffers in workspace {}", saved, self.id);
        saved
    }

    /// Disconnect every agent and flush. The room should be dropped after.
    pub async fn evict(&self, reason: &str) {
        let (members, buffers) = {
            let mut state = self.state.write().await;
            let members: Vec<Member> = state.members.drain().map(|(_, m)| m).collect();
            (members, state.buffers.values().cloned().collect::<Vec<_>>())
        };
        for member in &members {
            member.agent.disconnect(reason);
        }
        self.flush().await;
        for buffer in &buffers {
            buffer.cancel_timers();
        }
        info!(
            "Evicted workspace {} ({} agents): {}",
            self.id,
            members.len(),
            reason
        );
    }

    async fn persist_events(&self) {
        let (version, events, part_ids) = {
            let state = self.state.read().await;
            (
                state.version,
                state.backlog.to_vec(),
                state.part_event_ids.clone(),
            )
        };
        let result = async {
            self.store
                .put_meta(BACKLOG_KEY, &serde_json::to_string(&events).map_err(StorageError::from)?)
                .await?;
            self.store
                .put_meta(PART_IDS_KEY, &serde_json::to_string(&part_ids).map_err(StorageError::from)?)
                .await?;
            self.store.put_meta(VERSION_KEY, &version.to_string()).await
        }
        .await;
        if let Err(e) = result {
            error!("Error saving events for workspace {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChannelAgent;
    use crate::patch::Patch;
    use crate::storage::{MemoryStoreOpener, StorePool};
    use tokio::sync::mpsc;

    async fn room() -> (Arc<Room>, StorePool) {
        let pool = StorePool::new(Arc::new(MemoryStoreOpener::new()), 10);
        let lease = pool.acquire(1).await.unwrap();
        let room = Room::open(1, lease, Arc::new(SyncSettings::default()))
            .await
            .unwrap();
        (room, pool)
    }

    fn agent(name: &str) -> (Arc<dyn Agent>, mpsc::Receiver<ServerEvent>) {
        let (agent, rx) = ChannelAgent::new(name, 64);
        (agent as Arc<dyn Agent>, rx)
    }

    fn names(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.name());
        }
        out
    }

    #[tokio::test]
    async fn test_tree_events_reach_everyone() {
        let (room, _pool) = room().await;
        let (alice, mut alice_rx) = agent("alice");
        let (bob, mut bob_rx) = agent("bob");
        room.join(alice.clone()).await.unwrap();
        room.join(bob.clone()).await.unwrap();
        names(&mut alice_rx);
        names(&mut bob_rx);

        let buffer = room
            .create_buffer(Some(alice.id()), "src/a.txt", Encoding::Utf8, b"hi".to_vec())
            .await
            .unwrap();
        room.rename_buffer(Some(alice.id()), buffer.id(), "src/b.txt")
            .await
            .unwrap();
        room.delete_buffer(Some(alice.id()), buffer.id()).await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(names(rx), vec!["create_buf", "rename_buf", "delete_buf"]);
        }
        assert!(room.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rename_and_delete_leave_buffer_in_place() {
        use crate::storage::WorkspaceStore;

        let opener = Arc::new(MemoryStoreOpener::new());
        let pool = StorePool::new(opener.clone(), 10);
        let lease = pool.acquire(1).await.unwrap();
        let room = Room::open(1, lease, Arc::new(SyncSettings::default()))
            .await
            .unwrap();
        let (alice, mut alice_rx) = agent("alice");
        room.join(alice.clone()).await.unwrap();
        let buffer = room
            .create_buffer(Some(alice.id()), "a.txt", Encoding::Utf8, b"hi".to_vec())
            .await
            .unwrap();
        names(&mut alice_rx);

        let store = opener.store(1);
        store.set_fail_writes(true);
        assert!(room
            .rename_buffer(Some(alice.id()), buffer.id(), "b.txt")
            .await
            .is_err());
        assert_eq!(buffer.path().await, "a.txt");
        assert_eq!(room.paths().await, vec![("a.txt".to_string(), buffer.id())]);

        assert!(room.delete_buffer(Some(alice.id()), buffer.id()).await.is_err());
        assert!(room.buffer(buffer.id()).await.is_some());
        assert_eq!(room.paths().await, vec![("a.txt".to_string(), buffer.id())]);
        assert!(names(&mut alice_rx).is_empty());

        store.set_fail_writes(false);
        room.rename_buffer(Some(alice.id()), buffer.id(), "b.txt")
            .await
            .unwrap();
        room.delete_buffer(Some(alice.id()), buffer.id()).await.unwrap();
        assert_eq!(names(&mut alice_rx), vec!["rename_buf", "delete_buf"]);
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_patch_skips_sender_and_counts_bytes() {
        let (room, _pool) = room().await;
        let (alice, mut alice_rx) = agent("alice");
        let (bob, mut bob_rx) = agent("bob");
        room.join(alice.clone()).await.unwrap();
        room.join(bob.clone()).await.unwrap();
        let buffer = room
            .create_buffer(None, "a.txt", Encoding::Utf8, b"abc".to_vec())
            .await
            .unwrap();
        names(&mut alice_rx);
        names(&mut bob_rx);

        let patch = Patch::diff(b"abc", b"abcdef").to_text();
        room.patch(
            alice.id(),
            buffer.id(),
            &patch,
            &Fingerprint::of(b"abc"),
            &Fingerprint::of(b"abcdef"),
        )
        .await
        .unwrap();

        assert!(names(&mut alice_rx).is_empty());
        assert_eq!(names(&mut bob_rx), vec!["patch"]);
        assert_eq!(
            room.agent_stats(alice.id()).await,
            Some(AgentStats {
                patch_count: 1,
                patch_bytes: 3
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_paths() {
        let (room, _pool) = room().await;
        room.create_buffer(None, "dir/file", Encoding::Utf8, Vec::new())
            .await
            .unwrap();
        for bad in ["", "/abs", "dir/file", "dir/file/child", "dir/../x"] {
            let err = room
                .create_buffer(None, bad, Encoding::Utf8, Vec::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RoomError::InvalidPath(_)), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_rename_into_own_directory_chain() {
        let (room, _pool) = room().await;
        let buffer = room
            .create_buffer(None, "a", Encoding::Utf8, Vec::new())
            .await
            .unwrap();
        room.rename_buffer(None, buffer.id(), "a/b").await.unwrap();
        assert_eq!(room.paths().await, vec![("a/b".to_string(), buffer.id())]);
        assert_eq!(buffer.path().await, "a/b");
    }

    #[tokio::test]
    async fn test_workspace_size_limit() {
        let pool = StorePool::new(Arc::new(MemoryStoreOpener::new()), 10);
        let settings = SyncSettings {
            max_workspace_size: 10,
            ..SyncSettings::default()
        };
        let room = Room::open(1, pool.acquire(1).await.unwrap(), Arc::new(settings))
            .await
            .unwrap();
        room.create_buffer(None, "a", Encoding::Utf8, vec![b'x'; 8])
            .await
            .unwrap();
        let err = room
            .create_buffer(None, "b", Encoding::Utf8, vec![b'y'; 8])
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::WorkspaceTooLarge { size: 16, max: 10 }));
    }

    #[tokio::test]
    async fn test_backlog_replayed_after_last_part() {
        let (room, _pool) = room().await;
        let (alice, _alice_rx) = agent("alice");
        let (bob, _bob_rx) = agent("bob");
        room.join(alice.clone()).await.unwrap();
        room.join(bob.clone()).await.unwrap();
        room.msg(alice.id(), "before").await.unwrap();
        room.part(bob.id()).await.unwrap();
        room.msg(alice.id(), "after").await.unwrap();

        let (bob_again, mut rx) = agent("bob");
        let info = room.join(bob_again).await.unwrap();
        let mut replayed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            replayed.push(event);
        }
        let chats: Vec<&str> = replayed
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Msg(m) => Some(m.data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec!["after"]);
        // join, join, msg, part, msg, join
        assert_eq!(info.version, 6);
        assert_eq!(room.version().await, 6);
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let opener = Arc::new(MemoryStoreOpener::new());
        let pool = StorePool::new(opener, 10);
        let settings = Arc::new(SyncSettings::default());
        {
            let room = Room::open(5, pool.acquire(5).await.unwrap(), settings.clone())
                .await
                .unwrap();
            let (alice, _rx) = agent("alice");
            room.join(alice.clone()).await.unwrap();
            room.msg(alice.id(), "hello").await.unwrap();
            room.create_buffer(None, "notes", Encoding::Utf8, b"text".to_vec())
                .await
                .unwrap();
            room.part(alice.id()).await.unwrap();
        }
        let room = Room::open(5, pool.acquire(5).await.unwrap(), settings)
            .await
            .unwrap();
        assert_eq!(room.version().await, 3);
        assert_eq!(room.backlog().await.len(), 3);
        let buffer = room.buffer_by_path("notes").await.unwrap();
        assert!(!buffer.is_loaded().await);
        assert_eq!(buffer.state().await.unwrap(), b"text".to_vec());
    }

    #[tokio::test]
    async fn test_set_with_new_encoding_recreates() {
        let (room, _pool) = room().await;
        let buffer = room
            .create_buffer(None, "blob", Encoding::Utf8, b"text".to_vec())
            .await
            .unwrap();
        let result = room
            .set_buffer(None, buffer.id(), vec![0, 1, 2], None, Encoding::Binary)
            .await
            .unwrap();
        let SetResult::Recreated(created) = result else {
            panic!("expected recreate");
        };
        assert_ne!(created.id(), buffer.id());
        assert_eq!(created.encoding().await, Encoding::Binary);
        assert_eq!(room.paths().await, vec![("blob".to_string(), created.id())]);
    }

    #[tokio::test]
    async fn test_last_highlight_replayed_to_joiner() {
        let (room, _pool) = room().await;
        let (alice, _alice_rx) = agent("alice");
        room.join(alice.clone()).await.unwrap();
        let buffer = room
            .create_buffer(None, "a", Encoding::Utf8, b"hello".to_vec())
            .await
            .unwrap();
        room.highlight(alice.id(), buffer.id(), vec![(3, 1)], false, false)
            .await
            .unwrap();

        let (bob, mut bob_rx) = agent("bob");
        room.join(bob).await.unwrap();
        let mut highlights = Vec::new();
        while let Ok(event) = bob_rx.try_recv() {
            if let ServerEvent::Highlight(h) = event {
                highlights.push(h);
            }
        }
        assert_eq!(highlights.len(), 1);
        assert_eq!(highlights[0].ranges, vec![(1, 3)]);
    }

    #[tokio::test]
    async fn test_summon_while_following_is_replayed() {
        let (room, _pool) = room().await;
        let (alice, _alice_rx) = agent("alice");
        room.join(alice.clone()).await.unwrap();
        let buffer = room
            .create_buffer(None, "a", Encoding::Utf8, b"hello".to_vec())
            .await
            .unwrap();
        room.highlight(alice.id(), buffer.id(), vec![(0, 2)], true, true)
            .await
            .unwrap();
        // Plain follow updates are not remembered.
        room.highlight(alice.id(), buffer.id(), vec![(4, 5)], false, true)
            .await
            .unwrap();

        let (bob, mut bob_rx) = agent("bob");
        room.join(bob).await.unwrap();
        let mut highlights = Vec::new();
        while let Ok(event) = bob_rx.try_recv() {
            if let ServerEvent::Highlight(h) = event {
                highlights.push(h);
            }
        }
        assert_eq!(highlights.len(), 1);
        assert!(highlights[0].summon);
        assert_eq!(highlights[0].ranges, vec![(0, 2)]);
    }

    #[tokio::test]
    async fn test_evict_disconnects_and_flushes() {
        let (room, _pool) = room().await;
        let (alice, mut alice_rx) = agent("alice");
        room.join(alice.clone()).await.unwrap();
        let buffer = room
            .create_buffer(None, "a", Encoding::Utf8, b"abc".to_vec())
            .await
            .unwrap();
        room.set_buffer(None, buffer.id(), b"abcd".to_vec(), None, Encoding::Utf8)
            .await
            .unwrap();
        assert!(buffer.is_dirty().await);

        room.evict("moving to another node").await;
        assert!(!buffer.is_dirty().await);
        assert!(!alice.is_connected());
        assert!(names(&mut alice_rx).contains(&"disconnect"));
        assert_eq!(room.agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_reports_activity() {
        let (room, _pool) = room().await;
        assert!(!room.status().await.active);
        let (alice, _rx) = agent("alice");
        room.join(alice).await.unwrap();
        let status = room.status().await;
        assert!(status.active);
        assert_eq!(status.version, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected() {
        let (room, _pool) = room().await;
        let buffer = room
            .create_buffer(None, "a", Encoding::Utf8, Vec::new())
            .await
            .unwrap();
        let err = room
            .patch("ghost", buffer.id(), "@@ -0,0 +1 @@\n+x\n", &Fingerprint::of(b""), &Fingerprint::of(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NotJoined(_)));
    }
}
