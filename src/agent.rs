//! Connected editors as seen by the engine: an [`Agent`] is anything that can
//! receive [`ServerEvent`]s. Transports implement the trait; the engine never
//! sees sockets.

use crate::buffer::{BufferId, Encoding};
use crate::fingerprint::Fingerprint;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unique agent ID.
pub type AgentId = String;

/// Full content of a buffer as sent to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferContent {
    pub id: BufferId,
    pub path: String,
    pub md5: Fingerprint,
    pub encoding: Encoding,
    /// Text for utf8 buffers, base64 for binary ones.
    pub buf: String,
}

impl BufferContent {
    pub fn new(id: BufferId, path: &str, encoding: Encoding, content: &[u8]) -> Self {
        let buf = match encoding {
            Encoding::Utf8 => String::from_utf8_lossy(content).into_owned(),
            Encoding::Binary => STANDARD.encode(content),
        };
        Self {
            id,
            path: path.to_string(),
            md5: Fingerprint::of(content),
            encoding,
            buf,
        }
    }

    /// Raw bytes carried by this message.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.encoding {
            Encoding::Utf8 => Ok(self.buf.clone().into_bytes()),
            Encoding::Binary => STANDARD.decode(&self.buf),
        }
    }
}

/// A patch applied to a buffer, as relayed to other agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEvent {
    pub id: BufferId,
    pub path: String,
    pub user_id: AgentId,
    pub username: String,
    pub md5_before: Fingerprint,
    pub md5_after: Fingerprint,
    pub patch: String,
}

/// Cursor/selection ranges an agent shares for one buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightEvent {
    pub id: BufferId,
    pub user_id: AgentId,
    pub username: String,
    pub ranges: Vec<(usize, usize)>,
    pub summon: bool,
    pub following: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: AgentId,
    pub username: String,
    pub data: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Everything the server can send to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ServerEvent {
    Patch(PatchEvent),
    /// Full buffer content; the agent replaces its local copy.
    GetBuf(BufferContent),
    CreateBuf(BufferContent),
    DeleteBuf {
        id: BufferId,
        path: String,
        user_id: AgentId,
        username: String,
    },
    RenameBuf {
        id: BufferId,
        old_path: String,
        path: String,
        user_id: AgentId,
        username: String,
    },
    Highlight(HighlightEvent),
    Join {
        user_id: AgentId,
        username: String,
    },
    Part {
        user_id: AgentId,
        username: String,
    },
    Msg(ChatMessage),
    Error {
        msg: String,
        flash: bool,
    },
    Disconnect {
        reason: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Patch(_) => "patch",
            ServerEvent::GetBuf(_) => "get_buf",
            ServerEvent::CreateBuf(_) => "create_buf",
            ServerEvent::DeleteBuf { .. } => "delete_buf",
            ServerEvent::RenameBuf { .. } => "rename_buf",
            ServerEvent::Highlight(_) => "highlight",
            ServerEvent::Join { .. } => "join",
            ServerEvent::Part { .. } => "part",
            ServerEvent::Msg(_) => "msg",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Disconnect { .. } => "disconnect",
        }
    }
}

/// A connected editor.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn username(&self) -> &str;

    /// Queue an event for this agent (non-blocking).
    /// Returns false if the event could not be queued.
    fn write(&self, event: ServerEvent) -> bool;

    fn is_connected(&self) -> bool;

    /// Replace the agent's copy of a buffer with authoritative content.
    fn send_full_buffer(&self, content: BufferContent) -> bool {
        self.write(ServerEvent::GetBuf(content))
    }

    /// Tell the agent why it is being dropped and stop delivering events.
    fn disconnect(&self, reason: &str);
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent({} {})", self.username(), self.id())
    }
}

/// Agent backed by an mpsc channel; the transport drains the receiver.
#[derive(Debug)]
pub struct ChannelAgent {
    id: AgentId,
    username: String,
    sender: mpsc::Sender<ServerEvent>,
    connected: AtomicBool,
}

impl ChannelAgent {
    /// Create an agent and the receiving end of its outgoing queue.
    pub fn new(username: &str, capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let agent = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            sender,
            connected: AtomicBool::new(true),
        });
        (agent, receiver)
    }
}

impl Agent for ChannelAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn write(&self, event: ServerEvent) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("Agent {} queue full, dropping {} event", self.id, event.name());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    fn disconnect(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.sender.try_send(ServerEvent::Disconnect {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_agent_delivers_events() {
        let (agent, mut rx) = ChannelAgent::new("alice", 8);
        assert!(agent.is_connected());
        assert!(agent.write(ServerEvent::Join {
            user_id: "u1".into(),
            username: "bob".into(),
        }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "join");
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let (agent, mut rx) = ChannelAgent::new("alice", 8);
        agent.disconnect("evicted");
        assert!(!agent.is_connected());
        assert!(!agent.write(ServerEvent::Error {
            msg: "late".into(),
            flash: false,
        }));
        match rx.recv().await.unwrap() {
            ServerEvent::Disconnect { reason } => assert_eq!(reason, "evicted"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let (agent, _rx) = ChannelAgent::new("alice", 1);
        let msg = || ServerEvent::Error {
            msg: "x".into(),
            flash: false,
        };
        assert!(agent.write(msg()));
        assert!(!agent.write(msg()));
    }

    #[test]
    fn test_binary_content_is_base64() {
        let content = BufferContent::new(7, "img.png", Encoding::Binary, &[0, 159, 146, 150]);
        assert_eq!(content.buf, "AJ+Slg==");
        assert_eq!(content.bytes().unwrap(), vec![0, 159, 146, 150]);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ServerEvent::Part {
            user_id: "u1".into(),
            username: "bob".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "part");
        assert_eq!(json["username"], "bob");
    }
}
