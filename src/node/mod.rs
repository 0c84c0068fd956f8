//! Storage/serving nodes as the placement controller talks to them.
//!
//! A node hosts copies of workspaces. The controller only needs four calls:
//! fetch a copy from another node, delete a copy, report load, and list
//! what the node holds. [`HttpNodeClient`] speaks them over HTTP;
//! [`NodePoller`] calls the reporting pair on an interval.

mod client;
mod poller;

pub use client::HttpNodeClient;
pub use poller::{NodePoller, NodeSnapshot, PollReport};

use crate::config::BusyThresholds;
use crate::WorkspaceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Node ID, as configured.
pub type NodeId = String;

/// Error from a node call.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("node returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NodeError::Timeout(e.to_string())
        } else if e.is_decode() {
            NodeError::Decode(e.to_string())
        } else {
            NodeError::Http(e.to_string())
        }
    }
}

/// Load figures a node reports. All values are fractions in `0..=1`
/// except `loadavg`, which is normalized per CPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub loadavg: f64,
    pub mem_free: f64,
    pub disk_usage: f64,
}

impl NodeLoad {
    pub fn is_busy(&self, thresholds: &BusyThresholds) -> bool {
        self.loadavg > thresholds.loadavg || 1.0 - self.mem_free > thresholds.mem_used
    }
}

/// One workspace copy as reported by the node holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub id: WorkspaceId,
    /// `None` when the node has no version for its copy yet.
    #[serde(default)]
    pub version: Option<u64>,
    /// Whether the node is serving editors for this workspace.
    #[serde(default)]
    pub active: bool,
}

/// Result of a copy: the state of the new copy on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyResult {
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub active: bool,
}

/// RPC surface of a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn id(&self) -> &str;

    /// Have this node fetch `workspace` from the node at `source`.
    async fn copy(&self, workspace: WorkspaceId, source: &str) -> Result<CopyResult, NodeError>;

    /// Drop this node's copy of `workspace`.
    async fn delete(&self, workspace: WorkspaceId) -> Result<(), NodeError>;

    async fn report_load(&self) -> Result<NodeLoad, NodeError>;

    /// Every workspace copy the node holds.
    async fn poll_status(&self) -> Result<Vec<WorkspaceStatus>, NodeError>;
}
