//! Keeps every workspace replicated on the node fleet.
//!
//! [`Fleet`] is the controller's view of nodes and the copies they hold,
//! fed by node polls. [`plan`] turns a snapshot of it into actions, and
//! [`PlacementController`] runs replication and rebalancing passes that
//! dispatch those actions to the nodes.

mod controller;
mod fleet;
pub mod plan;

pub use controller::{ActionRecord, PassKind, PassReport, PlacementController};
pub use fleet::{Fleet, NodeState, Replica, Route, RouteMove};
pub use plan::{Action, Classification, PassCounts};

use crate::node::{NodeError, NodeId};
use crate::WorkspaceId;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no candidate for workspace {workspace}: {reason}")]
    NoCandidate {
        workspace: WorkspaceId,
        reason: String,
    },
    #[error("action for workspace {workspace} timed out")]
    ActionTimeout { workspace: WorkspaceId },
    #[error("node {node} failed: {source}")]
    Node {
        node: NodeId,
        #[source]
        source: NodeError,
    },
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}
