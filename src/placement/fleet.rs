use crate::config::NodeConfig;
use crate::node::{CopyResult, NodeId, NodeLoad, WorkspaceStatus};
use crate::WorkspaceId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

const MAX_ROUTE_MOVES: usize = 100;

/// A copy of a workspace on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub version: Option<u64>,
    pub active: bool,
}

/// What the controller knows about one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: NodeId,
    pub address: String,
    pub backup: bool,
    /// Never chosen as a source or destination. Set by config or by draining.
    pub excluded: bool,
    pub draining: bool,
    pub load: Option<NodeLoad>,
    /// When polls started failing; cleared by the next good poll.
    pub error_since: Option<Instant>,
}

impl NodeState {
    fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            backup: config.backup,
            excluded: config.excluded,
            draining: false,
            load: None,
            error_since: None,
        }
    }

    /// Polled successfully and not currently failing.
    pub fn is_connected(&self) -> bool {
        self.load.is_some() && self.error_since.is_none()
    }

    /// Failing for longer than `threshold`.
    pub fn is_lost(&self, now: Instant, threshold: Duration) -> bool {
        self.error_since
            .is_some_and(|since| now.saturating_duration_since(since) > threshold)
    }

    /// Candidate for serving copies.
    pub fn is_eligible(&self) -> bool {
        self.is_connected() && !self.excluded && !self.backup
    }

    pub fn disk_usage(&self) -> f64 {
        self.load.map(|l| l.disk_usage).unwrap_or(1.0)
    }
}

/// Routing pin for a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub node: NodeId,
    /// Consecutive polls of `node` that did not report the workspace active.
    pub missed_polls: u32,
}

/// A pin that moved while its workspace was being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMove {
    pub workspace: WorkspaceId,
    pub from: NodeId,
    pub to: NodeId,
    pub at: DateTime<Utc>,
}

/// Nodes, the copies they hold, and where workspaces are routed.
#[derive(Debug, Clone)]
pub struct Fleet {
    nodes: BTreeMap<NodeId, NodeState>,
    replicas: BTreeMap<WorkspaceId, BTreeMap<NodeId, Replica>>,
    routes: HashMap<WorkspaceId, Route>,
    moves: VecDeque<RouteMove>,
    error_threshold: Duration,
    max_route_age: u32,
}

impl Fleet {
    pub fn new(error_threshold: Duration, max_route_age: u32) -> Self {
        Self {
            nodes: BTreeMap::new(),
            replicas: BTreeMap::new(),
            routes: HashMap::new(),
            moves: VecDeque::new(),
            error_threshold,
            max_route_age,
        }
    }

    pub fn add_node(&mut self, config: &NodeConfig) {
        self.nodes
            .insert(config.id.clone(), NodeState::from_config(config));
    }

    /// Forget a node, its copies and every pin to it.
    pub fn remove_node(&mut self, id: &str) -> Option<NodeState> {
        let state = self.nodes.remove(id)?;
        for copies in self.replicas.values_mut() {
            copies.remove(id);
        }
        self.replicas.retain(|_, copies| !copies.is_empty());
        self.routes.retain(|_, route| route.node != id);
        Some(state)
    }

    /// Exclude a node from placement and drop pins to it. Its copies stop
    /// counting toward the replica target right away, so replacements get
    /// made elsewhere.
    pub fn drain_node(&mut self, id: &str) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        node.excluded = true;
        node.draining = true;
        self.routes.retain(|_, route| route.node != id);
        true
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Backups are taken while any backup node is reachable.
    pub fn backups_enabled(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.backup && !n.excluded && n.is_connected())
    }

    pub fn workspaces(&self) -> impl Iterator<Item = WorkspaceId> + '_ {
        self.replicas.keys().copied()
    }

    pub fn replicas(&self, workspace: WorkspaceId) -> impl Iterator<Item = (&NodeState, &Replica)> {
        self.replicas
            .get(&workspace)
            .into_iter()
            .flat_map(|copies| copies.iter())
            .filter_map(|(id, replica)| self.nodes.get(id).map(|n| (n, replica)))
    }

    pub fn replica(&self, workspace: WorkspaceId, node: &str) -> Option<Replica> {
        self.replicas.get(&workspace)?.get(node).copied()
    }

    /// Copies that count toward the replication factor: on serving nodes
    /// that have not been unreachable past the error threshold.
    pub fn live_copies(&self, workspace: WorkspaceId, now: Instant) -> Vec<(&NodeState, &Replica)> {
        self.replicas(workspace)
            .filter(|(node, _)| {
                !node.backup && !node.excluded && !node.is_lost(now, self.error_threshold)
            })
            .collect()
    }

    pub fn has_backup(&self, workspace: WorkspaceId) -> bool {
        self.replicas(workspace).any(|(node, _)| node.backup)
    }

    pub fn is_active(&self, workspace: WorkspaceId) -> bool {
        self.replicas(workspace).any(|(_, r)| r.active)
    }

    pub fn record_failure(&mut self, id: &str, at: Instant) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.error_since.get_or_insert(at);
        }
    }

    /// Apply a full status poll: the node's copies are replaced by what it
    /// reported, and pins are aged or moved.
    pub fn record_status(&mut self, id: &str, load: NodeLoad, statuses: &[WorkspaceStatus]) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.load = Some(load);
        node.error_since = None;

        for copies in self.replicas.values_mut() {
            copies.remove(id);
        }
        for status in statuses {
            self.replicas.entry(status.id).or_default().insert(
                id.to_string(),
                Replica {
                    version: status.version,
                    active: status.active,
                },
            );
        }
        self.replicas.retain(|_, copies| !copies.is_empty());

        let active: Vec<WorkspaceId> = statuses.iter().filter(|s| s.active).map(|s| s.id).collect();
        for route in self.routes.values_mut() {
            if route.node == id {
                route.missed_polls += 1;
            }
        }
        for workspace in active {
            self.pin(workspace, id);
        }
        let max_age = self.max_route_age;
        self.routes.retain(|workspace, route| {
            let keep = route.missed_polls <= max_age;
            if !keep {
                tracing::debug!(
                    "Dropping stale route for workspace {} to node {}",
                    workspace,
                    route.node
                );
            }
            keep
        });
    }

    pub fn record_copy(&mut self, id: &str, workspace: WorkspaceId, result: CopyResult) {
        self.replicas.entry(workspace).or_default().insert(
            id.to_string(),
            Replica {
                version: result.version,
                active: result.active,
            },
        );
    }

    pub fn remove_replica(&mut self, id: &str, workspace: WorkspaceId) {
        if let Some(copies) = self.replicas.get_mut(&workspace) {
            copies.remove(id);
            if copies.is_empty() {
                self.replicas.remove(&workspace);
            }
        }
        if self.routes.get(&workspace).is_some_and(|r| r.node == id) {
            self.routes.remove(&workspace);
        }
    }

    pub fn route(&self, workspace: WorkspaceId) -> Option<&Route> {
        self.routes.get(&workspace)
    }

    /// Pin a workspace to a node. A pin that moves while the workspace is
    /// served is recorded as a move.
    pub fn pin(&mut self, workspace: WorkspaceId, id: &str) {
        let previous = self.routes.insert(
            workspace,
            Route {
                node: id.to_string(),
                missed_polls: 0,
            },
        );
        if let Some(previous) = previous {
            if previous.node != id && self.is_active(workspace) {
                tracing::info!(
                    "Workspace {} moved from node {} to {}",
                    workspace,
                    previous.node,
                    id
                );
                self.moves.push_back(RouteMove {
                    workspace,
                    from: previous.node,
                    to: id.to_string(),
                    at: Utc::now(),
                });
                while self.moves.len() > MAX_ROUTE_MOVES {
                    self.moves.pop_front();
                }
            }
        }
    }

    pub fn unpin(&mut self, workspace: WorkspaceId) {
        self.routes.remove(&workspace);
    }

    pub fn moves(&self) -> impl Iterator<Item = &RouteMove> {
        self.moves.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            address: format!("{}:80", id),
            backup: false,
            excluded: false,
        }
    }

    fn load() -> NodeLoad {
        NodeLoad {
            loadavg: 0.1,
            mem_free: 0.9,
            disk_usage: 0.2,
        }
    }

    fn status(id: WorkspaceId, version: u64, active: bool) -> WorkspaceStatus {
        WorkspaceStatus {
            id,
            version: Some(version),
            active,
        }
    }

    fn fleet() -> Fleet {
        let mut fleet = Fleet::new(Duration::from_secs(10), 2);
        for id in ["a", "b"] {
            fleet.add_node(&config(id));
        }
        fleet
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_replaces_node_copies() {
        let mut fleet = fleet();
        fleet.record_status("a", load(), &[status(1, 1, false), status(2, 1, false)]);
        fleet.record_status("a", load(), &[status(2, 2, false)]);
        assert_eq!(fleet.workspaces().collect::<Vec<_>>(), vec![2]);
        assert_eq!(fleet.replica(2, "a").unwrap().version, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_node_copies_not_counted() {
        let mut fleet = fleet();
        fleet.record_status("a", load(), &[status(1, 1, false)]);
        fleet.record_status("b", load(), &[status(1, 1, false)]);
        let now = Instant::now();
        fleet.record_failure("b", now);
        assert!(!fleet.node("b").unwrap().is_connected());
        assert_eq!(fleet.live_copies(1, now).len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(fleet.live_copies(1, Instant::now()).len(), 1);
        // The copy itself is remembered for when the node comes back.
        assert!(fleet.replica(1, "b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_ages_out() {
        let mut fleet = fleet();
        fleet.record_status("a", load(), &[status(1, 1, true)]);
        assert_eq!(fleet.route(1).unwrap().node, "a");
        for _ in 0..2 {
            fleet.record_status("a", load(), &[status(1, 1, false)]);
            assert!(fleet.route(1).is_some());
        }
        fleet.record_status("a", load(), &[status(1, 1, false)]);
        assert!(fleet.route(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_move_recorded() {
        let mut fleet = fleet();
        fleet.record_status("a", load(), &[status(1, 1, true)]);
        fleet.record_status("a", load(), &[]);
        fleet.record_status("b", load(), &[status(1, 1, true)]);
        assert_eq!(fleet.route(1).unwrap().node, "b");
        let moves: Vec<_> = fleet.moves().collect();
        assert_eq!(moves.len(), 1);
        assert_eq!((moves[0].from.as_str(), moves[0].to.as_str()), ("a", "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_and_remove() {
        let mut fleet = fleet();
        fleet.record_status("a", load(), &[status(1, 1, true)]);
        assert!(fleet.drain_node("a"));
        assert!(fleet.route(1).is_none());
        assert!(!fleet.node("a").unwrap().is_eligible());

        fleet.remove_node("a");
        assert!(fleet.node("a").is_none());
        assert_eq!(fleet.workspaces().count(), 0);
    }
}
