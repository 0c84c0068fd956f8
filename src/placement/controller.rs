use super::fleet::{Fleet, NodeState, RouteMove};
use super::plan::{self, Action, PassCounts};
use super::PlacementError;
use crate::config::{NodeConfig, PlacementSettings};
use crate::node::{NodeClient, NodeId, PollReport};
use crate::WorkspaceId;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MAX_ACTION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Replicate,
    Rebalance,
}

/// Summary of one finished pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub kind: PassKind,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub counts: PassCounts,
    /// Workspaces that needed an action but had no candidate.
    pub unplaceable: usize,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// A dispatched action and how it ended.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action: Action,
    pub finished: DateTime<Utc>,
    pub error: Option<String>,
}

/// Clears a pass flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs replication and rebalancing passes over the node fleet.
pub struct PlacementController {
    settings: PlacementSettings,
    fleet: RwLock<Fleet>,
    clients: RwLock<HashMap<NodeId, Arc<dyn NodeClient>>>,
    /// Workspaces with an action in flight.
    running: Mutex<HashSet<WorkspaceId>>,
    replicating: AtomicBool,
    rebalancing: AtomicBool,
    history: Mutex<VecDeque<ActionRecord>>,
    last_pass: Mutex<Option<PassReport>>,
    rng: Mutex<StdRng>,
}

impl PlacementController {
    pub fn new(settings: PlacementSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Use a fixed RNG, for reproducible tie-breaking.
    pub fn with_rng(settings: PlacementSettings, rng: StdRng) -> Self {
        let fleet = Fleet::new(settings.node_error_threshold(), settings.max_route_age);
        Self {
            settings,
            fleet: RwLock::new(fleet),
            clients: RwLock::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            replicating: AtomicBool::new(false),
            rebalancing: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            last_pass: Mutex::new(None),
            rng: Mutex::new(rng),
        }
    }

    pub fn settings(&self) -> &PlacementSettings {
        &self.settings
    }

    pub async fn add_node(&self, config: &NodeConfig, client: Arc<dyn NodeClient>) {
        info!(
            "[placement] Adding node {} at {}{}",
            config.id,
            config.address,
            if config.backup { " (backup)" } else { "" }
        );
        self.fleet.write().await.add_node(config);
        self.clients.write().await.insert(config.id.clone(), client);
    }

    pub async fn remove_node(&self, id: &str) -> Result<(), PlacementError> {
        self.fleet
            .write()
            .await
            .remove_node(id)
            .ok_or_else(|| PlacementError::UnknownNode(id.to_string()))?;
        self.clients.write().await.remove(id);
        info!("[placement] Removed node {}", id);
        Ok(())
    }

    pub async fn drain_node(&self, id: &str) -> Result<(), PlacementError> {
        if !self.fleet.write().await.drain_node(id) {
            return Err(PlacementError::UnknownNode(id.to_string()));
        }
        info!("[placement] Draining node {}", id);
        Ok(())
    }

    /// Ready once at least `repcount` nodes are known.
    pub async fn is_ready(&self) -> bool {
        self.fleet.read().await.node_count() >= self.settings.repcount
    }

    pub async fn ingest(&self, report: PollReport) {
        let mut fleet = self.fleet.write().await;
        match report.outcome {
            Ok(snapshot) => {
                debug!(
                    "[placement] Node {} holds {} workspaces",
                    report.node,
                    snapshot.workspaces.len()
                );
                fleet.record_status(&report.node, snapshot.load, &snapshot.workspaces);
            }
            Err(e) => {
                warn!("[placement] Poll of node {} failed: {}", report.node, e);
                fleet.record_failure(&report.node, report.at);
            }
        }
    }

    /// The node serving `workspace`: its pin if the pinned node is still
    /// connected, otherwise the best live copy, which becomes the new pin.
    pub async fn route(&self, workspace: WorkspaceId) -> Option<NodeId> {
        let mut fleet = self.fleet.write().await;
        if let Some(route) = fleet.route(workspace) {
            if fleet.node(&route.node).is_some_and(NodeState::is_connected) {
                return Some(route.node.clone());
            }
        }
        let best = fleet
            .live_copies(workspace, Instant::now())
            .into_iter()
            .filter(|(node, _)| node.is_connected())
            .max_by_key(|(_, replica)| (replica.active, replica.version))
            .map(|(node, _)| node.id.clone())?;
        fleet.pin(workspace, &best);
        Some(best)
    }

    /// Pick a node for a workspace that has no copies yet and pin it there.
    pub async fn place_new_workspace(&self, workspace: WorkspaceId) -> Result<NodeId, PlacementError> {
        let mut fleet = self.fleet.write().await;
        let chosen = {
            let eligible: Vec<&NodeState> = fleet.nodes().filter(|n| n.is_eligible()).collect();
            let idle: Vec<&NodeState> = eligible
                .iter()
                .copied()
                .filter(|n| n.load.is_some_and(|load| !load.is_busy(&self.settings.busy)))
                .collect();
            let mut rng = self.rng.lock().await;
            idle.choose(&mut *rng)
                .or_else(|| eligible.choose(&mut *rng))
                .map(|n| n.id.clone())
        };
        let node = chosen.ok_or_else(|| PlacementError::NoCandidate {
            workspace,
            reason: "no eligible node".into(),
        })?;
        fleet.pin(workspace, &node);
        info!("[placement] Placed new workspace {} on node {}", workspace, node);
        Ok(node)
    }

    /// Run one replication pass. Returns `None` if a pass is already running.
    pub async fn replicate_once(&self) -> Option<PassReport> {
        let Some(_guard) = PassGuard::acquire(&self.replicating) else {
            warn!("[placement] Replication pass still running, skipping");
            return None;
        };
        let started = Utc::now();
        let plan = {
            let fleet = self.fleet.read().await;
            let running = self.running.lock().await.clone();
            let mut rng = self.rng.lock().await;
            plan::plan_replication(&fleet, &running, &self.settings, Instant::now(), &mut *rng)
        };
        for failure in &plan.failures {
            warn!("[placement] {}", failure);
        }
        let c = plan.counts;
        info!(
            "[placement] Replication pass: {} running, {} need backup, {} low, {} high, {} correct",
            c.running, c.backup, c.low, c.high, c.correct
        );

        let (total, completed) = self.dispatch(plan.actions).await;
        let report = PassReport {
            kind: PassKind::Replicate,
            started,
            finished: Utc::now(),
            counts: plan.counts,
            unplaceable: plan.failures.len(),
            total,
            completed,
            failed: total - completed,
        };
        self.finish_pass(&report).await;
        Some(report)
    }

    /// Run one rebalancing pass. Returns `None` if a pass is already running.
    pub async fn rebalance_once(&self) -> Option<PassReport> {
        let Some(_guard) = PassGuard::acquire(&self.rebalancing) else {
            warn!("[placement] Rebalance pass still running, skipping");
            return None;
        };
        let started = Utc::now();
        let actions = {
            let fleet = self.fleet.read().await;
            let running = self.running.lock().await.clone();
            let mut rng = self.rng.lock().await;
            plan::plan_rebalance(&fleet, &running, &self.settings, Instant::now(), &mut *rng)
        };
        if !actions.is_empty() {
            info!("[placement] Rebalancing {} workspaces", actions.len());
        }
        let (total, completed) = self.dispatch(actions).await;
        let report = PassReport {
            kind: PassKind::Rebalance,
            started,
            finished: Utc::now(),
            counts: PassCounts::default(),
            unplaceable: 0,
            total,
            completed,
            failed: total - completed,
        };
        self.finish_pass(&report).await;
        Some(report)
    }

    async fn finish_pass(&self, report: &PassReport) {
        if report.total > 0 {
            info!(
                "[placement] {:?} pass finished: {}/{} actions completed in {} ms",
                report.kind,
                report.completed,
                report.total,
                (report.finished - report.started).num_milliseconds()
            );
        }
        *self.last_pass.lock().await = Some(report.clone());
    }

    /// Run actions with bounded concurrency under one shared deadline.
    ///
    /// Each workspace is claimed before its action starts; actions for a
    /// workspace another pass claimed since planning are dropped. Returns
    /// how many actions were started and how many succeeded.
    async fn dispatch(&self, actions: Vec<Action>) -> (usize, usize) {
        let actions: Vec<Action> = {
            let mut running = self.running.lock().await;
            actions
                .into_iter()
                .filter(|action| {
                    let claimed = running.insert(action.workspace());
                    if !claimed {
                        debug!("[placement] Workspace {} already has an action, dropping {}", action.workspace(), action);
                    }
                    claimed
                })
                .collect()
        };
        if actions.is_empty() {
            return (0, 0);
        }
        let total = actions.len();
        let deadline = Instant::now() + self.settings.action_timeout();
        let results: Vec<bool> = stream::iter(actions)
            .map(|action| self.run_action(action, deadline))
            .buffer_unordered(self.settings.max_outstanding_actions.max(1))
            .collect()
            .await;
        (total, results.into_iter().filter(|ok| *ok).count())
    }

    async fn run_action(&self, action: Action, deadline: Instant) -> bool {
        let workspace = action.workspace();
        let result = if Instant::now() >= deadline {
            Err(PlacementError::ActionTimeout { workspace })
        } else {
            match tokio::time::timeout_at(deadline, self.execute(&action)).await {
                Ok(result) => result,
                Err(_) => Err(PlacementError::ActionTimeout { workspace }),
            }
        };
        self.running.lock().await.remove(&workspace);

        let error = match &result {
            Ok(()) => {
                debug!("[placement] Finished {}", action);
                None
            }
            Err(e) => {
                warn!("[placement] {} failed for workspace {}: {}", action.kind(), workspace, e);
                Some(e.to_string())
            }
        };
        let mut history = self.history.lock().await;
        history.push_back(ActionRecord {
            action,
            finished: Utc::now(),
            error,
        });
        while history.len() > MAX_ACTION_HISTORY {
            history.pop_front();
        }
        result.is_ok()
    }

    async fn execute(&self, action: &Action) -> Result<(), PlacementError> {
        match action {
            Action::Copy {
                workspace,
                source,
                destination,
            }
            | Action::Backup {
                workspace,
                source,
                destination,
            } => self.copy(*workspace, source, destination).await,
            Action::Delete { workspace, node } => self.delete(*workspace, node).await,
            Action::Move {
                workspace,
                source,
                destination,
            } => {
                self.copy(*workspace, source, destination).await?;
                let active = self
                    .fleet
                    .read()
                    .await
                    .replica(*workspace, source)
                    .is_some_and(|r| r.active);
                if active {
                    info!(
                        "[placement] Workspace {} became active on {}, keeping that copy",
                        workspace, source
                    );
                    return Ok(());
                }
                self.delete(*workspace, source).await
            }
        }
    }

    async fn client(&self, id: &str) -> Result<Arc<dyn NodeClient>, PlacementError> {
        self.clients
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PlacementError::UnknownNode(id.to_string()))
    }

    async fn copy(&self, workspace: WorkspaceId, source: &str, destination: &str) -> Result<(), PlacementError> {
        let address = self
            .fleet
            .read()
            .await
            .node(source)
            .map(|n| n.address.clone())
            .ok_or_else(|| PlacementError::UnknownNode(source.to_string()))?;
        let client = self.client(destination).await?;
        let result = client
            .copy(workspace, &address)
            .await
            .map_err(|e| PlacementError::Node {
                node: destination.to_string(),
                source: e,
            })?;
        self.fleet.write().await.record_copy(destination, workspace, result);
        info!(
            "[placement] Copied workspace {} from {} to {}",
            workspace, source, destination
        );
        Ok(())
    }

    async fn delete(&self, workspace: WorkspaceId, node: &str) -> Result<(), PlacementError> {
        let client = self.client(node).await?;
        client.delete(workspace).await.map_err(|e| PlacementError::Node {
            node: node.to_string(),
            source: e,
        })?;
        self.fleet.write().await.remove_replica(node, workspace);
        info!("[placement] Deleted workspace {} from {}", workspace, node);
        Ok(())
    }

    pub async fn history(&self) -> Vec<ActionRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn last_pass(&self) -> Option<PassReport> {
        self.last_pass.lock().await.clone()
    }

    pub async fn moves(&self) -> Vec<RouteMove> {
        self.fleet.read().await.moves().cloned().collect()
    }

    pub async fn running(&self) -> HashSet<WorkspaceId> {
        self.running.lock().await.clone()
    }

    /// A copy of the current fleet view.
    pub async fn snapshot(&self) -> Fleet {
        self.fleet.read().await.clone()
    }

    /// Ingest poll reports and run passes on their intervals until the
    /// report channel closes. Passes run as their own tasks so a slow pass
    /// makes the next tick skip rather than queue.
    pub async fn run(self: Arc<Self>, mut reports: mpsc::Receiver<PollReport>) {
        let mut replicate = tokio::time::interval(self.settings.replicate_interval());
        replicate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rebalance = tokio::time::interval(self.settings.rebalance_interval());
        rebalance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        replicate.tick().await;
        rebalance.tick().await;

        loop {
            tokio::select! {
                _ = replicate.tick() => {
                    if !self.is_ready().await {
                        debug!("[placement] Not enough nodes yet, skipping replication");
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.replicate_once().await;
                    });
                }
                _ = rebalance.tick() => {
                    if !self.is_ready().await {
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.rebalance_once().await;
                    });
                }
                report = reports.recv() => match report {
                    Some(report) => self.ingest(report).await,
                    None => {
                        info!("[placement] Poll channel closed, stopping");
                        break;
                    }
                },
            }
        }
    }
}
