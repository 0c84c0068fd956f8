//! Deciding what to do with each workspace. Pure functions over a
//! [`Fleet`] snapshot so a pass can be planned without holding locks.

use super::fleet::{Fleet, NodeState, Replica};
use super::PlacementError;
use crate::config::PlacementSettings;
use crate::node::NodeId;
use crate::WorkspaceId;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use tokio::time::Instant;

/// Priority bonus for workspaces someone is editing.
const ACTIVE_BONUS: usize = 1_000;
/// Priority bonus for workspaces with no backup copy.
const BACKUP_BONUS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// An action is already in flight.
    Running,
    /// Backups are enabled and no backup node holds a copy.
    BackupDeficient,
    UnderReplicated { have: usize, want: usize },
    OverReplicated { have: usize, want: usize },
    Correct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Copy {
        workspace: WorkspaceId,
        source: NodeId,
        destination: NodeId,
    },
    Delete {
        workspace: WorkspaceId,
        node: NodeId,
    },
    Backup {
        workspace: WorkspaceId,
        source: NodeId,
        destination: NodeId,
    },
    /// Copy to `destination`, then delete from `source`.
    Move {
        workspace: WorkspaceId,
        source: NodeId,
        destination: NodeId,
    },
}

impl Action {
    pub fn workspace(&self) -> WorkspaceId {
        match self {
            Action::Copy { workspace, .. }
            | Action::Delete { workspace, .. }
            | Action::Backup { workspace, .. }
            | Action::Move { workspace, .. } => *workspace,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Copy { .. } => "copy",
            Action::Delete { .. } => "delete",
            Action::Backup { .. } => "backup",
            Action::Move { .. } => "move",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Copy {
                workspace,
                source,
                destination,
            }
            | Action::Backup {
                workspace,
                source,
                destination,
            }
            | Action::Move {
                workspace,
                source,
                destination,
            } => write!(
                f,
                "{} workspace {} {} -> {}",
                self.kind(),
                workspace,
                source,
                destination
            ),
            Action::Delete { workspace, node } => {
                write!(f, "delete workspace {} from {}", workspace, node)
            }
        }
    }
}

/// Classification counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounts {
    pub running: usize,
    pub backup: usize,
    pub low: usize,
    pub high: usize,
    pub correct: usize,
}

#[derive(Debug, Default)]
pub struct PassPlan {
    pub counts: PassCounts,
    pub actions: Vec<Action>,
    /// Workspaces that need an action but have no valid candidate.
    pub failures: Vec<PlacementError>,
}

pub fn classify(
    fleet: &Fleet,
    workspace: WorkspaceId,
    running: &HashSet<WorkspaceId>,
    repcount: usize,
    now: Instant,
) -> Classification {
    if running.contains(&workspace) {
        return Classification::Running;
    }
    if fleet.backups_enabled() && !fleet.has_backup(workspace) {
        return Classification::BackupDeficient;
    }
    let have = fleet.live_copies(workspace, now).len();
    if have < repcount {
        Classification::UnderReplicated {
            have,
            want: repcount,
        }
    } else if have > repcount {
        Classification::OverReplicated {
            have,
            want: repcount,
        }
    } else {
        Classification::Correct
    }
}

/// Higher goes first.
pub fn priority(fleet: &Fleet, workspace: WorkspaceId, class: Classification) -> usize {
    let distance = match class {
        Classification::UnderReplicated { have, want } | Classification::OverReplicated { have, want } => {
            have.abs_diff(want)
        }
        _ => 0,
    };
    let mut priority = distance;
    if fleet.is_active(workspace) {
        priority += ACTIVE_BONUS;
    }
    if class == Classification::BackupDeficient {
        priority += BACKUP_BONUS;
    }
    priority
}

/// The copy to read from: the active one, else the newest. Backup nodes
/// are used only when nothing else holds a copy.
pub fn select_source<R: Rng + ?Sized>(
    fleet: &Fleet,
    workspace: WorkspaceId,
    rng: &mut R,
) -> Option<NodeId> {
    let mut hosts: Vec<(&NodeState, &Replica)> = fleet
        .replicas(workspace)
        .filter(|(node, _)| node.is_connected() && !node.excluded)
        .collect();
    hosts.shuffle(rng);
    hosts
        .into_iter()
        .max_by_key(|(node, replica)| (replica.active, !node.backup, replica.version))
        .map(|(node, _)| node.id.clone())
}

/// A serving node without a copy, least full first.
pub fn select_copy_destination<R: Rng + ?Sized>(
    fleet: &Fleet,
    workspace: WorkspaceId,
    rng: &mut R,
) -> Option<NodeId> {
    let mut candidates: Vec<&NodeState> = fleet
        .nodes()
        .filter(|node| node.is_eligible() && fleet.replica(workspace, &node.id).is_none())
        .collect();
    candidates.shuffle(rng);
    candidates
        .into_iter()
        .min_by(|a, b| a.disk_usage().total_cmp(&b.disk_usage()))
        .map(|node| node.id.clone())
}

/// A counted copy to drop: never an active one, unversioned copies first,
/// then the oldest.
pub fn select_delete<R: Rng + ?Sized>(
    fleet: &Fleet,
    workspace: WorkspaceId,
    now: Instant,
    rng: &mut R,
) -> Option<NodeId> {
    let mut copies: Vec<(&NodeState, &Replica)> = fleet
        .live_copies(workspace, now)
        .into_iter()
        .filter(|(_, replica)| !replica.active)
        .collect();
    copies.shuffle(rng);
    copies
        .into_iter()
        .min_by_key(|(_, replica)| replica.version)
        .map(|(node, _)| node.id.clone())
}

pub fn select_backup_destination<R: Rng + ?Sized>(
    fleet: &Fleet,
    workspace: WorkspaceId,
    rng: &mut R,
) -> Option<NodeId> {
    let candidates: Vec<&NodeState> = fleet
        .nodes()
        .filter(|node| {
            node.backup
                && !node.excluded
                && node.is_connected()
                && fleet.replica(workspace, &node.id).is_none()
        })
        .collect();
    candidates.choose(rng).map(|node| node.id.clone())
}

fn plan_workspace<R: Rng + ?Sized>(
    fleet: &Fleet,
    workspace: WorkspaceId,
    class: Classification,
    now: Instant,
    rng: &mut R,
) -> Result<Option<Action>, PlacementError> {
    let no_candidate = |reason: &str| PlacementError::NoCandidate {
        workspace,
        reason: reason.to_string(),
    };
    match class {
        Classification::Running | Classification::Correct => Ok(None),
        Classification::BackupDeficient => {
            let source = select_source(fleet, workspace, rng).ok_or_else(|| no_candidate("no source for backup"))?;
            let destination = select_backup_destination(fleet, workspace, rng)
                .ok_or_else(|| no_candidate("no backup node available"))?;
            Ok(Some(Action::Backup {
                workspace,
                source,
                destination,
            }))
        }
        Classification::UnderReplicated { .. } => {
            let source = select_source(fleet, workspace, rng).ok_or_else(|| no_candidate("no connected copy to read from"))?;
            let destination = select_copy_destination(fleet, workspace, rng)
                .ok_or_else(|| no_candidate("no eligible destination"))?;
            Ok(Some(Action::Copy {
                workspace,
                source,
                destination,
            }))
        }
        Classification::OverReplicated { .. } => {
            let node = select_delete(fleet, workspace, now, rng)
                .ok_or_else(|| no_candidate("every extra copy is active"))?;
            Ok(Some(Action::Delete { workspace, node }))
        }
    }
}

/// Classify every workspace and pick at most `actions_per_pass` actions,
/// most urgent first. Equal priorities are ordered randomly.
pub fn plan_replication<R: Rng + ?Sized>(
    fleet: &Fleet,
    running: &HashSet<WorkspaceId>,
    settings: &PlacementSettings,
    now: Instant,
    rng: &mut R,
) -> PassPlan {
    let mut plan = PassPlan::default();
    let mut pending: Vec<(usize, WorkspaceId, Classification)> = Vec::new();

    for workspace in fleet.workspaces() {
        let class = classify(fleet, workspace, running, settings.repcount, now);
        match class {
            Classification::Running => plan.counts.running += 1,
            Classification::BackupDeficient => plan.counts.backup += 1,
            Classification::UnderReplicated { .. } => plan.counts.low += 1,
            Classification::OverReplicated { .. } => plan.counts.high += 1,
            Classification::Correct => plan.counts.correct += 1,
        }
        if !matches!(class, Classification::Running | Classification::Correct) {
            pending.push((priority(fleet, workspace, class), workspace, class));
        }
    }

    pending.shuffle(rng);
    pending.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, workspace, class) in pending {
        if plan.actions.len() >= settings.actions_per_pass {
            break;
        }
        match plan_workspace(fleet, workspace, class, now, rng) {
            Ok(Some(action)) => plan.actions.push(action),
            Ok(None) => {}
            Err(e) => plan.failures.push(e),
        }
    }
    plan
}

/// Move copies off nodes whose disk usage is well above the fleet average.
pub fn plan_rebalance<R: Rng + ?Sized>(
    fleet: &Fleet,
    running: &HashSet<WorkspaceId>,
    settings: &PlacementSettings,
    now: Instant,
    rng: &mut R,
) -> Vec<Action> {
    let serving: Vec<&NodeState> = fleet
        .nodes()
        .filter(|node| node.is_eligible())
        .collect();
    if serving.len() < 2 {
        return Vec::new();
    }
    let average = serving.iter().map(|n| n.disk_usage()).sum::<f64>() / serving.len() as f64;
    let threshold = settings.rebalance_threshold;
    let sources: Vec<&NodeState> = serving
        .iter()
        .copied()
        .filter(|n| n.disk_usage() > average + threshold)
        .collect();
    let low: Vec<&NodeState> = serving
        .iter()
        .copied()
        .filter(|n| n.disk_usage() < average - threshold)
        .collect();

    let mut taken: HashSet<WorkspaceId> = running.clone();
    let mut actions = Vec::new();
    for source in sources {
        let mut candidates: Vec<WorkspaceId> = fleet
            .workspaces()
            .filter(|ws| !taken.contains(ws))
            .filter(|ws| fleet.replica(*ws, &source.id).is_some())
            .filter(|ws| !fleet.is_active(*ws))
            .filter(|ws| fleet.live_copies(*ws, now).len() >= settings.repcount)
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(settings.rebalance_sample);

        for workspace in candidates {
            if actions.len() >= settings.actions_per_pass {
                return actions;
            }
            let free = |node: &&NodeState| fleet.replica(workspace, &node.id).is_none();
            let preferred: Vec<&NodeState> = low.iter().copied().filter(free).collect();
            let destination = match preferred.choose(rng) {
                Some(node) => Some(*node),
                None => {
                    let fallback: Vec<&NodeState> = serving
                        .iter()
                        .copied()
                        .filter(|n| n.id != source.id)
                        .filter(free)
                        .collect();
                    fallback.choose(rng).copied()
                }
            };
            if let Some(destination) = destination {
                taken.insert(workspace);
                actions.push(Action::Move {
                    workspace,
                    source: source.id.clone(),
                    destination: destination.id.clone(),
                });
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::{NodeLoad, WorkspaceStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn fleet_with(nodes: &[(&str, bool, f64)]) -> Fleet {
        let mut fleet = Fleet::new(Duration::from_secs(10), 2);
        for (id, backup, disk) in nodes {
            fleet.add_node(&NodeConfig {
                id: id.to_string(),
                address: format!("{}:80", id),
                backup: *backup,
                excluded: false,
            });
            fleet.record_status(
                id,
                NodeLoad {
                    loadavg: 0.1,
                    mem_free: 0.9,
                    disk_usage: *disk,
                },
                &[],
            );
        }
        fleet
    }

    fn host(fleet: &mut Fleet, node: &str, statuses: &[(WorkspaceId, Option<u64>, bool)]) {
        let load = fleet.node(node).unwrap().load.unwrap();
        let statuses: Vec<WorkspaceStatus> = statuses
            .iter()
            .map(|(id, version, active)| WorkspaceStatus {
                id: *id,
                version: *version,
                active: *active,
            })
            .collect();
        fleet.record_status(node, load, &statuses);
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[tokio::test(start_paused = true)]
    async fn test_classification() {
        let mut fleet = fleet_with(&[("a", false, 0.1), ("b", false, 0.1), ("c", false, 0.1)]);
        host(&mut fleet, "a", &[(1, Some(1), false), (2, Some(1), false)]);
        host(&mut fleet, "b", &[(2, Some(1), false)]);
        host(&mut fleet, "c", &[(2, Some(1), false)]);
        let now = Instant::now();
        let none = HashSet::new();
        assert_eq!(
            classify(&fleet, 1, &none, 3, now),
            Classification::UnderReplicated { have: 1, want: 3 }
        );
        assert_eq!(classify(&fleet, 2, &none, 3, now), Classification::Correct);
        assert_eq!(
            classify(&fleet, 2, &none, 2, now),
            Classification::OverReplicated { have: 3, want: 2 }
        );
        let running = HashSet::from([2]);
        assert_eq!(classify(&fleet, 2, &running, 3, now), Classification::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_deficient_first() {
        let mut fleet = fleet_with(&[("a", false, 0.1), ("b", false, 0.1), ("bk", true, 0.1)]);
        host(&mut fleet, "a", &[(1, Some(3), false)]);
        let plan = plan_replication(&fleet, &HashSet::new(), &PlacementSettings::default(), Instant::now(), &mut rng());
        assert_eq!(plan.counts.backup, 1);
        assert_eq!(
            plan.actions,
            vec![Action::Backup {
                workspace: 1,
                source: "a".into(),
                destination: "bk".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_prefers_newest_then_destination_least_full() {
        let mut fleet = fleet_with(&[("a", false, 0.5), ("b", false, 0.5), ("c", false, 0.9), ("d", false, 0.2)]);
        host(&mut fleet, "a", &[(1, Some(2), false)]);
        host(&mut fleet, "b", &[(1, Some(4), false)]);
        let mut rng = rng();
        assert_eq!(select_source(&fleet, 1, &mut rng).as_deref(), Some("b"));
        assert_eq!(select_copy_destination(&fleet, 1, &mut rng).as_deref(), Some("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_prefers_unversioned_and_skips_active() {
        let mut fleet = fleet_with(&[("a", false, 0.1), ("b", false, 0.1), ("c", false, 0.1), ("d", false, 0.1)]);
        host(&mut fleet, "a", &[(1, Some(1), true)]);
        host(&mut fleet, "b", &[(1, Some(2), false)]);
        host(&mut fleet, "c", &[(1, None, false)]);
        host(&mut fleet, "d", &[(1, Some(3), false)]);
        let now = Instant::now();
        assert_eq!(select_delete(&fleet, 1, now, &mut rng()).as_deref(), Some("c"));

        host(&mut fleet, "c", &[]);
        assert_eq!(select_delete(&fleet, 1, now, &mut rng()).as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_reported() {
        let mut fleet = fleet_with(&[("a", false, 0.1)]);
        host(&mut fleet, "a", &[(1, Some(1), false)]);
        let plan = plan_replication(&fleet, &HashSet::new(), &PlacementSettings::default(), Instant::now(), &mut rng());
        assert!(plan.actions.is_empty());
        assert!(matches!(
            plan.failures.as_slice(),
            [PlacementError::NoCandidate { workspace: 1, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_workspaces_jump_the_queue() {
        let mut fleet = fleet_with(&[("a", false, 0.1), ("b", false, 0.1), ("c", false, 0.1), ("d", false, 0.1)]);
        host(&mut fleet, "a", &[(1, Some(1), false), (2, Some(1), true)]);
        host(&mut fleet, "b", &[(2, Some(1), false)]);
        let settings = PlacementSettings {
            actions_per_pass: 1,
            ..PlacementSettings::default()
        };
        let plan = plan_replication(&fleet, &HashSet::new(), &settings, Instant::now(), &mut rng());
        assert_eq!(plan.counts.low, 2);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].workspace(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_moves_off_full_node() {
        let mut fleet = fleet_with(&[("a", false, 0.9), ("b", false, 0.35), ("c", false, 0.35), ("d", false, 0.0)]);
        host(&mut fleet, "a", &[(1, Some(1), false), (2, Some(1), true)]);
        host(&mut fleet, "b", &[(1, Some(1), false), (2, Some(1), false)]);
        host(&mut fleet, "c", &[(1, Some(1), false), (2, Some(1), false)]);
        let actions = plan_rebalance(&fleet, &HashSet::new(), &PlacementSettings::default(), Instant::now(), &mut rng());
        assert_eq!(
            actions,
            vec![Action::Move {
                workspace: 1,
                source: "a".into(),
                destination: "d".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_falls_back_when_low_nodes_hold_the_workspace() {
        let mut fleet = fleet_with(&[("a", false, 0.9), ("b", false, 0.1), ("c", false, 0.5), ("d", false, 0.5)]);
        for node in ["a", "b", "c"] {
            host(&mut fleet, node, &[(1, Some(1), false)]);
        }
        let actions = plan_rebalance(&fleet, &HashSet::new(), &PlacementSettings::default(), Instant::now(), &mut rng());
        assert_eq!(
            actions,
            vec![Action::Move {
                workspace: 1,
                source: "a".into(),
                destination: "d".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_balanced_fleet_left_alone() {
        let mut fleet = fleet_with(&[("a", false, 0.4), ("b", false, 0.45), ("c", false, 0.4)]);
        host(&mut fleet, "a", &[(1, Some(1), false)]);
        let actions = plan_rebalance(&fleet, &HashSet::new(), &PlacementSettings::default(), Instant::now(), &mut rng());
        assert!(actions.is_empty());
    }
}
