use super::{NodeClient, NodeError, NodeId, NodeLoad, WorkspaceStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a successful poll saw.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub load: NodeLoad,
    pub workspaces: Vec<WorkspaceStatus>,
}

/// Result of polling one node once.
#[derive(Debug)]
pub struct PollReport {
    pub node: NodeId,
    pub at: Instant,
    pub outcome: Result<NodeSnapshot, NodeError>,
}

/// Polls one node for load and status on a fixed interval.
pub struct NodePoller {
    client: Arc<dyn NodeClient>,
    interval: Duration,
    timeout: Duration,
}

impl NodePoller {
    pub fn new(client: Arc<dyn NodeClient>, interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            interval,
            timeout,
        }
    }

    pub async fn poll_once(&self) -> PollReport {
        let at = Instant::now();
        let work = async {
            let (load, workspaces) =
                tokio::try_join!(self.client.report_load(), self.client.poll_status())?;
            Ok::<_, NodeError>(NodeSnapshot { load, workspaces })
        };
        let outcome = match tokio::time::timeout(self.timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NodeError::Timeout(format!(
                "poll of node {} took longer than {:?}",
                self.client.id(),
                self.timeout
            ))),
        };
        PollReport {
            node: self.client.id().to_string(),
            at,
            outcome,
        }
    }

    /// Poll until the receiver is dropped. The wait between polls is the
    /// interval minus the time the poll took.
    pub fn spawn(self, reports: mpsc::Sender<PollReport>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let report = self.poll_once().await;
                if let Err(e) = &report.outcome {
                    tracing::debug!("Poll of node {} failed: {}", report.node, e);
                }
                if reports.send(report).await.is_err() {
                    break;
                }
                tokio::time::sleep(self.interval.saturating_sub(started.elapsed())).await;
            }
        })
    }
}
