//! colab-master: keeps every workspace replicated across the node fleet.
//!
//! Polls each configured node for load and the workspaces it holds, then
//! runs replication and rebalancing passes on their intervals.

use clap::Parser;
use colab_sync::cli::{init_tracing, MasterArgs};
use colab_sync::config::Settings;
use colab_sync::node::{HttpNodeClient, NodeClient, NodePoller};
use colab_sync::placement::PlacementController;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let args = MasterArgs::parse();
    init_tracing(args.log.as_deref());

    tracing::info!("[master] Starting colab-master");
    tracing::info!("[master] Config file: {:?}", args.config);

    let settings = match Settings::load(&args.config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("[master] Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let placement = settings.placement.clone();
    let controller = Arc::new(PlacementController::new(placement.clone()));

    let (tx, mut rx) = mpsc::channel(placement.nodes.len().max(1) * 4);
    let mut pollers = Vec::new();
    for node in &placement.nodes {
        let client = match HttpNodeClient::new(&node.id, &node.address, placement.poll_timeout()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::error!("[master] Cannot build client for node {}: {}", node.id, e);
                std::process::exit(1);
            }
        };
        controller.add_node(node, client.clone()).await;
        let client: Arc<dyn NodeClient> = client;
        let poller = NodePoller::new(client, placement.poll_interval(), placement.poll_timeout());
        pollers.push(poller.spawn(tx.clone()));
    }
    drop(tx);

    if !controller.is_ready().await {
        tracing::warn!(
            "[master] {} nodes configured, need {} before replicating",
            placement.nodes.len(),
            placement.repcount
        );
    }

    if args.once {
        let mut seen = HashSet::new();
        while seen.len() < placement.nodes.len() {
            let Some(report) = rx.recv().await else { break };
            seen.insert(report.node.clone());
            controller.ingest(report).await;
        }
        match controller.replicate_once().await {
            Some(report) => tracing::info!(
                "[master] Pass done: {}/{} actions completed, {} failed, {} without candidates",
                report.completed,
                report.total,
                report.failed,
                report.unplaceable
            ),
            None => tracing::warn!("[master] Pass skipped"),
        }
    } else {
        let run_handle = tokio::spawn(controller.clone().run(rx));

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("[master] Received Ctrl+C");
            }
        }
        run_handle.abort();
    }

    for poller in pollers {
        poller.abort();
    }
    tracing::info!("[master] Shutdown complete");
}
